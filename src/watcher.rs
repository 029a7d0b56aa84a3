// System
use std::sync::Arc;

// Third Party
use futures::StreamExt;
use tokio::{sync::mpsc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Local
use crate::{
    cluster::{ClusterApi, WatchStream},
    filter::NamespaceFilter,
    model::{ChangeEvent, ResourceKind, WatchNotification},
};

/// Counts the replay a fresh subscription emits for objects the list call already returned.
///
/// Objects created between the list call and the subscription are indistinguishable from replay:
/// they are absorbed if they arrive before the count is reached, and a racing creation can make
/// a genuine change spill over into streaming early. Nothing here tries to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialBurst {
    expected: usize,
    observed: usize,
}

impl InitialBurst {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            observed: 0,
        }
    }

    /// Absorb one replayed notification. Returns `false` once nothing is left to absorb, in
    /// which case the notification is a genuine change.
    pub fn absorb(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.observed += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.observed >= self.expected
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn observed(&self) -> usize {
        self.observed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Syncing(InitialBurst),
    Streaming,
    Closed,
}

/// How a session run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The subscription ended on its own; the session should be run again.
    CleanStop,
    /// A stop was requested; the session must not be run again.
    Closed,
}

/// One list+watch cycle for a single resource kind, feeding qualifying changes into that kind's
/// bounded queue.
pub struct ResourceWatchSession {
    kind: ResourceKind,
    api: Arc<dyn ClusterApi>,
    filter: Arc<NamespaceFilter>,
    output: mpsc::Sender<ChangeEvent>,
    stop: CancellationToken,
    watch_timeout: Duration,
    phase: SessionPhase,
}

impl ResourceWatchSession {
    pub fn new(
        kind: ResourceKind,
        api: Arc<dyn ClusterApi>,
        filter: Arc<NamespaceFilter>,
        output: mpsc::Sender<ChangeEvent>,
        stop: CancellationToken,
        watch_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            api,
            filter,
            output,
            stop,
            watch_timeout,
            phase: SessionPhase::Init,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn watch_timeout(&self) -> Duration {
        self.watch_timeout
    }

    /// Run one list+watch cycle. Errors from the list or watch calls are returned as is; the
    /// caller decides whether and when to run the session again.
    pub async fn run(&mut self) -> Result<SessionOutcome, anyhow::Error> {
        if self.phase == SessionPhase::Closed {
            return Ok(SessionOutcome::Closed);
        }
        self.phase = SessionPhase::Init;
        let Some((mut stream, mut burst)) = self.subscribe().await? else {
            return Ok(self.close());
        };

        loop {
            let next = tokio::select! {
                _ = self.stop.cancelled() => return Ok(self.close()),
                next = stream.next() => next,
            };
            let notification = match next {
                Some(Ok(notification)) => notification,
                Some(Err(error)) => {
                    self.phase = SessionPhase::Init;
                    return Err(error);
                }
                None => {
                    info!("{} watch ended", self.kind);
                    self.phase = SessionPhase::Init;
                    return Ok(SessionOutcome::CleanStop);
                }
            };
            if !self.kind.tracks(notification.change_type) {
                continue;
            }

            if burst.absorb() {
                if burst.is_complete() {
                    debug!(
                        "{} watch absorbed {} replayed objects, streaming",
                        self.kind,
                        burst.observed()
                    );
                    self.phase = SessionPhase::Streaming;
                } else {
                    self.phase = SessionPhase::Syncing(burst);
                }
                continue;
            }
            if let Some(event) = self.qualify(notification) {
                if !self.publish(event).await {
                    return Ok(self.close());
                }
            }
        }
    }

    /// INIT: list the kind, then open a bounded subscription. `None` means a stop arrived first.
    async fn subscribe(&mut self) -> Result<Option<(WatchStream, InitialBurst)>, anyhow::Error> {
        info!("Starting {} watch...", self.kind);
        let listed = tokio::select! {
            _ = self.stop.cancelled() => return Ok(None),
            listed = self.api.list(self.kind) => listed?,
        };
        let stream = tokio::select! {
            _ = self.stop.cancelled() => return Ok(None),
            stream = self.api.watch(self.kind, self.watch_timeout) => stream?,
        };
        let burst = InitialBurst::new(listed.len());
        self.phase = if burst.is_complete() {
            SessionPhase::Streaming
        } else {
            SessionPhase::Syncing(burst)
        };
        debug!(
            "{} watch expects {} replayed objects",
            self.kind,
            burst.expected()
        );
        Ok(Some((stream, burst)))
    }

    /// Turn a streamed notification into a `ChangeEvent` unless its namespace is excluded.
    fn qualify(&self, notification: WatchNotification) -> Option<ChangeEvent> {
        let event = ChangeEvent::new(notification.change_type, notification.object);
        if self.kind.is_namespaced() && !self.filter.allows(event.namespace()) {
            debug!(
                "Ignoring {} {} in excluded namespace {}",
                self.kind,
                event.object_name(),
                event.namespace()
            );
            return None;
        }
        Some(event)
    }

    /// Enqueue `event`, waiting while the queue is full. Returns `false` if a stop arrived first
    /// or the consumer is gone.
    async fn publish(&self, event: ChangeEvent) -> bool {
        debug!(
            "{} {} {}/{}",
            event.change_type(),
            self.kind,
            event.namespace(),
            event.object_name()
        );
        tokio::select! {
            _ = self.stop.cancelled() => false,
            sent = self.output.send(event) => sent.is_ok(),
        }
    }

    fn close(&mut self) -> SessionOutcome {
        info!("Closing {} watch", self.kind);
        self.phase = SessionPhase::Closed;
        SessionOutcome::Closed
    }
}
