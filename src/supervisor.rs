// System
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

// Third Party
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// Local
use crate::{
    cluster::ClusterApi,
    filter::NamespaceFilter,
    model::{ChangeEvent, ResourceKind},
    utils::Backoff,
    watcher::{ResourceWatchSession, SessionOutcome},
};

/// How long `stop` waits for the watch tasks to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer ends of the per-kind event queues.
pub struct EventSenders {
    pub deployments: mpsc::Sender<ChangeEvent>,
    pub stateful_sets: mpsc::Sender<ChangeEvent>,
    pub nodes: mpsc::Sender<ChangeEvent>,
}

impl EventSenders {
    fn sender_for(&self, kind: ResourceKind) -> mpsc::Sender<ChangeEvent> {
        match kind {
            ResourceKind::Deployment => self.deployments.clone(),
            ResourceKind::StatefulSet => self.stateful_sets.clone(),
            ResourceKind::Node => self.nodes.clone(),
        }
    }
}

/// Consumer ends of the per-kind event queues.
pub struct EventQueues {
    pub deployments: mpsc::Receiver<ChangeEvent>,
    pub stateful_sets: mpsc::Receiver<ChangeEvent>,
    pub nodes: mpsc::Receiver<ChangeEvent>,
}

/// One bounded FIFO queue per resource kind. A full queue blocks only its own producer.
pub fn event_queues(capacity: usize) -> (EventSenders, EventQueues) {
    let (deployments_tx, deployments_rx) = mpsc::channel(capacity);
    let (stateful_sets_tx, stateful_sets_rx) = mpsc::channel(capacity);
    let (nodes_tx, nodes_rx) = mpsc::channel(capacity);
    (
        EventSenders {
            deployments: deployments_tx,
            stateful_sets: stateful_sets_tx,
            nodes: nodes_tx,
        },
        EventQueues {
            deployments: deployments_rx,
            stateful_sets: stateful_sets_rx,
            nodes: nodes_rx,
        },
    )
}

/// Runs one watch session per resource kind and restarts it whenever its subscription ends.
pub struct WatchSupervisor {
    api: Arc<dyn ClusterApi>,
    filter: Arc<NamespaceFilter>,
    watch_timeout: Duration,
    senders: Mutex<Option<EventSenders>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl WatchSupervisor {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        filter: Arc<NamespaceFilter>,
        senders: EventSenders,
        watch_timeout: Duration,
    ) -> Self {
        Self {
            api,
            filter,
            watch_timeout,
            senders: Mutex::new(Some(senders)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn one task per resource kind. Only the first call has any effect.
    pub fn start(&self) {
        let Some(senders) = self.senders.lock().expect("supervisor lock poisoned").take() else {
            warn!("Watch supervisor already started");
            return;
        };
        let mut tasks = self.tasks.lock().expect("supervisor lock poisoned");
        for kind in ResourceKind::ALL {
            // Each session gets its own stop signal, all cancelled by `stop`.
            let session = ResourceWatchSession::new(
                kind,
                self.api.clone(),
                self.filter.clone(),
                senders.sender_for(kind),
                self.shutdown.child_token(),
                self.watch_timeout,
            );
            tasks.push(tokio::spawn(supervise(session, self.shutdown.clone())));
        }
        info!("Started {} watch tasks", tasks.len());
        // The queues close once every task has dropped its sender.
    }

    /// Signal every session to stop and wait for all watch tasks to exit. Calls after the first
    /// return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping watch tasks...");
        self.shutdown.cancel();
        // Never started: dropping the senders closes the queues.
        self.senders.lock().expect("supervisor lock poisoned").take();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("supervisor lock poisoned"));
        match tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        error!("Watch task failed: {}", error);
                    }
                }
                info!("All watch tasks stopped");
            }
            Err(_) => error!(
                "Watch tasks did not stop within {} seconds",
                STOP_TIMEOUT.as_secs()
            ),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Run `session` until it is closed. A subscription that lasted at least half its timeout is
/// restarted right away; one that ended sooner, or failed, is restarted after a backoff delay.
async fn supervise(mut session: ResourceWatchSession, shutdown: CancellationToken) {
    let kind = session.kind();
    let full_run = session.watch_timeout() / 2;
    let mut backoff = Backoff::default();
    loop {
        let started = Instant::now();
        match session.run().await {
            Ok(SessionOutcome::Closed) => break,
            Ok(SessionOutcome::CleanStop) if started.elapsed() >= full_run => {
                backoff.reset();
                continue;
            }
            Ok(SessionOutcome::CleanStop) => warn!(
                "{} watch closed after {} ms, sooner than expected",
                kind,
                started.elapsed().as_millis()
            ),
            Err(error) => error!("{} watch failed: {:#}", kind, error),
        }
        let delay = backoff.next_delay();
        warn!(
            "Retrying {} watch in {} ms...",
            kind,
            delay.as_millis()
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("{} watch task exited", kind);
}
