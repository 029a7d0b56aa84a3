// System
use std::collections::BTreeMap;

// Third Party
use rand::Rng;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Default capacity of each per-kind event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default bound on a single watch subscription. The kube client rejects server-side watch
/// timeouts of 295 seconds or more.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_tracing(crate_name: &str, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},kube=warn",
            crate_name,
            level.to_string().to_lowercase()
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
pub fn setup_exit_hooks(shutdown: CancellationToken) -> Result<(), anyhow::Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Received signal {}, shutting down...", signal);
            shutdown.cancel();
        }
    });
    Ok(())
}

/// Render `match_labels` as an equality label selector, e.g. `app=web,tier=frontend`.
pub fn format_label_selector(match_labels: &BTreeMap<String, String>) -> String {
    match_labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Exponential backoff with jitter, used between failed watch sessions and failed
/// registration attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Returns the delay to wait now and doubles the delay for the next call, up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..500);
        let delay = self.current + Duration::from_millis(jitter);
        self.current = std::cmp::min(self.max, self.current * 2);
        delay
    }

    /// Successfully connected, so start over from the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
