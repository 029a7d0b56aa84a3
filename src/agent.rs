// System
use std::sync::Arc;

// Third Party
use tokio_util::sync::CancellationToken;
use tracing::info;

// Local
use crate::{
    cluster::ClusterApi,
    config::RelayConfig,
    filter::NamespaceFilter,
    router::EventRouter,
    sink::ReportingSink,
    snapshot::SnapshotBuilder,
    supervisor::{event_queues, WatchSupervisor},
};

/// Registers the cluster once, then mirrors its changes until shut down.
pub struct RelayAgent {
    config: RelayConfig,
    api: Arc<dyn ClusterApi>,
    sink: Arc<dyn ReportingSink>,
    filter: Arc<NamespaceFilter>,
    shutdown: CancellationToken,
}

impl RelayAgent {
    pub fn new(
        config: RelayConfig,
        api: Arc<dyn ClusterApi>,
        sink: Arc<dyn ReportingSink>,
    ) -> Result<Self, anyhow::Error> {
        let filter = Arc::new(config.namespace_filter()?);
        Ok(Self {
            config,
            api,
            sink,
            filter,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling this token makes `run` stop every watch task and return.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the router, register the cluster (retrying until accepted), then start the watch
    /// tasks and serve until shutdown.
    pub async fn run(&self) -> Result<(), anyhow::Error> {
        let (senders, queues) = event_queues(self.config.queue_capacity);
        let router = EventRouter::new(
            self.api.clone(),
            self.sink.clone(),
            &self.config.cluster_name,
            queues,
        );
        let router_task = tokio::spawn(router.run(self.shutdown.child_token()));
        let supervisor = WatchSupervisor::new(
            self.api.clone(),
            self.filter.clone(),
            senders,
            self.config.watch_timeout,
        );
        let snapshot = SnapshotBuilder::new(
            self.api.clone(),
            self.sink.clone(),
            self.filter.clone(),
            &self.config.cluster_name,
            &self.config.cloud,
        );

        if snapshot.register_until_accepted(&self.shutdown).await {
            supervisor.start();
            self.shutdown.cancelled().await;
        }
        info!("Shutting down...");
        supervisor.stop().await;
        router_task.await?;
        info!("Relay stopped");
        Ok(())
    }
}
