// System
use std::sync::Arc;

// Third Party
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::{
    cluster::ClusterApi,
    model::{
        ChangeEvent, NamespaceTree, NodeEnvelope, ResourceKind, WatchedObject, WorkloadEnvelope,
        WorkloadTree,
    },
    sink::ReportingSink,
    snapshot::pod_trees,
    supervisor::EventQueues,
};

/// Drains every per-kind queue, enriches each change with live pod detail and forwards it to the
/// reporting endpoint. Failed deliveries are logged and dropped.
pub struct EventRouter {
    api: Arc<dyn ClusterApi>,
    sink: Arc<dyn ReportingSink>,
    cluster_name: String,
    queues: EventQueues,
}

impl EventRouter {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        sink: Arc<dyn ReportingSink>,
        cluster_name: &str,
        queues: EventQueues,
    ) -> Self {
        Self {
            api,
            sink,
            cluster_name: cluster_name.to_string(),
            queues,
        }
    }

    /// Route events until `stop` fires or every queue is closed. Events still queued at that
    /// point are dropped.
    pub async fn run(mut self, stop: CancellationToken) {
        info!("Event router started");
        let mut deployments_open = true;
        let mut stateful_sets_open = true;
        let mut nodes_open = true;
        while deployments_open || stateful_sets_open || nodes_open {
            // No priority between kinds: whichever queue is ready first wins.
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = self.queues.deployments.recv(), if deployments_open => {
                    deployments_open = event.is_some();
                    event
                }
                event = self.queues.stateful_sets.recv(), if stateful_sets_open => {
                    stateful_sets_open = event.is_some();
                    event
                }
                event = self.queues.nodes.recv(), if nodes_open => {
                    nodes_open = event.is_some();
                    event
                }
            };
            if let Some(event) = event {
                self.route(event).await;
            }
        }
        info!("Event router stopped");
    }

    async fn route(&self, event: ChangeEvent) {
        info!(
            "{} {}, Name: {}, Namespace: {}",
            event.change_type(),
            event.kind(),
            event.object_name(),
            event.namespace()
        );
        let observed_at = event.observed_at();
        let payload = match self.envelope(event).await {
            Ok(payload) => payload,
            Err(error) => {
                error!("Failed to serialize change event: {}", error);
                return;
            }
        };
        match self.sink.deliver(&payload).await {
            Ok(()) => debug!("Delivered change observed at {}", observed_at.to_rfc3339()),
            Err(error) => warn!("Dropping change event: {}", error),
        }
    }

    /// Serialize `event` into its wire envelope. Workload pods are looked up now, not when the
    /// change was observed.
    async fn envelope(&self, event: ChangeEvent) -> Result<String, serde_json::Error> {
        let timestamp = Utc::now().timestamp();
        let change_type = event.change_type();
        let kind = event.kind();
        let namespace = event.namespace().to_string();
        let match_labels = event.object().match_labels().unwrap_or_default();
        let pods = match kind {
            ResourceKind::Node => Vec::new(),
            _ => match pod_trees(self.api.as_ref(), &namespace, &match_labels).await {
                Ok(pods) => pods,
                Err(error) => {
                    warn!(
                        "Failed to list pods for {} {}/{}: {:#}",
                        kind,
                        namespace,
                        event.object_name(),
                        error
                    );
                    Vec::new()
                }
            },
        };

        let mut tree = NamespaceTree {
            name: namespace,
            ..Default::default()
        };
        match event.into_object() {
            WatchedObject::Node(node) => {
                return serde_json::to_string(&NodeEnvelope {
                    cluster_name: self.cluster_name.clone(),
                    timestamp,
                    resource_type: ResourceKind::Node,
                    change_type,
                    node: *node,
                });
            }
            WatchedObject::Deployment(deployment) => tree.deployments.push(WorkloadTree {
                spec: *deployment,
                pods,
            }),
            WatchedObject::StatefulSet(stateful_set) => tree.stateful_sets.push(WorkloadTree {
                spec: *stateful_set,
                pods,
            }),
        }
        serde_json::to_string(&WorkloadEnvelope {
            cluster_name: self.cluster_name.clone(),
            timestamp,
            resource_type: kind,
            change_type,
            namespaces: vec![tree],
        })
    }
}
