// System
use std::{collections::BTreeMap, sync::Arc};

// Third Party
use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::{
    cluster::ClusterApi,
    filter::NamespaceFilter,
    model::{selector_labels, ClusterSnapshot, NamespaceTree, PodTree, WorkloadTree},
    sink::ReportingSink,
    utils::Backoff,
};

/// The pods in `namespace` currently matched by a workload selector, with their containers.
pub async fn pod_trees(
    api: &dyn ClusterApi,
    namespace: &str,
    match_labels: &BTreeMap<String, String>,
) -> Result<Vec<PodTree>, anyhow::Error> {
    let pods = api.list_pods(namespace, match_labels).await?;
    Ok(pods.into_iter().map(PodTree::from).collect())
}

/// Builds the full-cluster snapshot and registers it with the reporting endpoint.
pub struct SnapshotBuilder {
    api: Arc<dyn ClusterApi>,
    sink: Arc<dyn ReportingSink>,
    filter: Arc<NamespaceFilter>,
    cluster_name: String,
    cloud: String,
}

impl SnapshotBuilder {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        sink: Arc<dyn ReportingSink>,
        filter: Arc<NamespaceFilter>,
        cluster_name: &str,
        cloud: &str,
    ) -> Self {
        Self {
            api,
            sink,
            filter,
            cluster_name: cluster_name.to_string(),
            cloud: cloud.to_string(),
        }
    }

    pub async fn build(&self) -> Result<ClusterSnapshot, anyhow::Error> {
        info!("Collecting cluster resources...");
        let mut namespaces = Vec::new();
        for name in self.api.list_namespaces().await? {
            if !self.filter.allows(&name) {
                continue;
            }
            namespaces.push(self.namespace_tree(name).await?);
        }
        let nodes = self.api.list_nodes().await.context("Failed to list nodes")?;
        info!(
            "Collected {} namespaces and {} nodes",
            namespaces.len(),
            nodes.len()
        );
        Ok(ClusterSnapshot {
            cluster_name: self.cluster_name.clone(),
            timestamp: Utc::now().timestamp(),
            cloud: self.cloud.clone(),
            namespaces,
            nodes,
        })
    }

    async fn namespace_tree(&self, name: String) -> Result<NamespaceTree, anyhow::Error> {
        let mut tree = NamespaceTree::default();

        let deployments = self
            .api
            .list_deployments(&name)
            .await
            .with_context(|| format!("Failed to list deployments in {}", name))?;
        if deployments.is_empty() {
            debug!("Namespace {} has no deployments", name);
        }
        for deployment in deployments {
            let labels = selector_labels(deployment.spec.as_ref().map(|spec| &spec.selector));
            let pods = pod_trees(self.api.as_ref(), &name, &labels).await?;
            tree.deployments.push(WorkloadTree {
                spec: deployment,
                pods,
            });
        }

        let stateful_sets = self
            .api
            .list_stateful_sets(&name)
            .await
            .with_context(|| format!("Failed to list statefulsets in {}", name))?;
        if stateful_sets.is_empty() {
            debug!("Namespace {} has no statefulsets", name);
        }
        for stateful_set in stateful_sets {
            let labels = selector_labels(stateful_set.spec.as_ref().map(|spec| &spec.selector));
            let pods = pod_trees(self.api.as_ref(), &name, &labels).await?;
            tree.stateful_sets.push(WorkloadTree {
                spec: stateful_set,
                pods,
            });
        }

        tree.name = name;
        Ok(tree)
    }

    /// Build a fresh snapshot and submit it once.
    pub async fn build_and_register(&self) -> Result<(), anyhow::Error> {
        let snapshot = self.build().await?;
        let payload = serde_json::to_string(&snapshot)?;
        info!("Registering cluster {}...", self.cluster_name);
        self.sink.deliver(&payload).await?;
        info!("Cluster {} registered", self.cluster_name);
        Ok(())
    }

    /// Rebuild and resubmit until the endpoint accepts the snapshot. Returns `false` only if
    /// `stop` fires first.
    pub async fn register_until_accepted(&self, stop: &CancellationToken) -> bool {
        let mut backoff = Backoff::default();
        loop {
            let attempt = tokio::select! {
                _ = stop.cancelled() => return false,
                attempt = self.build_and_register() => attempt,
            };
            match attempt {
                Ok(()) => return true,
                Err(error) => {
                    error!("Registration failed: {:#}", error);
                    let delay = backoff.next_delay();
                    warn!("Retrying registration in {} seconds...", delay.as_secs());
                    tokio::select! {
                        _ = stop.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
