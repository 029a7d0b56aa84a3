// System
use std::collections::BTreeMap;

// Third Party
use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::{Namespace, Node, Pod},
};
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    Client,
};
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::debug;

// Local
use crate::{
    model::{ChangeType, ResourceKind, WatchNotification, WatchedObject},
    utils::format_label_selector,
};

/// Stream of notifications from one watch subscription. It ends when the subscription times out
/// or the connection drops.
pub type WatchStream = BoxStream<'static, Result<WatchNotification, anyhow::Error>>;

/// The slice of the orchestration API the relay needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every object of `kind` across all namespaces.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<WatchedObject>, anyhow::Error>;

    /// Subscribe to `kind` across all namespaces for at most `timeout`. The subscription first
    /// replays the current objects as `Added` before following new changes.
    async fn watch(
        &self,
        kind: ResourceKind,
        timeout: Duration,
    ) -> Result<WatchStream, anyhow::Error>;

    async fn list_namespaces(&self) -> Result<Vec<String>, anyhow::Error>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, anyhow::Error>;

    async fn list_stateful_sets(&self, namespace: &str)
        -> Result<Vec<StatefulSet>, anyhow::Error>;

    /// List the pods in `namespace` whose labels match every entry of `match_labels`.
    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, anyhow::Error>;

    async fn list_nodes(&self) -> Result<Vec<Node>, anyhow::Error>;
}

/// Map one raw watch event to a notification. Bookmarks carry no object and are dropped;
/// server-side `ERROR` events become stream errors.
fn notification<K>(
    event: Result<WatchEvent<K>, kube::Error>,
    wrap: fn(K) -> WatchedObject,
) -> Option<Result<WatchNotification, anyhow::Error>> {
    let (change_type, object) = match event {
        Ok(WatchEvent::Added(object)) => (ChangeType::Added, object),
        Ok(WatchEvent::Modified(object)) => (ChangeType::Modified, object),
        Ok(WatchEvent::Deleted(object)) => (ChangeType::Deleted, object),
        Ok(WatchEvent::Bookmark(_)) => return None,
        Ok(WatchEvent::Error(response)) => {
            return Some(Err(anyhow::Error::new(kube::Error::Api(response))))
        }
        Err(error) => return Some(Err(anyhow::Error::new(error))),
    };
    Some(Ok(WatchNotification {
        change_type,
        object: wrap(object),
    }))
}

/// `ClusterApi` backed by a live API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }

    async fn list_all<K>(&self) -> Result<Vec<K>, anyhow::Error>
    where
        K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Open a watch on `api` and tag every notification with its kind.
    async fn watch_with<K>(
        api: Api<K>,
        timeout: Duration,
        wrap: fn(K) -> WatchedObject,
    ) -> Result<WatchStream, anyhow::Error>
    where
        K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    {
        let watch_params = WatchParams::default().timeout(timeout.as_secs() as u32);
        // Resource version "0" makes the server replay its current state before streaming changes.
        let stream = api.watch(&watch_params, "0").await?;
        let stream = stream.filter_map(move |event| future::ready(notification(event, wrap)));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<WatchedObject>, anyhow::Error> {
        let objects: Vec<WatchedObject> = match kind {
            ResourceKind::Deployment => self
                .list_all::<Deployment>()
                .await?
                .into_iter()
                .map(|deployment| WatchedObject::Deployment(Box::new(deployment)))
                .collect(),
            ResourceKind::StatefulSet => self
                .list_all::<StatefulSet>()
                .await?
                .into_iter()
                .map(|stateful_set| WatchedObject::StatefulSet(Box::new(stateful_set)))
                .collect(),
            ResourceKind::Node => self
                .list_nodes()
                .await?
                .into_iter()
                .map(|node| WatchedObject::Node(Box::new(node)))
                .collect(),
        };
        debug!("Listed {} {} objects", objects.len(), kind);
        Ok(objects)
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        timeout: Duration,
    ) -> Result<WatchStream, anyhow::Error> {
        match kind {
            ResourceKind::Deployment => {
                Self::watch_with(Api::<Deployment>::all(self.client.clone()), timeout, |d| {
                    WatchedObject::Deployment(Box::new(d))
                })
                .await
            }
            ResourceKind::StatefulSet => {
                Self::watch_with(Api::<StatefulSet>::all(self.client.clone()), timeout, |s| {
                    WatchedObject::StatefulSet(Box::new(s))
                })
                .await
            }
            ResourceKind::Node => {
                Self::watch_with(Api::<Node>::all(self.client.clone()), timeout, |n| {
                    WatchedObject::Node(Box::new(n))
                })
                .await
            }
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, anyhow::Error> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter_map(|namespace| namespace.metadata.name)
            .collect())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, anyhow::Error> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.list(&ListParams::default()).await?.items)
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
    ) -> Result<Vec<StatefulSet>, anyhow::Error> {
        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(stateful_sets.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, anyhow::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !match_labels.is_empty() {
            params = params.labels(&format_label_selector(match_labels));
        }
        Ok(pods.list(&params).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, anyhow::Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }
}
