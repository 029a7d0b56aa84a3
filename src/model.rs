// System
use std::{collections::BTreeMap, fmt};

// Third Party
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, StatefulSet},
        core::v1::{Container, Node, Pod},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use serde::{Deserialize, Serialize};

/// The resource kinds that are mirrored to the reporting endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
    Node,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
        ResourceKind::Node,
    ];

    /// Node status is rewritten by every kubelet heartbeat, so only node arrivals and departures
    /// are reported.
    pub fn tracks(self, change_type: ChangeType) -> bool {
        match self {
            ResourceKind::Deployment | ResourceKind::StatefulSet => true,
            ResourceKind::Node => change_type != ChangeType::Modified,
        }
    }

    /// Nodes are cluster scoped and bypass namespace filtering.
    pub fn is_namespaced(self) -> bool {
        self != ResourceKind::Node
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Node => "Node",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The `matchLabels` of a workload's pod selector. Empty when the workload has no spec or the
/// selector only uses expressions.
pub fn selector_labels(selector: Option<&LabelSelector>) -> BTreeMap<String, String> {
    selector
        .and_then(|selector| selector.match_labels.clone())
        .unwrap_or_default()
}

/// A resource payload, tagged with its kind once when it comes off the API.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchedObject {
    Deployment(Box<Deployment>),
    StatefulSet(Box<StatefulSet>),
    Node(Box<Node>),
}

impl WatchedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchedObject::Deployment(_) => ResourceKind::Deployment,
            WatchedObject::StatefulSet(_) => ResourceKind::StatefulSet,
            WatchedObject::Node(_) => ResourceKind::Node,
        }
    }

    pub fn name(&self) -> String {
        let name = match self {
            WatchedObject::Deployment(deployment) => deployment.metadata.name.as_ref(),
            WatchedObject::StatefulSet(stateful_set) => stateful_set.metadata.name.as_ref(),
            WatchedObject::Node(node) => node.metadata.name.as_ref(),
        };
        name.cloned().unwrap_or_default()
    }

    /// Empty for nodes.
    pub fn namespace(&self) -> String {
        let namespace = match self {
            WatchedObject::Deployment(deployment) => deployment.metadata.namespace.as_ref(),
            WatchedObject::StatefulSet(stateful_set) => stateful_set.metadata.namespace.as_ref(),
            WatchedObject::Node(_) => None,
        };
        namespace.cloned().unwrap_or_default()
    }

    /// The `matchLabels` of a workload's pod selector, `None` for nodes.
    pub fn match_labels(&self) -> Option<BTreeMap<String, String>> {
        match self {
            WatchedObject::Deployment(deployment) => Some(selector_labels(
                deployment.spec.as_ref().map(|spec| &spec.selector),
            )),
            WatchedObject::StatefulSet(stateful_set) => Some(selector_labels(
                stateful_set.spec.as_ref().map(|spec| &spec.selector),
            )),
            WatchedObject::Node(_) => None,
        }
    }
}

/// One raw notification from a watch subscription.
#[derive(Debug, Clone)]
pub struct WatchNotification {
    pub change_type: ChangeType,
    pub object: WatchedObject,
}

/// A qualifying change, produced by one watch session and consumed by the router.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    kind: ResourceKind,
    change_type: ChangeType,
    namespace: String,
    object_name: String,
    object: WatchedObject,
    observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(change_type: ChangeType, object: WatchedObject) -> Self {
        Self {
            kind: object.kind(),
            change_type,
            namespace: object.namespace(),
            object_name: object.name(),
            object,
            observed_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn object(&self) -> &WatchedObject {
        &self.object
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn into_object(self) -> WatchedObject {
        self.object
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTree {
    pub spec: Pod,
    pub containers: Vec<Container>,
}

impl From<Pod> for PodTree {
    fn from(pod: Pod) -> Self {
        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.clone())
            .unwrap_or_default();
        Self {
            spec: pod,
            containers,
        }
    }
}

/// A workload together with the pods its selector currently matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadTree<T> {
    pub spec: T,
    pub pods: Vec<PodTree>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceTree {
    pub name: String,
    pub deployments: Vec<WorkloadTree<Deployment>>,
    pub stateful_sets: Vec<WorkloadTree<StatefulSet>>,
}

/// The full-cluster resource tree sent once at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster_name: String,
    pub timestamp: i64,
    pub cloud: String,
    pub namespaces: Vec<NamespaceTree>,
    pub nodes: Vec<Node>,
}

/// Per-event payload for Deployment and StatefulSet changes, scoped to a single namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEnvelope {
    pub cluster_name: String,
    pub timestamp: i64,
    pub resource_type: ResourceKind,
    pub change_type: ChangeType,
    pub namespaces: Vec<NamespaceTree>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEnvelope {
    pub cluster_name: String,
    pub timestamp: i64,
    pub resource_type: ResourceKind,
    pub change_type: ChangeType,
    pub node: Node,
}
