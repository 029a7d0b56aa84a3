//! In-memory doubles for the orchestration API and the reporting endpoint.

// System
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

// Third Party
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec},
        core::v1::{Container, Node, Pod, PodSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use tokio::time::Duration;

// Local
use crate::{
    cluster::{ClusterApi, WatchStream},
    model::{ChangeType, ResourceKind, WatchNotification, WatchedObject},
    sink::{ReportError, ReportingSink},
};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn deployment(namespace: &str, name: &str, selector: &[(&str, &str)]) -> WatchedObject {
    WatchedObject::Deployment(Box::new(Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels(selector)),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }))
}

pub fn stateful_set(namespace: &str, name: &str, selector: &[(&str, &str)]) -> WatchedObject {
    WatchedObject::StatefulSet(Box::new(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels(selector)),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }))
}

pub fn node(name: &str) -> WatchedObject {
    WatchedObject::Node(Box::new(Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }))
}

pub fn pod(
    namespace: &str,
    name: &str,
    pod_labels: &[(&str, &str)],
    containers: &[&str],
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|container| Container {
                    name: container.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn added(object: WatchedObject) -> WatchNotification {
    WatchNotification {
        change_type: ChangeType::Added,
        object,
    }
}

pub fn modified(object: WatchedObject) -> WatchNotification {
    WatchNotification {
        change_type: ChangeType::Modified,
        object,
    }
}

pub fn deleted(object: WatchedObject) -> WatchNotification {
    WatchNotification {
        change_type: ChangeType::Deleted,
        object,
    }
}

/// How a scripted subscription behaves once its notifications are used up.
enum ScriptEnd {
    Close,
    CloseAfter(Duration),
    Open,
    Fail(String),
}

/// One scripted subscription.
struct WatchScript {
    notifications: Vec<WatchNotification>,
    end: ScriptEnd,
}

/// A cluster whose objects and watch streams are scripted by the test.
#[derive(Default)]
pub struct FakeClusterApi {
    namespaces: Mutex<Vec<String>>,
    objects: Mutex<Vec<WatchedObject>>,
    pods: Mutex<Vec<Pod>>,
    scripts: Mutex<HashMap<ResourceKind, VecDeque<WatchScript>>>,
    list_failures: Mutex<HashMap<ResourceKind, usize>>,
    watch_failures: Mutex<HashMap<ResourceKind, usize>>,
    list_calls: Mutex<HashMap<ResourceKind, usize>>,
    watch_calls: Mutex<HashMap<ResourceKind, usize>>,
    pod_queries: AtomicUsize,
}

impl FakeClusterApi {
    pub fn add_namespace(&self, name: &str) {
        self.namespaces.lock().unwrap().push(name.to_string());
    }

    pub fn add_object(&self, object: WatchedObject) {
        self.objects.lock().unwrap().push(object);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    /// The next subscription of `kind` yields `notifications` and then ends cleanly.
    pub fn script_closing_watch(&self, kind: ResourceKind, notifications: Vec<WatchNotification>) {
        self.push_script(kind, notifications, ScriptEnd::Close);
    }

    /// Like `script_closing_watch`, but the subscription only ends `after` it was opened.
    pub fn script_watch_closing_after(
        &self,
        kind: ResourceKind,
        notifications: Vec<WatchNotification>,
        after: Duration,
    ) {
        self.push_script(kind, notifications, ScriptEnd::CloseAfter(after));
    }

    /// The next subscription of `kind` yields `notifications` and then stays open.
    pub fn script_open_watch(&self, kind: ResourceKind, notifications: Vec<WatchNotification>) {
        self.push_script(kind, notifications, ScriptEnd::Open);
    }

    /// The next subscription of `kind` yields `notifications` and then a stream error.
    pub fn script_failing_watch(
        &self,
        kind: ResourceKind,
        notifications: Vec<WatchNotification>,
        message: &str,
    ) {
        self.push_script(kind, notifications, ScriptEnd::Fail(message.to_string()));
    }

    fn push_script(
        &self,
        kind: ResourceKind,
        notifications: Vec<WatchNotification>,
        end: ScriptEnd,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(WatchScript { notifications, end });
    }

    pub fn fail_next_lists(&self, kind: ResourceKind, count: usize) {
        self.list_failures.lock().unwrap().insert(kind, count);
    }

    /// The next `count` watch calls for `kind` fail before any subscription is opened.
    pub fn fail_next_watches(&self, kind: ResourceKind, count: usize) {
        self.watch_failures.lock().unwrap().insert(kind, count);
    }

    pub fn list_calls(&self, kind: ResourceKind) -> usize {
        self.list_calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn watch_calls(&self, kind: ResourceKind) -> usize {
        self.watch_calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    /// List and watch calls made on behalf of watch sessions, across all kinds.
    pub fn session_activity(&self) -> usize {
        let lists: usize = self.list_calls.lock().unwrap().values().sum();
        let watches: usize = self.watch_calls.lock().unwrap().values().sum();
        lists + watches
    }

    pub fn pod_queries(&self) -> usize {
        self.pod_queries.load(Ordering::SeqCst)
    }

    fn objects_of(&self, kind: ResourceKind) -> Vec<WatchedObject> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|object| object.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<WatchedObject>, anyhow::Error> {
        *self.list_calls.lock().unwrap().entry(kind).or_default() += 1;
        if let Some(remaining) = self.list_failures.lock().unwrap().get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow::anyhow!("connection refused"));
            }
        }
        Ok(self.objects_of(kind))
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        _timeout: Duration,
    ) -> Result<WatchStream, anyhow::Error> {
        *self.watch_calls.lock().unwrap().entry(kind).or_default() += 1;
        if let Some(remaining) = self.watch_failures.lock().unwrap().get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow::anyhow!("watch request timed out"));
            }
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        let Some(script) = script else {
            return Ok(stream::pending().boxed());
        };
        let notifications = stream::iter(script.notifications.into_iter().map(Ok));
        let stream = match script.end {
            ScriptEnd::Close => notifications.boxed(),
            ScriptEnd::CloseAfter(after) => {
                let closing = stream::once(tokio::time::sleep(after)).filter_map(|()| {
                    future::ready(None::<Result<WatchNotification, anyhow::Error>>)
                });
                notifications.chain(closing).boxed()
            }
            ScriptEnd::Open => notifications.chain(stream::pending()).boxed(),
            ScriptEnd::Fail(message) => notifications
                .chain(stream::once(future::ready(Err(anyhow::anyhow!(message)))))
                .boxed(),
        };
        Ok(stream)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, anyhow::Error> {
        Ok(self.namespaces.lock().unwrap().clone())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, anyhow::Error> {
        Ok(self
            .objects_of(ResourceKind::Deployment)
            .into_iter()
            .filter_map(|object| match object {
                WatchedObject::Deployment(deployment)
                    if deployment.metadata.namespace.as_deref() == Some(namespace) =>
                {
                    Some(*deployment)
                }
                _ => None,
            })
            .collect())
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
    ) -> Result<Vec<StatefulSet>, anyhow::Error> {
        Ok(self
            .objects_of(ResourceKind::StatefulSet)
            .into_iter()
            .filter_map(|object| match object {
                WatchedObject::StatefulSet(stateful_set)
                    if stateful_set.metadata.namespace.as_deref() == Some(namespace) =>
                {
                    Some(*stateful_set)
                }
                _ => None,
            })
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, anyhow::Error> {
        self.pod_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| {
                let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
                match_labels
                    .iter()
                    .all(|(key, value)| pod_labels.get(key) == Some(value))
            })
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, anyhow::Error> {
        Ok(self
            .objects_of(ResourceKind::Node)
            .into_iter()
            .filter_map(|object| match object {
                WatchedObject::Node(node) => Some(*node),
                _ => None,
            })
            .collect())
    }
}

/// Records every payload; rejects the first `failures` deliveries.
#[derive(Default)]
pub struct FakeReportingSink {
    failures: AtomicUsize,
    payloads: Mutex<Vec<String>>,
    probe: Option<Arc<FakeClusterApi>>,
    activity_at_delivery: Mutex<Vec<usize>>,
}

impl FakeReportingSink {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    /// Record how much watch-session activity `api` has seen at each delivery.
    pub fn observing(mut self, api: Arc<FakeClusterApi>) -> Self {
        self.probe = Some(api);
        self
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn payloads_json(&self) -> Vec<serde_json::Value> {
        self.payloads()
            .iter()
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }

    pub fn activity_at_delivery(&self) -> Vec<usize> {
        self.activity_at_delivery.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportingSink for FakeReportingSink {
    async fn deliver(&self, payload: &str) -> Result<(), ReportError> {
        self.payloads.lock().unwrap().push(payload.to_string());
        if let Some(api) = &self.probe {
            self.activity_at_delivery
                .lock()
                .unwrap()
                .push(api.session_activity());
        }
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if rejected {
            Err(ReportError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}
