//! Shared fixtures for the remediator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use remediator::alerts::{AlertmanagerAlert, AlertmanagerPayload, Labels};
use remediator::oracle::{Decision, DecisionOracle, DecisionRequest, OracleError};
use remediator::runbook::RunbookStore;
use remediator::tools::{ClusterApi, ClusterError, ToolRegistry};
use remediator::workflow::{WorkflowExecutor, WorkflowSettings};
use remediator_config::{ExecutionMode, ToolsConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Fake cluster
// ============================================================================

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    pods: HashMap<Key, Pod>,
    replica_sets: HashMap<Key, ReplicaSet>,
    deployments: HashMap<Key, Deployment>,
    events: HashMap<Key, Vec<Event>>,
    nodes: HashMap<String, Node>,
    /// node -> pods scheduled on it
    node_pods: HashMap<String, Vec<Pod>>,
}

/// In-process cluster. Reads come from seeded objects; mutations are
/// recorded as `verb:target` strings and applied where later reads care.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    mutations: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pod `pod` owned by ReplicaSet `<deployment>-7d9f` owned by Deployment
    /// `deployment`, whose single container carries `memory_limit`.
    pub fn with_deployment_pod(
        self,
        namespace: &str,
        deployment: &str,
        pod: &str,
        container: &str,
        memory_limit: &str,
    ) -> Self {
        let rs_name = format!("{deployment}-7d9f");
        let pod_obj: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": pod,
                "namespace": namespace,
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "ReplicaSet",
                    "name": rs_name,
                    "uid": "rs-uid"
                }]
            },
            "spec": {"containers": [{"name": container, "image": "registry.local/app:broken"}]}
        }))
        .unwrap();
        let rs: ReplicaSet = serde_json::from_value(json!({
            "metadata": {
                "name": rs_name,
                "namespace": namespace,
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": deployment,
                    "uid": "deploy-uid"
                }]
            }
        }))
        .unwrap();
        let deploy: Deployment = serde_json::from_value(json!({
            "metadata": {"name": deployment, "namespace": namespace},
            "spec": {
                "selector": {"matchLabels": {"app": deployment}},
                "template": {
                    "metadata": {"labels": {"app": deployment}},
                    "spec": {"containers": [{
                        "name": container,
                        "image": "registry.local/app:broken",
                        "resources": {"limits": {"memory": memory_limit}}
                    }]}
                }
            }
        }))
        .unwrap();

        {
            let mut state = self.state.lock().unwrap();
            state.pods.insert(key(namespace, pod), pod_obj);
            state.replica_sets.insert(key(namespace, &rs_name), rs);
            state.deployments.insert(key(namespace, deployment), deploy);
        }
        self
    }

    /// Bare pod with no owner.
    pub fn with_bare_pod(self, namespace: &str, pod: &str) -> Self {
        let pod_obj: Pod = serde_json::from_value(json!({
            "metadata": {"name": pod, "namespace": namespace}
        }))
        .unwrap();
        self.state.lock().unwrap().pods.insert(key(namespace, pod), pod_obj);
        self
    }

    pub fn with_event(self, namespace: &str, pod: &str, reason: &str, message: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let events = state.events.entry(key(namespace, pod)).or_default();
            let event: Event = serde_json::from_value(json!({
                "metadata": {"name": format!("{pod}.{}", events.len()), "namespace": namespace},
                "involvedObject": {"kind": "Pod", "name": pod, "namespace": namespace},
                "type": "Warning",
                "reason": reason,
                "message": message,
                "count": 1,
                "lastTimestamp": format!("2026-10-01T00:00:{:02}Z", events.len())
            }))
            .unwrap();
            events.push(event);
        }
        self
    }

    pub fn with_node(self, name: &str, ready: bool) -> Self {
        self.with_node_state(name, ready, false, false)
    }

    /// Node with explicit readiness, cordon flag and memory pressure.
    pub fn with_node_state(
        self,
        name: &str,
        ready: bool,
        unschedulable: bool,
        memory_pressure: bool,
    ) -> Self {
        let status = |on: bool| if on { "True" } else { "False" };
        let node: Node = serde_json::from_value(json!({
            "metadata": {"name": name},
            "spec": {"unschedulable": unschedulable},
            "status": {"conditions": [
                {"type": "Ready", "status": status(ready), "reason": "KubeletNotReady"},
                {"type": "MemoryPressure", "status": status(memory_pressure)}
            ]}
        }))
        .unwrap();
        self.state.lock().unwrap().nodes.insert(name.to_string(), node);
        self
    }

    /// Pod scheduled on `node`; `owner_kind` set to `DaemonSet` keeps it
    /// out of drains.
    pub fn with_node_pod(self, node: &str, namespace: &str, pod: &str, owner_kind: &str) -> Self {
        let pod_obj: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": pod,
                "namespace": namespace,
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": owner_kind,
                    "name": "owner",
                    "uid": "owner-uid"
                }]
            },
            "spec": {"nodeName": node, "containers": [{"name": "app"}]}
        }))
        .unwrap();
        self.state
            .lock()
            .unwrap()
            .node_pods
            .entry(node.to_string())
            .or_default()
            .push(pod_obj);
        self
    }

    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    fn record(&self, mutation: String) {
        self.mutations.lock().unwrap().push(mutation);
    }
}

fn not_found(kind: &'static str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        name: name.to_string(),
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("pod", name))
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet, ClusterError> {
        self.state
            .lock()
            .unwrap()
            .replica_sets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("replicaset", name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        self.deployment(namespace, name)
            .ok_or_else(|| not_found("deployment", name))
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClusterError> {
        if self.deployment(namespace, name).is_none() {
            return Err(not_found("deployment", name));
        }
        self.record(format!("patch_deployment:{namespace}/{name}:{patch}"));
        Ok(())
    }

    async fn list_pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<Event>, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .get(&key(namespace, pod))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        if self
            .state
            .lock()
            .unwrap()
            .pods
            .remove(&key(namespace, name))
            .is_none()
        {
            return Err(not_found("pod", name));
        }
        self.record(format!("delete_pod:{namespace}/{name}"));
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("node", name))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        if !self.state.lock().unwrap().nodes.contains_key(name) {
            return Err(not_found("node", name));
        }
        self.record(format!("patch_node:{name}:{patch}"));
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .node_pods
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn evict_pod(&self, namespace: &str, name: &str, _grace: u32) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        for pods in state.node_pods.values_mut() {
            pods.retain(|p| {
                !(p.metadata.namespace.as_deref() == Some(namespace)
                    && p.metadata.name.as_deref() == Some(name))
            });
        }
        drop(state);
        self.record(format!("evict_pod:{namespace}/{name}"));
        Ok(())
    }
}

// ============================================================================
// Scripted oracle
// ============================================================================

/// Replays queued decisions in order and records every request. An empty
/// queue answers as a model that returned no tool call.
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Decision>>,
    requests: Mutex<Vec<DecisionRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            script: Mutex::new(decisions.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Every call sleeps for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of concurrent `decide` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.ok_or(OracleError::NoToolCall)
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn runbooks() -> Arc<RunbookStore> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("runbooks");
    Arc::new(RunbookStore::load_dir(&dir).unwrap())
}

pub fn executor(
    cluster: Arc<FakeCluster>,
    oracle: Arc<dyn DecisionOracle>,
    mode: ExecutionMode,
) -> WorkflowExecutor {
    let tools = ToolRegistry::from_config(cluster, &ToolsConfig::default()).unwrap();
    WorkflowExecutor::new(
        runbooks(),
        oracle,
        Arc::new(tools),
        WorkflowSettings {
            mode,
            ..WorkflowSettings::default()
        },
    )
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn alert(fingerprint: &str, pairs: &[(&str, &str)]) -> AlertmanagerAlert {
    AlertmanagerAlert {
        status: "firing".to_string(),
        labels: labels(pairs),
        fingerprint: fingerprint.to_string(),
        ..AlertmanagerAlert::default()
    }
}

pub fn payload(alerts: Vec<AlertmanagerAlert>) -> AlertmanagerPayload {
    serde_json::from_value::<AlertmanagerPayload>(json!({
        "receiver": "remediator",
        "status": "firing",
        "alerts": alerts
    }))
    .unwrap()
}
