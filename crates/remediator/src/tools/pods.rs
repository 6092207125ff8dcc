//! Pod-scoped checks and Deployment remediations.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use regex::Regex;
use remediator_config::ExecutionMode;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::cluster::ClusterApi;
use super::quantity::{MemoryPolicy, MemorySizing};
use super::{ToolArgs, ToolError, ToolResult};

/// Cap on the match excerpts returned with event evidence.
const MAX_MATCHES: usize = 5;

static OOM_KILLED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\boom[- ]?killed\b").unwrap());

/// Container inside the pod a remediation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerTarget {
    pub(crate) fn from_args(args: &ToolArgs) -> Result<Self, ToolError> {
        Ok(Self {
            namespace: args.required("namespace")?,
            pod: args.required("pod")?,
            container: args.required("container")?,
        })
    }
}

/// Lowercased "reason message" text of an event.
fn event_text(event: &Event) -> String {
    format!(
        "{} {}",
        event.reason.as_deref().unwrap_or(""),
        event.message.as_deref().unwrap_or("")
    )
    .to_lowercase()
}

fn event_excerpt(event: &Event) -> String {
    let reason = event.reason.as_deref().unwrap_or("");
    let message = event.message.as_deref().unwrap_or("");
    match (reason.is_empty(), message.is_empty()) {
        (false, false) => format!("{reason}: {message}"),
        (false, true) => reason.to_string(),
        _ => message.to_string(),
    }
}

/// Best timestamp for ordering events: last seen, then event time, then creation.
fn event_timestamp(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

pub(crate) fn mentions_oom(text: &str) -> bool {
    OOM_KILLED.is_match(text)
        || text.contains("oomkilled")
        || text.contains("out of memory")
        || text.contains("memory limit too low")
}

pub(crate) fn mentions_sandbox_failure(text: &str) -> bool {
    (text.contains("failedcreatepodsandbox") || text.contains("pod sandbox"))
        && (text.contains("cannot start a stopped process")
            || text.contains("cannot start a container that has stopped"))
}

fn mentions_imagepull(text: &str) -> bool {
    text.contains("imagepullbackoff")
        || text.contains("errimagepull")
        || text.contains("failed to pull image")
}

/// Evidence extracted from a pod's event stream.
#[derive(Debug, Default, PartialEq)]
pub struct EventScan {
    pub events: Vec<Value>,
    pub oom_matches: Vec<String>,
    pub sandbox_failure_matches: Vec<String>,
}

impl EventScan {
    /// Order events newest first, keep `limit` of them and scan for known
    /// failure signatures.
    #[must_use]
    pub fn scan(mut events: Vec<Event>, limit: usize) -> Self {
        events.sort_by_key(|e| std::cmp::Reverse(event_timestamp(e)));
        events.truncate(limit.max(1));

        let mut scan = Self::default();
        for event in &events {
            let text = event_text(event);
            if mentions_oom(&text) {
                scan.oom_matches.push(event_excerpt(event));
            }
            if mentions_sandbox_failure(&text) {
                scan.sandbox_failure_matches.push(event_excerpt(event));
            }
            scan.events.push(json!({
                "type": event.type_.as_deref().unwrap_or(""),
                "reason": event.reason.as_deref().unwrap_or(""),
                "message": event.message.as_deref().unwrap_or(""),
                "count": event.count,
                "ts": event_timestamp(event).map(|t| t.to_rfc3339()),
            }));
        }
        scan
    }

    fn into_evidence(self, namespace: &str, pod: &str) -> Value {
        json!({
            "namespace": namespace,
            "pod": pod,
            "oom_detected": !self.oom_matches.is_empty(),
            "oom_matches": self.oom_matches.into_iter().take(MAX_MATCHES).collect::<Vec<_>>(),
            "sandbox_failure_detected": !self.sandbox_failure_matches.is_empty(),
            "sandbox_failure_matches": self
                .sandbox_failure_matches
                .into_iter()
                .take(MAX_MATCHES)
                .collect::<Vec<_>>(),
            "events": self.events,
        })
    }
}

pub async fn get_pod_events(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    limit: u32,
) -> Result<ToolResult, ToolError> {
    let events = cluster.list_pod_events(namespace, pod).await?;
    let scan = EventScan::scan(events, limit as usize);
    debug!(
        namespace,
        pod,
        events = scan.events.len(),
        oom = !scan.oom_matches.is_empty(),
        sandbox_failure = !scan.sandbox_failure_matches.is_empty(),
        "Scanned pod events"
    );
    Ok(ToolResult::evidence(scan.into_evidence(namespace, pod)))
}

/// Statuses of the containers to inspect: all, or only `container` when given.
fn container_statuses<'a>(
    pod: &'a Pod,
    container: Option<&'a str>,
) -> impl Iterator<Item = &'a ContainerStatus> + 'a {
    pod.status
        .iter()
        .flat_map(|s| s.container_statuses.iter().flatten())
        .filter(move |cs| container.map_or(true, |c| cs.name == c))
}

/// Detection evidence shared by the `check_*` tools.
fn detection(
    key: &str,
    namespace: &str,
    pod: &str,
    detected_container: Option<String>,
    requested_container: Option<&str>,
    reasons: BTreeSet<String>,
) -> ToolResult {
    ToolResult::evidence(json!({
        "namespace": namespace,
        "pod": pod,
        key: !reasons.is_empty(),
        "container": detected_container
            .or_else(|| requested_container.map(ToString::to_string))
            .unwrap_or_default(),
        "reasons": reasons.into_iter().collect::<Vec<_>>(),
    }))
}

pub async fn check_imagepullbackoff(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod_name: &str,
    container: Option<&str>,
) -> Result<ToolResult, ToolError> {
    let pod = cluster.get_pod(namespace, pod_name).await?;

    let mut reasons = BTreeSet::new();
    let mut detected_container = None;
    for cs in container_statuses(&pod, container) {
        let waiting = cs
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref());
        if let Some(reason @ ("ImagePullBackOff" | "ErrImagePull")) = waiting {
            reasons.insert(format!("pod_status_waiting_reason:{reason}"));
            detected_container = Some(cs.name.clone());
        }
    }

    let events = cluster.list_pod_events(namespace, pod_name).await?;
    if events.iter().any(|e| mentions_imagepull(&event_text(e))) {
        reasons.insert("event_mentions_imagepull".to_string());
    }

    Ok(detection(
        "imagepull_detected",
        namespace,
        pod_name,
        detected_container,
        container,
        reasons,
    ))
}

pub async fn check_oom(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod_name: &str,
    container: Option<&str>,
) -> Result<ToolResult, ToolError> {
    let pod = cluster.get_pod(namespace, pod_name).await?;

    let mut reasons = BTreeSet::new();
    let mut detected_container = None;
    for cs in container_statuses(&pod, container) {
        let current = cs.state.as_ref().and_then(|s| s.terminated.as_ref());
        let last = cs.last_state.as_ref().and_then(|s| s.terminated.as_ref());
        let oom_killed = [current, last]
            .into_iter()
            .flatten()
            .any(|t| t.reason.as_deref() == Some("OOMKilled"));
        if oom_killed {
            reasons.insert("pod_status_terminated_reason:OOMKilled".to_string());
            detected_container = Some(cs.name.clone());
        }
    }

    let events = cluster.list_pod_events(namespace, pod_name).await?;
    if events.iter().any(|e| mentions_oom(&event_text(e))) {
        reasons.insert("event_mentions_oom".to_string());
    }

    Ok(detection(
        "oom_detected",
        namespace,
        pod_name,
        detected_container,
        container,
        reasons,
    ))
}

/// Walk pod → ReplicaSet → Deployment.
pub async fn resolve_deployment(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod_name: &str,
) -> Result<String, ToolError> {
    let pod = cluster.get_pod(namespace, pod_name).await?;
    let replica_sets = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|r| r.kind == "ReplicaSet");

    for owner in replica_sets {
        let rs = cluster.get_replica_set(namespace, &owner.name).await?;
        let deployment = rs
            .metadata
            .owner_references
            .iter()
            .flatten()
            .find(|r| r.kind == "Deployment");
        if let Some(deployment) = deployment {
            return Ok(deployment.name.clone());
        }
    }
    Err(ToolError::PodNotOwnedByDeployment)
}

fn container_patch(container: &str, fields: Value) -> Value {
    let mut entry = json!({ "name": container });
    if let (Some(entry), Value::Object(fields)) = (entry.as_object_mut(), fields) {
        entry.extend(fields);
    }
    json!({ "spec": { "template": { "spec": { "containers": [entry] } } } })
}

pub async fn fix_imagepullbackoff(
    cluster: &dyn ClusterApi,
    target: &ContainerTarget,
    fallback_image: &str,
    mode: ExecutionMode,
) -> Result<ToolResult, ToolError> {
    let deployment = resolve_deployment(cluster, &target.namespace, &target.pod).await?;
    let action = format!(
        "patch_image:{}/{}/{}:{}",
        target.namespace, deployment, target.container, fallback_image
    );

    if mode.is_apply() {
        let patch = container_patch(&target.container, json!({ "image": fallback_image }));
        cluster
            .patch_deployment(&target.namespace, &deployment, &patch)
            .await?;
        info!(namespace = %target.namespace, %deployment, image = fallback_image, "Patched deployment image");
    }

    Ok(ToolResult::action(action, mode).with_evidence("deployment", deployment))
}

pub async fn increase_memory_limit(
    cluster: &dyn ClusterApi,
    target: &ContainerTarget,
    policy: &MemoryPolicy,
    mode: ExecutionMode,
) -> Result<ToolResult, ToolError> {
    let deployment_name = resolve_deployment(cluster, &target.namespace, &target.pod).await?;
    let deployment = cluster
        .get_deployment(&target.namespace, &deployment_name)
        .await?;

    let current = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.iter().find(|c| c.name == target.container))
        .and_then(|c| c.resources.as_ref())
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get("memory"))
        .map(|q| q.0.clone())
        .ok_or(ToolError::MissingCurrentMemoryLimit)?;

    let evidence = |new_limit: &str| {
        json!({
            "deployment": deployment_name,
            "container": target.container,
            "old_limit": current,
            "new_limit": new_limit,
        })
    };

    let new_limit = match policy.size(&current)? {
        MemorySizing::AtCeiling => {
            info!(
                namespace = %target.namespace,
                deployment = %deployment_name,
                current_limit = %current,
                "Memory limit already at or above ceiling"
            );
            let mut result = ToolResult::evidence(evidence(&current))
                .with_evidence("reason", "current_limit_at_or_above_max");
            result.noop = true;
            result.mode = Some(mode);
            return Ok(result);
        }
        MemorySizing::Resize { new_limit } => new_limit,
    };

    let action = format!(
        "patch_memory_limit:{}/{}/{}:{}->{}",
        target.namespace, deployment_name, target.container, current, new_limit
    );

    if mode.is_apply() {
        let patch = container_patch(
            &target.container,
            json!({ "resources": { "limits": { "memory": new_limit } } }),
        );
        cluster
            .patch_deployment(&target.namespace, &deployment_name, &patch)
            .await?;
    }

    Ok(ToolResult::action(action, mode).merge_evidence(evidence(&new_limit)))
}

pub async fn delete_pod(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    mode: ExecutionMode,
) -> Result<ToolResult, ToolError> {
    if mode.is_apply() {
        cluster.delete_pod(namespace, pod).await?;
    }
    Ok(ToolResult::action(format!("delete_pod:{namespace}/{pod}"), mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn event(reason: &str, message: &str, secs: i64) -> Event {
        let mut e: Event = serde_json::from_value(json!({
            "metadata": {"name": format!("ev-{secs}"), "namespace": "ns1"},
            "involvedObject": {"kind": "Pod", "name": "p1"},
            "reason": reason,
            "message": message,
            "type": "Warning",
        }))
        .unwrap();
        e.last_timestamp = DateTime::from_timestamp(secs, 0).map(Time);
        e
    }

    #[test]
    fn test_oom_text_patterns() {
        assert!(mentions_oom("oomkilled container app"));
        assert!(mentions_oom("container was oom-killed"));
        assert!(mentions_oom("process oom killed by kernel"));
        assert!(mentions_oom("task ran out of memory"));
        assert!(mentions_oom("hint: memory limit too low"));
        assert!(!mentions_oom("back-off restarting failed container"));
    }

    #[test]
    fn test_sandbox_failure_requires_both_parts() {
        assert!(mentions_sandbox_failure(
            "failedcreatepodsandbox failed to create pod sandbox: cannot start a stopped process"
        ));
        assert!(!mentions_sandbox_failure("failedcreatepodsandbox network not ready"));
        assert!(!mentions_sandbox_failure("cannot start a stopped process"));
    }

    #[test]
    fn test_scan_orders_newest_first_and_limits() {
        let events = vec![
            event("Scheduled", "assigned", 100),
            event("OOMKilling", "Memory cgroup out of memory", 300),
            event("Pulled", "image pulled", 200),
        ];
        let scan = EventScan::scan(events, 2);
        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.events[0]["reason"], "OOMKilling");
        assert_eq!(scan.events[1]["reason"], "Pulled");
        assert_eq!(scan.oom_matches, vec!["OOMKilling: Memory cgroup out of memory"]);
        assert!(scan.sandbox_failure_matches.is_empty());
    }

    #[test]
    fn test_evidence_caps_matches() {
        let events = (0..8)
            .map(|i| event("OOMKilled", "container oomkilled", i))
            .collect();
        let evidence = EventScan::scan(events, 25).into_evidence("ns1", "p1");
        assert_eq!(evidence["oom_detected"], true);
        assert_eq!(evidence["oom_matches"].as_array().unwrap().len(), MAX_MATCHES);
        assert_eq!(evidence["events"].as_array().unwrap().len(), 8);
        assert_eq!(evidence["sandbox_failure_detected"], false);
    }

    #[test]
    fn test_container_patch_shape() {
        let patch = container_patch("app", json!({"image": "nginx:1.27"}));
        assert_eq!(
            patch,
            json!({"spec": {"template": {"spec": {"containers": [{"name": "app", "image": "nginx:1.27"}]}}}})
        );
    }
}
