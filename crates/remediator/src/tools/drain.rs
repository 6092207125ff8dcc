//! Node drain through the Eviction API.

use k8s_openapi::api::core::v1::Pod;
use remediator_config::ExecutionMode;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cluster::ClusterApi;
use super::{DrainSettings, ToolError, ToolResult};

const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Why a pod on the node is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MirrorPod,
    Daemonset,
    ProtectedNamespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodRef {
    pub namespace: String,
    pub pod: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPod {
    pub namespace: String,
    pub pod: String,
    pub reason: SkipReason,
}

/// Pods to evict and pods to leave in place.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainPlan {
    pub evict: Vec<PodRef>,
    pub skipped: Vec<SkippedPod>,
}

fn skip_reason(pod: &Pod, protected_namespace: &str) -> Option<SkipReason> {
    let meta = &pod.metadata;
    if meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_ANNOTATION))
    {
        return Some(SkipReason::MirrorPod);
    }
    if meta
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.kind == "DaemonSet")
    {
        return Some(SkipReason::Daemonset);
    }
    if meta.namespace.as_deref() == Some(protected_namespace) {
        return Some(SkipReason::ProtectedNamespace);
    }
    None
}

/// Split the pods on a node into eviction targets and skipped pods.
///
/// Mirror (static) pods, DaemonSet-owned pods and pods in the protected
/// namespace are never eviction targets.
#[must_use]
pub fn plan_drain(pods: &[Pod], protected_namespace: &str) -> DrainPlan {
    let mut plan = DrainPlan::default();
    for pod in pods {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        match skip_reason(pod, protected_namespace) {
            Some(reason) => plan.skipped.push(SkippedPod {
                namespace,
                pod: name,
                reason,
            }),
            None => plan.evict.push(PodRef {
                namespace,
                pod: name,
            }),
        }
    }
    plan
}

pub async fn drain_node(
    cluster: &dyn ClusterApi,
    node: &str,
    settings: &DrainSettings,
    timeout: Duration,
    mode: ExecutionMode,
) -> Result<ToolResult, ToolError> {
    let pods = cluster.list_pods_on_node(node).await?;
    let plan = plan_drain(&pods, &settings.protected_namespace);
    let action = format!("drain_node:{node}:evict={}", plan.evict.len());

    if !mode.is_apply() {
        info!(node, evict = plan.evict.len(), "Drain planned (recommend-only)");
        return Ok(ToolResult::action(action, mode).merge_evidence(json!({
            "evict_targets": plan.evict,
            "skipped": plan.skipped,
        })));
    }

    let started = Instant::now();
    let mut errors = Vec::new();
    for target in &plan.evict {
        if let Err(e) = cluster
            .evict_pod(&target.namespace, &target.pod, settings.grace_period_seconds)
            .await
        {
            warn!(node, namespace = %target.namespace, pod = %target.pod, error = %e, "Eviction failed");
            errors.push(format!("{}/{}:{}", target.namespace, target.pod, e.code()));
        }
    }

    let cleared = wait_until_clear(cluster, node, settings, started, timeout).await?;

    let ok = errors.is_empty();
    info!(node, ok, cleared, errors = errors.len(), "Drain finished");
    let mut result = ToolResult::action(action, mode).merge_evidence(json!({
        "evicted": plan.evict.len() - errors.len(),
        "cleared": cleared,
        "errors": errors,
        "skipped": plan.skipped,
    }));
    result.ok = ok;
    if !ok {
        result.error = Some("eviction_failed".to_string());
    }
    Ok(result)
}

/// Poll until no evictable pods remain on the node or `timeout` elapses.
async fn wait_until_clear(
    cluster: &dyn ClusterApi,
    node: &str,
    settings: &DrainSettings,
    started: Instant,
    timeout: Duration,
) -> Result<bool, ToolError> {
    loop {
        let remaining = plan_drain(
            &cluster.list_pods_on_node(node).await?,
            &settings.protected_namespace,
        )
        .evict
        .len();
        if remaining == 0 {
            return Ok(true);
        }
        if started.elapsed() >= timeout {
            debug!(node, remaining, "Drain wait timed out");
            return Ok(false);
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}
