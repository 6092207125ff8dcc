//! Node readiness checks and schedulability changes.

use k8s_openapi::api::core::v1::{Node, NodeCondition};
use remediator_config::ExecutionMode;
use serde_json::{json, Map, Value};
use tracing::info;

use super::cluster::ClusterApi;
use super::{ToolError, ToolResult};

fn condition_record(c: &NodeCondition) -> Value {
    json!({
        "type": c.type_,
        "status": c.status,
        "reason": c.reason.as_deref().unwrap_or(""),
        "message": c.message.as_deref().unwrap_or(""),
        "last_transition_time": c
            .last_transition_time
            .as_ref()
            .map(|t| t.0.to_rfc3339())
            .unwrap_or_default(),
    })
}

fn conditions(node: &Node) -> &[NodeCondition] {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// Readiness evidence: `ready`, `not_ready`, `ready_condition`, `unschedulable`.
#[must_use]
pub fn readiness(node: &Node) -> Value {
    let ready_condition = conditions(node).iter().find(|c| c.type_ == "Ready");
    let ready = ready_condition.is_some_and(|c| c.status == "True");
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    json!({
        "node": node.metadata.name.as_deref().unwrap_or(""),
        "ready": ready,
        "not_ready": !ready,
        "ready_condition": ready_condition.map_or_else(|| json!({}), condition_record),
        "unschedulable": unschedulable,
    })
}

/// Health evidence over every condition except `Ready`.
///
/// A node is healthy only when all of those conditions report `False`.
#[must_use]
pub fn health(node: &Node) -> Value {
    let mut by_type = Map::new();
    let mut problems = Vec::new();
    for c in conditions(node).iter().filter(|c| !c.type_.is_empty()) {
        let record = condition_record(c);
        if c.type_ != "Ready" && c.status != "False" {
            problems.push(record.clone());
        }
        by_type.insert(c.type_.clone(), record);
    }
    json!({
        "node": node.metadata.name.as_deref().unwrap_or(""),
        "healthy": problems.is_empty(),
        "problems": problems,
        "conditions": by_type,
    })
}

pub async fn get_node_ready(cluster: &dyn ClusterApi, node: &str) -> Result<ToolResult, ToolError> {
    let n = cluster.get_node(node).await?;
    Ok(ToolResult::evidence(readiness(&n)).with_evidence("node", node))
}

pub async fn get_node_conditions(
    cluster: &dyn ClusterApi,
    node: &str,
) -> Result<ToolResult, ToolError> {
    let n = cluster.get_node(node).await?;
    Ok(ToolResult::evidence(health(&n)).with_evidence("node", node))
}

/// Cordon (`true`) or uncordon (`false`) a node.
pub async fn set_unschedulable(
    cluster: &dyn ClusterApi,
    node: &str,
    unschedulable: bool,
    mode: ExecutionMode,
) -> Result<ToolResult, ToolError> {
    let verb = if unschedulable { "cordon_node" } else { "uncordon_node" };
    if mode.is_apply() {
        cluster
            .patch_node(node, &json!({ "spec": { "unschedulable": unschedulable } }))
            .await?;
        info!(node, unschedulable, "Patched node schedulability");
    }
    Ok(ToolResult::action(format!("{verb}:{node}"), mode))
}
