//! Cluster access seam used by the remediation tools.
//!
//! Tools only ever talk to the cluster through [`ClusterApi`], so every
//! operation can be exercised against an in-process fake.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by cluster calls.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("cluster API rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("cluster transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Stable error code recorded in tool results.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::NotFound { kind, name } => format!("not_found:{kind}/{name}"),
            Self::Rejected { code, message } => format!("api_error:{code}:{message}"),
            Self::Transport(msg) => format!("transport_error:{msg}"),
        }
    }

    pub(crate) fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(ae) => Self::Rejected {
                code: ae.code,
                message: ae.message,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Cluster operations the tool catalog needs.
///
/// Mutating calls are single API requests; callers never assume a partial
/// effect on failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;

    async fn get_replica_set(&self, namespace: &str, name: &str)
        -> Result<ReplicaSet, ClusterError>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    /// Strategic-merge patch against a Deployment.
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClusterError>;

    /// Events whose involved object is the named pod.
    async fn list_pod_events(&self, namespace: &str, pod: &str)
        -> Result<Vec<Event>, ClusterError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// Merge patch against a Node.
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ClusterError>;

    /// Pods in any namespace scheduled onto `node`.
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Evict a pod through the Eviction API.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), ClusterError>;
}
