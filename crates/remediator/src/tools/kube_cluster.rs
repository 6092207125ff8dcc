//! [`ClusterApi`] backed by a live kube client.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::cluster::{ClusterApi, ClusterError};

/// Cluster access through the in-cluster (or kubeconfig) client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from the ambient configuration (service account or kubeconfig).
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube("pod", name, e))
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, ClusterError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube("replicaset", name, e))
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube("deployment", name, e))
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|e| ClusterError::from_kube("deployment", name, e))?;
        debug!(namespace, deployment = name, "Patched deployment");
        Ok(())
    }

    async fn list_pod_events(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<Event>, ClusterError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("involvedObject.name={pod}"));
        let list = api
            .list(&params)
            .await
            .map_err(|e| ClusterError::from_kube("events", pod, e))?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ClusterError::from_kube("pod", name, e))?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube("node", name, e))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClusterError::from_kube("node", name, e))?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = api
            .list(&params)
            .await
            .map_err(|e| ClusterError::from_kube("pods", node, e))?;
        Ok(list.items)
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };
        api.evict(name, &params)
            .await
            .map_err(|e| ClusterError::from_kube("pod", name, e))?;
        Ok(())
    }
}
