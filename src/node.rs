//! The Kubernetes `Node` object a virtual node is registered as.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus, NodeSystemInfo, Taint};
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use log::debug;
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::error::{Error, Result};
use crate::provider::Provider;

pub const NODE_TYPE: &str = "fog-kubelet";
const ARCHITECTURE: &str = "amd64";
const KUBELET_VERSION_PREFIX: &str = "v1.13.1-vk-";

/// Access to the cluster's Node objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn create(&self, node: &Node) -> Result<Node>;

    async fn get(&self, name: &str) -> Result<Option<Node>>;

    /// Overwrite the status of `name`, failing with `Conflict` if the object
    /// changed since `resource_version` was read.
    async fn update_status(&self, name: &str, resource_version: &str, status: &NodeStatus) -> Result<Node>;

    async fn delete(&self, name: &str) -> Result<()>;
}

pub struct KubeNodeClient {
    api: Api<Node>,
}

impl KubeNodeClient {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn create(&self, node: &Node) -> Result<Node> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        self.api
            .create(&PostParams::default(), node)
            .await
            .map_err(|e| Error::from_kube(e, &format!("node {}", name)))
    }

    async fn get(&self, name: &str) -> Result<Option<Node>> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, &format!("node {}", name)))
    }

    async fn update_status(&self, name: &str, resource_version: &str, status: &NodeStatus) -> Result<Node> {
        // A merge patch carrying resourceVersion is rejected with 409 when stale.
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, &format!("node {}", name)))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, &format!("node {}", name)))?;
        debug!("node {} deleted", name);
        Ok(())
    }
}

/// Labels every virtual node carries.
pub fn node_labels(node_name: &str, operating_system: &str) -> BTreeMap<String, String> {
    let os = operating_system.to_lowercase();
    [
        ("type", NODE_TYPE),
        ("kubernetes.io/role", "agent"),
        ("beta.kubernetes.io/os", os.as_str()),
        ("kubernetes.io/os", os.as_str()),
        ("kubernetes.io/hostname", node_name),
        ("alpha.service-controller.kubernetes.io/exclude-balancer", "true"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn node_info(device_id: &str, operating_system: &str) -> NodeSystemInfo {
    NodeSystemInfo {
        architecture: ARCHITECTURE.to_string(),
        kubelet_version: format!("{}{}", KUBELET_VERSION_PREFIX, env!("CARGO_PKG_VERSION")),
        operating_system: operating_system.to_string(),
        system_uuid: device_id.to_string(),
        ..Default::default()
    }
}

/// Collect the node status block from the provider's view of the device.
pub async fn node_status(provider: &dyn Provider, device_id: &str) -> NodeStatus {
    NodeStatus {
        capacity: Some(provider.capacity().await),
        allocatable: Some(provider.allocatable().await),
        conditions: Some(provider.node_conditions().await),
        addresses: Some(provider.node_addresses().await),
        daemon_endpoints: Some(provider.node_daemon_endpoints()),
        node_info: Some(node_info(device_id, &provider.operating_system())),
        ..Default::default()
    }
}

/// The Node object registered for `device_id`.
pub fn build_node(node_name: &str, device_id: &str, taint: Option<Taint>, status: NodeStatus) -> Node {
    let operating_system = status
        .node_info
        .as_ref()
        .map(|info| info.operating_system.clone())
        .unwrap_or_default();
    Node {
        metadata: ObjectMeta {
            name: Some(node_name.to_string()),
            labels: Some(node_labels(node_name, &operating_system)),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: taint.map(|t| vec![t]),
            provider_id: Some(format!("fog://{}", device_id)),
            ..Default::default()
        }),
        status: Some(status),
    }
}
