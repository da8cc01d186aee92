//! Backends that virtual nodes forward pod operations to.
//!
//! The set of backends is closed: [`ProviderKind`] is chosen once at startup
//! and [`build`] turns it into a [`Provider`] for one device.
//!
//! # Example
//! ```rust,ignore
//! let store = StateBridge::open(Arc::new(ConfigMapStore::new(client, "default", "fog-a"))).await?;
//! let provider = provider::build(ProviderKind::Fleet, ProviderInit {
//!     device_id: "A".to_string(),
//!     node_name: "fog-a".to_string(),
//!     operating_system: "Linux".to_string(),
//!     daemon_port: 10250,
//!     controller: Arc::new(ControllerClient::new(url, token)?),
//!     store: Arc::new(store),
//! });
//! let capacity = provider.capacity().await;
//! ```
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use log::debug;
#[cfg(test)]
use mockall::automock;

use crate::controller::ControllerClient;
use crate::error::Result;
use crate::state::StateBridge;

mod fleet;
mod web;

pub use fleet::FleetProvider;
pub use web::WebProvider;

/// Resource name to quantity, as found in a node's capacity
pub type ResourceList = BTreeMap<String, Quantity>;

/// Maximum number of pods every virtual node advertises
pub const MAX_PODS: i64 = 100;

/// Capability set a virtual node needs from its backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Deploy a pod that is new to the backend
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Redeploy a pod whose definition changed
    async fn update_pod(&self, pod: &Pod) -> Result<()>;

    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    /// The pod as last deployed, or `None` if the backend does not know it
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>>;

    /// Every pod the backend currently runs for this node
    async fn get_pods(&self) -> Result<Vec<Pod>>;

    // Node status is best effort: lookups that fail yield an empty result.

    async fn capacity(&self) -> ResourceList;

    async fn allocatable(&self) -> ResourceList;

    async fn node_conditions(&self) -> Vec<NodeCondition>;

    async fn node_addresses(&self) -> Vec<NodeAddress>;

    fn node_daemon_endpoints(&self) -> NodeDaemonEndpoints;

    fn operating_system(&self) -> String;
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Deploy pods as flows through the controller's application API
    Fleet,
    /// Forward every call to the controller's generic k8s endpoints
    Web,
}

/// Everything a provider needs to serve one device.
pub struct ProviderInit {
    pub device_id: String,
    pub node_name: String,
    pub operating_system: String,
    pub daemon_port: i32,
    pub controller: Arc<ControllerClient>,
    pub store: Arc<StateBridge>,
}

pub fn build(kind: ProviderKind, init: ProviderInit) -> Arc<dyn Provider> {
    debug!("building {:?} provider for node {}", kind, init.node_name);
    match kind {
        ProviderKind::Fleet => Arc::new(FleetProvider::new(
            init.device_id,
            init.operating_system,
            init.daemon_port,
            init.controller,
            init.store,
        )),
        ProviderKind::Web => Arc::new(WebProvider::new(
            init.device_id,
            init.operating_system,
            init.daemon_port,
            init.controller,
        )),
    }
}

pub(crate) fn quantity(value: i64) -> Quantity {
    Quantity(value.to_string())
}

pub(crate) fn daemon_endpoints(port: i32) -> NodeDaemonEndpoints {
    NodeDaemonEndpoints {
        kubelet_endpoint: Some(k8s_openapi::api::core::v1::DaemonEndpoint { port }),
    }
}

pub(crate) fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub(crate) fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}
