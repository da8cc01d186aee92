//! Provider that forwards every call to the controller's generic `k8s/`
//! endpoints, leaving all pod semantics to the controller.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodStatus};
use log::error;
use reqwest::Method;
use serde::de::DeserializeOwned;

use super::{daemon_endpoints, Provider, ResourceList};
use crate::controller::ControllerClient;
use crate::error::Result;

pub struct WebProvider {
    device_id: String,
    operating_system: String,
    daemon_port: i32,
    controller: Arc<ControllerClient>,
}

impl WebProvider {
    pub fn new(
        device_id: String,
        operating_system: String,
        daemon_port: i32,
        controller: Arc<ControllerClient>,
    ) -> Self {
        Self {
            device_id,
            operating_system,
            daemon_port,
            controller,
        }
    }

    fn path(operation: &str) -> String {
        format!("k8s/{}", operation)
    }

    async fn call(
        &self,
        method: Method,
        operation: &str,
        extra: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut query = vec![("nodeName", self.device_id.as_str())];
        query.extend_from_slice(extra);
        self.controller
            .request_with_query(method, &Self::path(operation), &query, body)
            .await
    }

    async fn get<T: DeserializeOwned>(&self, operation: &str, extra: &[(&str, &str)]) -> Result<T> {
        let bytes = self.call(Method::GET, operation, extra, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Like `get`, but a node status lookup never fails.
    async fn node_status<T: DeserializeOwned + Default>(&self, operation: &str) -> T {
        match self.get(operation, &[]).await {
            Ok(value) => value,
            Err(e) => {
                error!("Error calling {} for device {}: {}", operation, self.device_id, e);
                T::default()
            }
        }
    }

    async fn send_pod(&self, method: Method, operation: &str, pod: &Pod) -> Result<()> {
        let body = serde_json::to_vec(pod)?;
        self.call(method, operation, &[], Some(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for WebProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.send_pod(Method::POST, "createPod", pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        self.send_pod(Method::PUT, "updatePod", pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        self.send_pod(Method::DELETE, "deletePod", pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        match self.get("getPod", &[("namespace", namespace), ("name", name)]).await {
            Ok(pod) => Ok(Some(pod)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        match self
            .get("getPodStatus", &[("namespace", namespace), ("name", name)])
            .await
        {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        self.get("getPods", &[]).await
    }

    async fn capacity(&self) -> ResourceList {
        self.node_status("capacity").await
    }

    async fn allocatable(&self) -> ResourceList {
        self.node_status("allocatable").await
    }

    async fn node_conditions(&self) -> Vec<NodeCondition> {
        self.node_status("nodeConditions").await
    }

    async fn node_addresses(&self) -> Vec<NodeAddress> {
        self.node_status("nodeAddresses").await
    }

    fn node_daemon_endpoints(&self) -> NodeDaemonEndpoints {
        daemon_endpoints(self.daemon_port)
    }

    fn operating_system(&self) -> String {
        self.operating_system.clone()
    }
}
