//! One virtual node: registration, periodic status sync and the pod
//! reconciler, all bound to a single device.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Taint;
use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::node::{build_node, node_status, NodeClient};
use crate::pods::PodReconciler;
use crate::provider::Provider;

/// How often the node status is refreshed from the provider
pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts at writing the node status before a tick gives up
const STATUS_ATTEMPTS: u32 = 3;

pub struct NodeAgent {
    node_name: String,
    device_id: String,
    provider: Arc<dyn Provider>,
    nodes: Arc<dyn NodeClient>,
    pods: Arc<dyn PodReconciler>,
    taint: Option<Taint>,
    workers: usize,
}

impl NodeAgent {
    pub fn new(
        node_name: String,
        device_id: String,
        provider: Arc<dyn Provider>,
        nodes: Arc<dyn NodeClient>,
        pods: Arc<dyn PodReconciler>,
        taint: Option<Taint>,
        workers: usize,
    ) -> Self {
        Self {
            node_name,
            device_id,
            provider,
            nodes,
            pods,
            taint,
            workers,
        }
    }

    /// Register the node, then sync it and reconcile its pods until `token`
    /// is cancelled. A registration failure is returned immediately.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        self.register_node().await?;
        info!("node {} for device {} is up", self.node_name, self.device_id);

        let (reconciled, ()) = tokio::join!(
            self.pods.run(token.clone(), self.workers),
            self.sync_loop(token)
        );
        info!("node {} stopped", self.node_name);
        reconciled
    }

    /// Create the Node object. An existing node counts as registered.
    pub async fn register_node(&self) -> Result<()> {
        let status = node_status(self.provider.as_ref(), &self.device_id).await;
        let node = build_node(&self.node_name, &self.device_id, self.taint.clone(), status);
        match self.nodes.create(&node).await {
            Ok(_) => info!("node {} registered", self.node_name),
            Err(Error::AlreadyExists(_)) => debug!("node {} already registered", self.node_name),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn sync_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(SYNC_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    /// One sync round. A failed node update does not hold back pod statuses.
    async fn tick(&self) {
        if let Err(e) = self.sync_node().await {
            warn!("Error syncing node {}: {}", self.node_name, e);
        }
        self.pods.update_pod_statuses().await;
    }

    /// Overwrite the node status with the provider's current view,
    /// registering the node again if it disappeared.
    pub async fn sync_node(&self) -> Result<()> {
        let status = node_status(self.provider.as_ref(), &self.device_id).await;
        for attempt in 1..=STATUS_ATTEMPTS {
            let node = match self.nodes.get(&self.node_name).await? {
                Some(node) => node,
                None => {
                    warn!("node {} is missing, registering it again", self.node_name);
                    self.register_node().await?;
                    continue;
                }
            };
            let resource_version = node.metadata.resource_version.unwrap_or_default();
            match self
                .nodes
                .update_status(&self.node_name, &resource_version, &status)
                .await
            {
                Ok(_) => return Ok(()),
                Err(Error::Conflict(message)) => {
                    debug!("node {} status attempt {} conflicted: {}", self.node_name, attempt, message)
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "node {} status not written after {} attempts",
            self.node_name, STATUS_ATTEMPTS
        )))
    }
}

/// Delete the Node object `name`; a missing node counts as deleted.
pub async fn delete_node(nodes: &dyn NodeClient, name: &str) -> Result<()> {
    match nodes.delete(name).await {
        Ok(()) => {
            info!("node {} deleted", name);
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MockNodeClient;
    use crate::pods::MockPodReconciler;
    use crate::provider::{MockProvider, ResourceList};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Node, NodeDaemonEndpoints, NodeStatus};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory node registry with a resource version per object.
    #[derive(Default)]
    struct FakeNodes {
        nodes: Mutex<HashMap<String, Node>>,
        conflicts: AtomicU32,
        creates: AtomicU32,
        status_writes: AtomicU32,
    }

    impl FakeNodes {
        fn count(&self) -> usize {
            self.nodes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NodeClient for FakeNodes {
        async fn create(&self, node: &Node) -> Result<Node> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let name = node.metadata.name.clone().unwrap();
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&name) {
                return Err(Error::AlreadyExists(name));
            }
            let mut stored = node.clone();
            stored.metadata.resource_version = Some("1".to_string());
            nodes.insert(name, stored.clone());
            Ok(stored)
        }

        async fn get(&self, name: &str) -> Result<Option<Node>> {
            Ok(self.nodes.lock().unwrap().get(name).cloned())
        }

        async fn update_status(&self, name: &str, resource_version: &str, status: &NodeStatus) -> Result<Node> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| Error::not_found(name.to_string()))?;
            let current: u64 = node.metadata.resource_version.as_deref().unwrap().parse().unwrap();
            // Simulate another writer bumping the version.
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                node.metadata.resource_version = Some((current + 1).to_string());
                return Err(Error::Conflict(name.to_string()));
            }
            if resource_version != current.to_string() {
                return Err(Error::Conflict(name.to_string()));
            }
            self.status_writes.fetch_add(1, Ordering::SeqCst);
            node.status = Some(status.clone());
            node.metadata.resource_version = Some((current + 1).to_string());
            Ok(node.clone())
        }

        async fn delete(&self, name: &str) -> Result<()> {
            match self.nodes.lock().unwrap().remove(name) {
                Some(_) => Ok(()),
                None => Err(Error::not_found(name.to_string())),
            }
        }
    }

    fn provider() -> MockProvider {
        let mut provider = MockProvider::new();
        provider.expect_capacity().returning(ResourceList::new);
        provider.expect_allocatable().returning(ResourceList::new);
        provider.expect_node_conditions().returning(Vec::new);
        provider.expect_node_addresses().returning(Vec::new);
        provider
            .expect_node_daemon_endpoints()
            .returning(NodeDaemonEndpoints::default);
        provider
            .expect_operating_system()
            .returning(|| "Linux".to_string());
        provider
    }

    fn agent(nodes: Arc<FakeNodes>, pods: MockPodReconciler) -> NodeAgent {
        NodeAgent::new(
            "fog-a".to_string(),
            "A".to_string(),
            Arc::new(provider()),
            nodes,
            Arc::new(pods),
            None,
            2,
        )
    }

    #[tokio::test]
    async fn registering_twice_leaves_one_node() {
        let nodes = Arc::new(FakeNodes::default());
        let agent = agent(nodes.clone(), MockPodReconciler::new());
        agent.register_node().await.unwrap();
        agent.register_node().await.unwrap();
        assert_eq!(nodes.count(), 1);
        assert_eq!(nodes.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_registers_a_missing_node() {
        let nodes = Arc::new(FakeNodes::default());
        let agent = agent(nodes.clone(), MockPodReconciler::new());
        agent.sync_node().await.unwrap();
        assert_eq!(nodes.count(), 1);
        assert_eq!(nodes.status_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_retries_status_conflicts() {
        let nodes = Arc::new(FakeNodes::default());
        let agent = agent(nodes.clone(), MockPodReconciler::new());
        agent.register_node().await.unwrap();

        nodes.conflicts.store(2, Ordering::SeqCst);
        agent.sync_node().await.unwrap();
        assert_eq!(nodes.status_writes.load(Ordering::SeqCst), 1);

        nodes.conflicts.store(3, Ordering::SeqCst);
        assert!(matches!(agent.sync_node().await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_tolerates_a_missing_node() {
        let nodes = Arc::new(FakeNodes::default());
        let agent = agent(nodes.clone(), MockPodReconciler::new());
        agent.register_node().await.unwrap();
        delete_node(nodes.as_ref(), "fog-a").await.unwrap();
        delete_node(nodes.as_ref(), "fog-a").await.unwrap();
        assert_eq!(nodes.count(), 0);
    }

    #[tokio::test]
    async fn pod_statuses_refresh_while_node_api_is_down() {
        let mut nodes = MockNodeClient::new();
        nodes
            .expect_get()
            .returning(|_| Err(Error::unavailable("connection refused")));
        let mut pods = MockPodReconciler::new();
        pods.expect_update_pod_statuses().times(2).return_const(());

        let agent = NodeAgent::new(
            "fog-a".to_string(),
            "A".to_string(),
            Arc::new(provider()),
            Arc::new(nodes),
            Arc::new(pods),
            None,
            2,
        );
        agent.tick().await;
        agent.tick().await;
    }

    #[tokio::test]
    async fn run_syncs_until_cancelled() {
        let nodes = Arc::new(FakeNodes::default());
        let mut pods = MockPodReconciler::new();
        pods.expect_run()
            .withf(|_, workers| *workers == 2)
            .times(1)
            .returning(|_, _| Ok(()));
        pods.expect_update_pod_statuses().times(1..).return_const(());

        let agent = agent(nodes.clone(), pods);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        agent.run(token).await.unwrap();
        assert_eq!(nodes.count(), 1);
        assert!(nodes.status_writes.load(Ordering::SeqCst) >= 1);
    }
}
