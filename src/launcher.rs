//! Wires a [`NodeAgent`] to the cluster for each device the supervisor starts.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use kube::Client;
use log::{debug, info, log_enabled, Level};
use tokio_util::sync::CancellationToken;

use crate::agent::{self, NodeAgent};
use crate::config::Config;
use crate::controller::ControllerClient;
use crate::fleet::{node_name, AgentLauncher};
use crate::node::KubeNodeClient;
use crate::pods::PodController;
use crate::provider::{self, ProviderInit};
use crate::state::{ConfigMapStore, StateBridge};

pub struct KubeLauncher {
    config: Config,
    client: Client,
    controller: Arc<ControllerClient>,
}

impl KubeLauncher {
    pub fn new(config: Config, client: Client, controller: Arc<ControllerClient>) -> Self {
        Self {
            config,
            client,
            controller,
        }
    }

    fn state_name(&self, node_name: &str) -> String {
        format!("{}-{}", self.config.state_name, node_name)
    }
}

#[async_trait]
impl AgentLauncher for KubeLauncher {
    async fn run(&self, uuid: String, token: CancellationToken) -> anyhow::Result<()> {
        let node_name = node_name(&uuid);
        let state_name = self.state_name(&node_name);
        debug!("opening state {} for node {}", state_name, node_name);

        let store = ConfigMapStore::new(self.client.clone(), self.config.state_namespace(), &state_name);
        let bridge = StateBridge::open(Arc::new(store))
            .await
            .with_context(|| format!("opening state for node {}", node_name))?;
        let restored = bridge.size().await?;
        if restored > 0 {
            info!("node {} has {} pods on record", node_name, restored);
            if log_enabled!(Level::Debug) {
                debug!("pods on record for {}: {:?}", node_name, bridge.keys().await?);
            }
        }

        let provider = provider::build(
            self.config.provider,
            ProviderInit {
                device_id: uuid.clone(),
                node_name: node_name.clone(),
                operating_system: self.config.operating_system.to_string(),
                daemon_port: self.config.daemon_port,
                controller: self.controller.clone(),
                store: Arc::new(bridge),
            },
        );
        let pods = PodController::new(
            self.client.clone(),
            &node_name,
            &self.config.namespace,
            provider.clone(),
            self.config.full_resync_period(),
        );

        let agent = NodeAgent::new(
            node_name.clone(),
            uuid,
            provider,
            Arc::new(KubeNodeClient::new(self.client.clone())),
            Arc::new(pods),
            self.config.taint(),
            self.config.pod_sync_workers as usize,
        );
        agent
            .run(token)
            .await
            .with_context(|| format!("running node {}", node_name))
    }

    async fn delete_node(&self, uuid: &str) -> anyhow::Result<()> {
        let node_name = node_name(uuid);
        let nodes = KubeNodeClient::new(self.client.clone());
        agent::delete_node(&nodes, &node_name)
            .await
            .with_context(|| format!("deleting node {}", node_name))
    }
}
