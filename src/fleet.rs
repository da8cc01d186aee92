//! Keeps exactly one node agent per device the controller knows.
//!
//! The set of running agents is owned by a single [`FleetSupervisor`] task.
//! The device poll loop, the control server and the agents themselves talk to
//! it through a [`FleetHandle`], so every start and stop is serialized.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerApi;
use crate::error::{Error, Result};

/// How often the controller is asked for the device list
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a stopping agent gets before its task is aborted
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the Kubernetes node standing in for a device.
pub fn node_name(uuid: &str) -> String {
    format!("fog-{}", uuid.to_lowercase())
}

/// Runs the agent for one device.
#[async_trait]
pub trait AgentLauncher: Send + Sync + 'static {
    /// Run the agent for `uuid` until `token` is cancelled. Returning early,
    /// with or without error, lets the supervisor start it again later.
    async fn run(&self, uuid: String, token: CancellationToken) -> anyhow::Result<()>;

    /// Remove the node registered for `uuid`.
    async fn delete_node(&self, uuid: &str) -> anyhow::Result<()>;
}

#[derive(Debug)]
enum Command {
    Start(String),
    Stop { uuid: String, delete_node: bool },
    Sync(Vec<String>),
    Exited { uuid: String, generation: u64 },
    Snapshot(oneshot::Sender<BTreeMap<String, u64>>),
    Shutdown(oneshot::Sender<()>),
}

struct ActiveAgent {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Cloneable access to a running [`FleetSupervisor`].
#[derive(Clone)]
pub struct FleetHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl FleetHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::unavailable("fleet supervisor has stopped"))
    }

    /// Start an agent for `uuid` unless one is running.
    pub fn start(&self, uuid: &str) -> Result<()> {
        self.send(Command::Start(uuid.to_string()))
    }

    pub fn stop(&self, uuid: &str, delete_node: bool) -> Result<()> {
        self.send(Command::Stop {
            uuid: uuid.to_string(),
            delete_node,
        })
    }

    /// Make the running agents match `uuids`.
    pub fn sync(&self, uuids: Vec<String>) -> Result<()> {
        self.send(Command::Sync(uuids))
    }

    /// Running agents by device uuid, with their generation.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, u64>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await
            .map_err(|_| Error::unavailable("fleet supervisor has stopped"))
    }

    /// Stop every agent without deleting its node, then cancel the root token.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await
            .map_err(|_| Error::unavailable("fleet supervisor has stopped"))
    }
}

pub struct FleetSupervisor {
    launcher: Arc<dyn AgentLauncher>,
    root: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    reports: mpsc::UnboundedSender<Command>,
    agents: HashMap<String, ActiveAgent>,
    next_generation: u64,
}

impl FleetSupervisor {
    pub fn new(launcher: Arc<dyn AgentLauncher>, root: CancellationToken) -> (Self, FleetHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            root,
            commands: rx,
            reports: tx.clone(),
            agents: HashMap::new(),
            next_generation: 1,
        };
        (supervisor, FleetHandle { commands: tx })
    }

    /// Process commands until shutdown or until the root token is cancelled.
    pub async fn run(mut self) {
        loop {
            let command = tokio::select! {
                command = self.commands.recv() => command,
                _ = self.root.cancelled() => None,
            };
            match command {
                Some(Command::Start(uuid)) => self.start(uuid),
                Some(Command::Stop { uuid, delete_node }) => self.stop(&uuid, delete_node).await,
                Some(Command::Sync(uuids)) => self.sync(uuids).await,
                Some(Command::Exited { uuid, generation }) => self.exited(&uuid, generation),
                Some(Command::Snapshot(reply)) => {
                    let _ = reply.send(self.snapshot());
                }
                Some(Command::Shutdown(reply)) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                None => {
                    self.shutdown().await;
                    break;
                }
            }
        }
        debug!("fleet supervisor stopped");
    }

    fn start(&mut self, uuid: String) {
        if self.agents.contains_key(&uuid) {
            debug!("agent for device {} is already running", uuid);
            return;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let token = self.root.child_token();

        let launcher = self.launcher.clone();
        let reports = self.reports.clone();
        let agent_token = token.clone();
        let id = uuid.clone();
        let task = tokio::spawn(async move {
            match launcher.run(id.clone(), agent_token).await {
                Ok(()) => debug!("agent for device {} returned", id),
                Err(e) => error!("Error running agent for device {}: {:#}", id, e),
            }
            let _ = reports.send(Command::Exited {
                uuid: id,
                generation,
            });
        });

        info!("started agent for device {} as {} (generation {})", uuid, node_name(&uuid), generation);
        self.agents.insert(
            uuid,
            ActiveAgent {
                generation,
                token,
                task,
            },
        );
    }

    async fn stop(&mut self, uuid: &str, delete_node: bool) {
        match self.agents.remove(uuid) {
            Some(agent) => {
                agent.token.cancel();
                wait_for(uuid, agent.task).await;
                info!("stopped agent for device {}", uuid);
            }
            None => debug!("no agent running for device {}", uuid),
        }
        if delete_node {
            if let Err(e) = self.launcher.delete_node(uuid).await {
                error!("Error deleting node for device {}: {:#}", uuid, e);
            }
        }
    }

    async fn sync(&mut self, uuids: Vec<String>) {
        let wanted: HashSet<String> = uuids.into_iter().collect();
        let gone: Vec<String> = self
            .agents
            .keys()
            .filter(|uuid| !wanted.contains(*uuid))
            .cloned()
            .collect();
        for uuid in wanted {
            self.start(uuid);
        }
        for uuid in gone {
            self.stop(&uuid, true).await;
        }
    }

    fn exited(&mut self, uuid: &str, generation: u64) {
        match self.agents.get(uuid) {
            Some(agent) if agent.generation == generation => {
                self.agents.remove(uuid);
                warn!("agent for device {} exited, it will be restarted on the next sync", uuid);
            }
            _ => debug!("ignoring exit of stale agent {} (generation {})", uuid, generation),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.agents
            .iter()
            .map(|(uuid, agent)| (uuid.clone(), agent.generation))
            .collect()
    }

    async fn shutdown(&mut self) {
        info!("stopping {} agents", self.agents.len());
        let agents: Vec<_> = self.agents.drain().collect();
        for (_, agent) in &agents {
            agent.token.cancel();
        }
        for (uuid, agent) in agents {
            wait_for(&uuid, agent.task).await;
        }
        self.root.cancel();
    }
}

async fn wait_for(uuid: &str, mut task: JoinHandle<()>) {
    if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
        warn!("agent for device {} did not stop in time, aborting it", uuid);
        task.abort();
    }
}

/// Feed the device list to the supervisor every `period` until `token` is
/// cancelled. A failed fetch leaves the fleet as it is.
pub async fn poll_devices(
    controller: Arc<dyn ControllerApi>,
    fleet: FleetHandle,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let fetched = tokio::select! {
                    _ = token.cancelled() => break,
                    fetched = controller.list_devices() => fetched,
                };
                let devices = match fetched {
                    Ok(devices) => devices,
                    Err(e) => {
                        warn!("Error fetching devices, keeping current fleet: {}", e);
                        continue;
                    }
                };
                debug!("controller reports {} devices", devices.len());
                let uuids = devices.into_iter().map(|device| device.uuid).collect();
                if fleet.sync(uuids).is_err() {
                    break;
                }
            }
        }
    }
}
