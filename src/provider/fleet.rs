//! Provider that deploys each pod as a flow on the device it is scheduled to.
//!
//! The workload is described by two pod annotations holding JSON:
//! `microservices` (required) and `routes` (optional). The association between
//! a pod and the flow it became is kept in the node's [`StateBridge`], which
//! is also the only source for `get_pod`/`get_pods`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, NodeAddress,
    NodeCondition, NodeDaemonEndpoints, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use super::{daemon_endpoints, pod_name, quantity, Provider, ResourceList, MAX_PODS};
use crate::controller::{
    Application, ControllerApi, Device, FlowInfo, Microservice, MicroserviceAgent,
    MicroserviceInfo, Route,
};
use crate::error::{Error, Result};
use crate::state::{StateBridge, Versioned};

pub const MICROSERVICES_ANNOTATION: &str = "microservices";
pub const ROUTES_ANNOTATION: &str = "routes";

const RUNNING: &str = "RUNNING";
const PRESSURE_THRESHOLD: f64 = 0.9;

/// A pod and the flow it was deployed as.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowPod {
    pub flow: FlowInfo,
    pub pod: Pod,
}

impl Versioned for FlowPod {
    const KIND: &'static str = "FlowPod";
    const VERSION: u32 = 1;
}

pub struct FleetProvider {
    device_id: String,
    operating_system: String,
    daemon_port: i32,
    controller: Arc<dyn ControllerApi>,
    store: Arc<StateBridge>,
}

impl FleetProvider {
    pub fn new(
        device_id: String,
        operating_system: String,
        daemon_port: i32,
        controller: Arc<dyn ControllerApi>,
        store: Arc<StateBridge>,
    ) -> Self {
        Self {
            device_id,
            operating_system,
            daemon_port,
            controller,
            store,
        }
    }

    async fn create_or_update(&self, pod: &Pod) -> Result<()> {
        let name = pod_name(pod);
        if name.is_empty() {
            return Err(Error::invalid_argument("pod has no name"));
        }
        let mut application = application_from_pod(pod)?;

        let device = self.controller.get_device(&self.device_id).await?;
        for microservice in &mut application.microservices {
            microservice.agent = MicroserviceAgent {
                name: device.name.clone(),
            };
        }

        self.controller.deploy_application(&application).await?;
        let flow = self.controller.get_flow_by_name(name).await?;
        info!("pod {} deployed as flow {} on device {}", name, flow.id, self.device_id);

        let flow_pod = FlowPod {
            flow,
            pod: pod.clone(),
        };
        self.store.put(name, &flow_pod).await
    }

    async fn device(&self) -> Option<Device> {
        match self.controller.get_device(&self.device_id).await {
            Ok(device) => Some(device),
            Err(e) => {
                error!("Error getting device {}: {}", self.device_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl Provider for FleetProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.create_or_update(pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        self.create_or_update(pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod_name(pod);
        let flow_pod: FlowPod = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("no flow recorded for pod {}", name)))?;

        match self.controller.delete_flow(flow_pod.flow.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("flow {} of pod {} was already gone", flow_pod.flow.id, name)
            }
            Err(e) => return Err(e),
        }
        self.store.remove(name).await?;
        info!("pod {} removed with flow {}", name, flow_pod.flow.id);
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>> {
        let flow_pod: Option<FlowPod> = self.store.get(name).await?;
        Ok(flow_pod.map(|flow_pod| flow_pod.pod))
    }

    async fn get_pod_status(&self, _namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        let flow_pod: FlowPod = match self.store.get(name).await? {
            Some(flow_pod) => flow_pod,
            None => return Ok(None),
        };
        let microservices = self
            .controller
            .microservices_by_flow(flow_pod.flow.id)
            .await?;
        Ok(Some(pod_status(&flow_pod.pod, &microservices)))
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        let flow_pods = self.store.values::<FlowPod>().await?;
        Ok(flow_pods.into_iter().map(|(_, flow_pod)| flow_pod.pod).collect())
    }

    async fn capacity(&self) -> ResourceList {
        match self.device().await {
            Some(device) => capacity(&device),
            None => ResourceList::new(),
        }
    }

    async fn allocatable(&self) -> ResourceList {
        match self.device().await {
            Some(device) => allocatable(&device),
            None => ResourceList::new(),
        }
    }

    async fn node_conditions(&self) -> Vec<NodeCondition> {
        node_conditions(self.device().await.as_ref())
    }

    async fn node_addresses(&self) -> Vec<NodeAddress> {
        match self.device().await {
            Some(device) => node_addresses(&device),
            None => Vec::new(),
        }
    }

    fn node_daemon_endpoints(&self) -> NodeDaemonEndpoints {
        daemon_endpoints(self.daemon_port)
    }

    fn operating_system(&self) -> String {
        self.operating_system.clone()
    }
}

/// Decode the application a pod describes through its annotations.
pub fn application_from_pod(pod: &Pod) -> Result<Application> {
    let name = pod_name(pod);
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();

    let microservices: Vec<Microservice> = match annotations.get(MICROSERVICES_ANNOTATION) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            Error::invalid_argument(format!("pod {}: {} annotation: {}", name, MICROSERVICES_ANNOTATION, e))
        })?,
        None => {
            return Err(Error::invalid_argument(format!(
                "pod {} has no {} annotation",
                name, MICROSERVICES_ANNOTATION
            )))
        }
    };
    if microservices.is_empty() {
        return Err(Error::invalid_argument(format!(
            "pod {}: {} annotation lists no microservices",
            name, MICROSERVICES_ANNOTATION
        )));
    }
    let routes: Vec<Route> = match annotations.get(ROUTES_ANNOTATION) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            Error::invalid_argument(format!("pod {}: {} annotation: {}", name, ROUTES_ANNOTATION, e))
        })?,
        None => Vec::new(),
    };

    Ok(Application {
        name: name.to_string(),
        microservices,
        routes,
    })
}

fn millis_to_time(ms: i64) -> Option<Time> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single().map(Time)
}

fn condition(type_: &str, status: bool) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        ..Default::default()
    }
}

/// Translate the run state of a flow's microservices into a pod status.
///
/// The pod is `Running` only when every microservice reports `RUNNING`;
/// otherwise it is `Pending` and the lagging containers are `Waiting` with
/// the reported status as reason.
pub fn pod_status(pod: &Pod, microservices: &[MicroserviceInfo]) -> PodStatus {
    let images = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    let mut all_running = true;
    let mut container_statuses = Vec::with_capacity(microservices.len());
    let start_time = microservices
        .iter()
        .filter_map(|ms| millis_to_time(ms.status.start_time))
        .min_by_key(|time| time.0);

    for microservice in microservices {
        let running = microservice.status.status == RUNNING;
        let state = if running {
            ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: millis_to_time(microservice.status.start_time),
                }),
                ..Default::default()
            }
        } else {
            all_running = false;
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(microservice.status.status.clone()),
                    message: None,
                }),
                ..Default::default()
            }
        };
        let image = images
            .iter()
            .find(|container| container.name == microservice.name)
            .and_then(|container| container.image.clone())
            .unwrap_or_default();

        container_statuses.push(ContainerStatus {
            name: microservice.name.clone(),
            image,
            image_id: microservice.uuid.clone(),
            ready: running,
            started: Some(running),
            restart_count: 0,
            state: Some(state),
            ..Default::default()
        });
    }

    PodStatus {
        phase: Some(if all_running { "Running" } else { "Pending" }.to_string()),
        start_time,
        conditions: Some(vec![
            condition("Initialized", true),
            condition("Ready", all_running),
            condition("PodScheduled", true),
        ]),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

fn capacity(device: &Device) -> ResourceList {
    [
        ("cpu".to_string(), quantity(device.cpu_limit)),
        ("memory".to_string(), quantity(device.memory_limit)),
        ("pods".to_string(), quantity(MAX_PODS)),
    ]
    .into_iter()
    .collect()
}

fn allocatable(device: &Device) -> ResourceList {
    let free = |limit: i64, usage: f64| (limit - usage as i64).max(0);
    [
        ("cpu".to_string(), quantity(free(device.cpu_limit, device.cpu_usage))),
        ("memory".to_string(), quantity(free(device.memory_limit, device.memory_usage))),
        ("pods".to_string(), quantity(MAX_PODS)),
    ]
    .into_iter()
    .collect()
}

fn ratio(usage: f64, limit: i64) -> f64 {
    if limit <= 0 {
        0.0
    } else {
        usage / limit as f64
    }
}

fn bool_status(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Node conditions derived from device telemetry. Without telemetry the node
/// is reported with an `Unknown` ready state.
pub fn node_conditions(device: Option<&Device>) -> Vec<NodeCondition> {
    let (ready, daemon_status, out_of_disk, disk_pressure, memory_pressure, disk_usage, memory_usage, heartbeat) =
        match device {
            Some(device) => (
                bool_status(device.daemon_status == RUNNING),
                device.daemon_status.clone(),
                device.disk_limit > 0 && device.disk_usage >= device.disk_limit as f64,
                ratio(device.disk_usage, device.disk_limit) >= PRESSURE_THRESHOLD,
                ratio(device.memory_usage, device.memory_limit) >= PRESSURE_THRESHOLD,
                format!("Usage: {:.0}, Limit: {}", device.disk_usage, device.disk_limit),
                format!("Usage: {:.0}, Limit: {}", device.memory_usage, device.memory_limit),
                millis_to_time(device.last_status_time),
            ),
            None => (
                "Unknown",
                "UNKNOWN".to_string(),
                false,
                false,
                false,
                String::new(),
                String::new(),
                None,
            ),
        };
    let now = heartbeat.unwrap_or_else(|| Time(Utc::now()));

    let condition = |type_: &str, status: &str, message: String| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
        reason: None,
        message: Some(message),
    };

    vec![
        condition("Ready", ready, daemon_status),
        condition("OutOfDisk", bool_status(out_of_disk), disk_usage.clone()),
        condition("MemoryPressure", bool_status(memory_pressure), memory_usage),
        condition("DiskPressure", bool_status(disk_pressure), disk_usage),
        condition("NetworkUnavailable", "False", String::new()),
    ]
}

fn node_addresses(device: &Device) -> Vec<NodeAddress> {
    let mut addresses = Vec::new();
    for (type_, address) in [
        ("InternalIP", &device.ip_address),
        ("ExternalIP", &device.ip_address_external),
    ] {
        if address.is_empty() {
            debug!("device {} reports no {}", device.uuid, type_);
            continue;
        }
        addresses.push(NodeAddress {
            type_: type_.to_string(),
            address: address.clone(),
        });
    }
    addresses
}
