//! Wire types of the fog controller API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A device (fog agent) managed by the controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub uuid: String,
    pub name: String,
    pub daemon_status: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub cpu_limit: i64,
    pub memory_limit: i64,
    pub disk_limit: i64,
    pub ip_address: String,
    pub ip_address_external: String,
    /// Milliseconds since the epoch
    pub last_status_time: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeviceList {
    pub agents: Vec<Device>,
}

/// Application description submitted to the controller. Deploying it creates
/// or updates the flow of the same name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub microservices: Vec<Microservice>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Microservice {
    pub name: String,
    #[serde(default)]
    pub agent: MicroserviceAgent,
    /// Images, config, ports and the rest are passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroserviceAgent {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_activated: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FlowList {
    pub flows: Vec<FlowInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MicroserviceInfo {
    pub uuid: String,
    pub name: String,
    pub flow_id: i64,
    pub status: MicroserviceStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MicroserviceStatus {
    pub status: String,
    /// Milliseconds since the epoch
    pub start_time: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MicroserviceList {
    pub microservices: Vec<MicroserviceInfo>,
}
