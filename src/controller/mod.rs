//! Fog controller access.
//!
//! [`ControllerClient`] is the resilient HTTP transport; [`ControllerApi`] is
//! the typed surface the fleet supervisor and providers program against.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

mod client;
mod types;

pub use client::ControllerClient;
pub use types::*;

use crate::error::Result;

/// Typed operations on the fog controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// List every device known to the controller
    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Fetch one device by UUID
    async fn get_device(&self, uuid: &str) -> Result<Device>;

    /// Create or update the flow described by `app`. Deploying the same
    /// application twice leaves a single flow behind.
    async fn deploy_application(&self, app: &Application) -> Result<()>;

    /// Find the flow created for an application
    async fn get_flow_by_name(&self, name: &str) -> Result<FlowInfo>;

    async fn delete_flow(&self, id: i64) -> Result<()>;

    async fn microservices_by_flow(&self, flow_id: i64) -> Result<Vec<MicroserviceInfo>>;
}
