//! Local HTTP endpoint to start and stop node agents by hand.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use log::info;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::fleet::FleetHandle;

#[derive(Debug, Deserialize)]
struct NodeQuery {
    uuid: Option<String>,
}

impl NodeQuery {
    fn uuid(self) -> Result<String, ServerError> {
        match self.uuid {
            Some(uuid) if !uuid.is_empty() => Ok(uuid),
            _ => Err(Error::invalid_argument("missing uuid").into()),
        }
    }
}

/// Error reported to the client as plain text.
struct ServerError(Error);

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}

async fn start_node(
    State(fleet): State<FleetHandle>,
    Query(query): Query<NodeQuery>,
) -> Result<StatusCode, ServerError> {
    let uuid = query.uuid()?;
    info!("control request: start node for device {}", uuid);
    fleet.start(&uuid)?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_node(
    State(fleet): State<FleetHandle>,
    Query(query): Query<NodeQuery>,
) -> Result<StatusCode, ServerError> {
    let uuid = query.uuid()?;
    info!("control request: stop node for device {}", uuid);
    fleet.stop(&uuid, true)?;
    Ok(StatusCode::ACCEPTED)
}

pub fn router(fleet: FleetHandle) -> Router {
    Router::new()
        .route("/node", post(start_node).delete(stop_node))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .with_state(fleet)
}

/// Serve the control endpoint on `listener` until `token` is cancelled.
pub async fn serve(listener: TcpListener, fleet: FleetHandle, token: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("control server listening on {}", addr);
    }
    axum::serve(listener, router(fleet))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{AgentLauncher, FleetSupervisor};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct IdleLauncher;

    #[async_trait]
    impl AgentLauncher for IdleLauncher {
        async fn run(&self, _uuid: String, token: CancellationToken) -> anyhow::Result<()> {
            token.cancelled().await;
            Ok(())
        }

        async fn delete_node(&self, _uuid: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn running_fleet() -> FleetHandle {
        let (supervisor, fleet) = FleetSupervisor::new(Arc::new(IdleLauncher), CancellationToken::new());
        tokio::spawn(supervisor.run());
        fleet
    }

    async fn call(fleet: FleetHandle, method: &str, uri: &str) -> (StatusCode, String) {
        let response = router(fleet)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn post_starts_and_delete_stops() {
        let fleet = running_fleet();

        let (status, _) = call(fleet.clone(), "POST", "/node?uuid=A").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(fleet.snapshot().await.unwrap().contains_key("A"));

        let (status, _) = call(fleet.clone(), "DELETE", "/node?uuid=A").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(fleet.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_uuid_is_bad_request() {
        let (status, body) = call(running_fleet(), "POST", "/node").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("missing uuid"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let (status, body) = call(running_fleet(), "GET", "/nodes").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "not found");
    }

    #[tokio::test]
    async fn stopped_supervisor_is_unavailable() {
        let (supervisor, fleet) = FleetSupervisor::new(Arc::new(IdleLauncher), CancellationToken::new());
        drop(supervisor);

        let (status, body) = call(fleet, "POST", "/node?uuid=A").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("fleet supervisor has stopped"));
    }
}
