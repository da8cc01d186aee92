use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::types::*;
use super::ControllerApi;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Timeout of a single HTTP attempt
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the fog controller.
///
/// Connection failures are retried with exponential backoff. Any HTTP answer,
/// including 4xx/5xx, is final.
#[derive(Clone)]
pub struct ControllerClient {
    base: Url,
    token: String,
    http: reqwest::Client,
    retry: RetryConfig,
}

impl ControllerClient {
    pub fn new(controller_url: &str, token: &str) -> Result<Self> {
        let mut base = Url::parse(controller_url)
            .map_err(|e| Error::invalid_argument(format!("controller url {}: {}", controller_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        Ok(Self {
            base,
            token: token.to_string(),
            http,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Send `method path` with an optional JSON body and return the response body.
    pub async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Vec<u8>> {
        self.request_with_query(method, path, &[], body).await
    }

    pub async fn request_with_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::invalid_argument(format!("path {}: {}", path, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let operation = format!("{} {}", method, path);
        retry_with_backoff(&self.retry, &operation, Error::is_transient, || {
            self.send_once(method.clone(), url.clone(), body.clone())
        })
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let bytes = self.request_with_query(Method::GET, path, query, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_once(&self, method: Method, url: Url, body: Option<Vec<u8>>) -> Result<Vec<u8>> {
        debug!("controller request {} {}", method, url);
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = if text.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, text.trim())
            };
            return Err(match status {
                StatusCode::NOT_FOUND => Error::NotFound(message),
                _ => Error::Controller {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_builder() {
        Error::invalid_argument(err.to_string())
    } else {
        Error::unavailable(err.to_string())
    }
}

#[async_trait]
impl ControllerApi for ControllerClient {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let list: DeviceList = self.get_json("agents", &[]).await?;
        Ok(list.agents)
    }

    async fn get_device(&self, uuid: &str) -> Result<Device> {
        self.get_json(&format!("agents/{}", uuid), &[]).await
    }

    async fn deploy_application(&self, app: &Application) -> Result<()> {
        let body = serde_json::to_vec(app)?;
        self.request(Method::PUT, &format!("applications/{}", app.name), Some(body))
            .await?;
        Ok(())
    }

    async fn get_flow_by_name(&self, name: &str) -> Result<FlowInfo> {
        let list: FlowList = self.get_json("flows", &[("name", name)]).await?;
        list.flows
            .into_iter()
            .find(|flow| flow.name == name)
            .ok_or_else(|| Error::not_found(format!("flow {}", name)))
    }

    async fn delete_flow(&self, id: i64) -> Result<()> {
        self.request(Method::DELETE, &format!("flows/{}", id), None)
            .await?;
        Ok(())
    }

    async fn microservices_by_flow(&self, flow_id: i64) -> Result<Vec<MicroserviceInfo>> {
        let id = flow_id.to_string();
        let list: MicroserviceList = self
            .get_json("microservices", &[("flowId", id.as_str())])
            .await?;
        Ok(list.microservices)
    }
}
