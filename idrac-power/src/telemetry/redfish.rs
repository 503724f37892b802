//! Redfish HTTP client for Dell iDRAC power data

use super::{parse_chassis_id, parse_power, PowerSnapshot, TelemetryClient};
use crate::error::FetchError;
use crate::model::{Credentials, Endpoint};
use reqwest::header::HOST;
use std::time::Duration;
use tracing::debug;

/// Thin reqwest wrapper; one instance is shared by every target of a run
#[derive(Debug, Clone)]
pub struct RedfishClient {
    http: reqwest::Client,
}

impl RedfishClient {
    pub fn new(verify_ssl: bool, request_timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .timeout(request_timeout)
            .user_agent(concat!("idrac-power/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    pub fn base_url(endpoint: &Endpoint) -> String {
        format!("https://{}:{}/redfish/v1", endpoint.host, endpoint.port)
    }

    async fn get(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        path: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}{}", Self::base_url(endpoint), path);
        debug!("GET {}", url);

        let mut request = self
            .http
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password));

        if let Some(host) = &endpoint.host_header {
            request = request.header(HOST, host.as_str());
        }

        let response = request.send().await.map_err(|e| classify(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await.map_err(|e| classify(&url, e))?;
        Ok(body.to_vec())
    }
}

impl TelemetryClient for RedfishClient {
    async fn fetch(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<PowerSnapshot, FetchError> {
        let chassis = self.get(endpoint, credentials, "/Chassis").await?;
        let chassis_id = parse_chassis_id(&chassis)?;

        let power = self
            .get(endpoint, credentials, &format!("/Chassis/{}/Power", chassis_id))
            .await?;

        Ok(parse_power(&chassis_id, &power)?)
    }
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if let Some(status) = err.status() {
        FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        }
    } else if err.is_timeout() {
        FetchError::Transport(format!("timed out: {}", url))
    } else if err.is_connect() {
        FetchError::Transport(format!("connection failed to {}: {}", url, err))
    } else {
        FetchError::Transport(err.to_string())
    }
}
