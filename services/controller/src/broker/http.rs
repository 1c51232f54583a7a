//! HTTP client for the broker's JSON API.

use std::time::Duration;

use async_trait::async_trait;
use hostcycle_fleet::{MachineId, SessionId};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    BrokerApi, BrokerError, DiscoveredMachine, RegistrationState, SessionInfo, UserMessage,
};

/// Broker API client.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: Url,
}

impl BrokerClient {
    /// Create a client for `base_url`, optionally authenticating with a bearer
    /// token.
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BrokerError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BrokerError::InvalidUrl(base_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| BrokerError::Rejected("invalid broker token".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Append path segments to the base URL. Each segment is percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, BrokerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BrokerError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, BrokerError> {
        let url = self.url(segments)?;
        debug!(url = %url, "Broker GET");
        let response = self.client.get(url).query(query).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn send_json<B: Serialize>(
        &self,
        method: reqwest::Method,
        segments: &[&str],
        body: &B,
    ) -> Result<(), BrokerError> {
        let url = self.url(segments)?;
        debug!(url = %url, method = %method, "Broker request");
        let response = self.client.request(method, url).json(body).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::Status { status, body })
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[derive(Debug, Deserialize)]
struct SessionCountResponse {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct MachineResponse {
    registration_state: RegistrationState,
}

#[derive(Debug, Serialize)]
struct MaintenanceRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct PowerRequest {
    action: &'static str,
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn list_machines(&self, tag: &str) -> Result<Vec<DiscoveredMachine>, BrokerError> {
        self.get_json(&["v1", "machines"], &[("tag", tag)]).await
    }

    async fn session_count(
        &self,
        machine: &MachineId,
        active_only: bool,
    ) -> Result<u32, BrokerError> {
        let response: SessionCountResponse = self
            .get_json(
                &["v1", "machines", machine.as_str(), "sessions", "count"],
                &[("active_only", flag(active_only))],
            )
            .await?;
        Ok(response.count)
    }

    async fn registration_state(
        &self,
        machine: &MachineId,
    ) -> Result<RegistrationState, BrokerError> {
        let response: MachineResponse = self
            .get_json(&["v1", "machines", machine.as_str()], &[])
            .await?;
        Ok(response.registration_state)
    }

    async fn set_maintenance(
        &self,
        machine: &MachineId,
        enabled: bool,
    ) -> Result<(), BrokerError> {
        self.send_json(
            reqwest::Method::PUT,
            &["v1", "machines", machine.as_str(), "maintenance"],
            &MaintenanceRequest { enabled },
        )
        .await
    }

    async fn restart(&self, machine: &MachineId) -> Result<(), BrokerError> {
        self.send_json(
            reqwest::Method::POST,
            &["v1", "machines", machine.as_str(), "power"],
            &PowerRequest { action: "restart" },
        )
        .await
    }

    async fn list_sessions(
        &self,
        machine: &MachineId,
        active_only: bool,
    ) -> Result<Vec<SessionInfo>, BrokerError> {
        self.get_json(
            &["v1", "machines", machine.as_str(), "sessions"],
            &[("active_only", flag(active_only))],
        )
        .await
    }

    async fn send_message(
        &self,
        session: &SessionId,
        message: &UserMessage,
    ) -> Result<(), BrokerError> {
        self.send_json(
            reqwest::Method::POST,
            &["v1", "sessions", session.as_str(), "message"],
            message,
        )
        .await
    }
}
