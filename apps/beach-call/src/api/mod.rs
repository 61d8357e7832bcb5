//! Clients for the collaborator services around a call: session creation,
//! ICE server discovery and post-call quality metrics.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ice;

pub use ice::{FALLBACK_STUN_URL, IceServer, RawIceServer, normalize_ice_servers};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_id: String,
    pub reservation_id: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Aggregate call quality, shown once a call has ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetrics {
    pub connect_latency_ms: LatencyPercentiles,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    reservation_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IceServersResponse {
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<RawIceServer>,
    },
    Bare(Vec<RawIceServer>),
}

#[derive(Clone)]
pub struct CallApiClient {
    http: Client,
    base_url: String,
    token: String,
}

impl CallApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub async fn create_session(&self, reservation_id: &str) -> Result<SessionGrant, ApiError> {
        let url = format!("{}/sessions", self.base_url);
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&CreateSessionRequest { reservation_id })
            .send()
            .await?;
        read_json(res).await
    }

    /// Discovered ICE servers, normalized. Never fails: any error yields the
    /// public STUN fallback.
    pub async fn ice_servers(&self) -> Vec<IceServer> {
        match self.fetch_ice_servers().await {
            Ok(raw) => normalize_ice_servers(raw),
            Err(err) => {
                tracing::warn!(target = "api", error = %err, "ice server discovery failed");
                IceServer::fallback()
            }
        }
    }

    async fn fetch_ice_servers(&self) -> Result<Vec<RawIceServer>, ApiError> {
        let url = format!("{}/ice-servers", self.base_url);
        let res = self.http.get(url).bearer_auth(&self.token).send().await?;
        let body: IceServersResponse = read_json(res).await?;
        Ok(match body {
            IceServersResponse::Wrapped { ice_servers } => ice_servers,
            IceServersResponse::Bare(servers) => servers,
        })
    }

    pub async fn call_metrics(&self) -> Result<CallMetrics, ApiError> {
        let url = format!("{}/metrics/calls", self.base_url);
        let res = self.http.get(url).bearer_auth(&self.token).send().await?;
        read_json(res).await
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, ApiError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(ApiError::UnexpectedStatus { status, body })
    }
}
