use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::address::DeviceAddress;
use crate::status::StatusMessage;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("relay request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("relay answered {status}: {message}")]
    Rejected {
        status: u16,
        kind: Option<String>,
        message: String,
    },
}

impl ClientError {
    /// User-facing status for this failure.
    pub fn status_message(&self) -> StatusMessage {
        match self {
            ClientError::Transport(e) if e.is_timeout() => {
                StatusMessage::error("Relay did not answer in time.")
            }
            ClientError::Transport(_) => {
                StatusMessage::error("Could not reach the relay. Is `espbridge serve` running?")
            }
            ClientError::Rejected {
                status, message, ..
            } => StatusMessage::for_relay_status(*status, Some(message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlResponse {
    pub status: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    kind: Option<String>,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    ip: &'a str,
}

#[derive(Serialize)]
struct ControlBody<'a> {
    ip: &'a str,
    command: &'a str,
}

/// Client for the relay's `/register` and `/control` endpoints.
pub struct RelayClient {
    base_url: String,
    client: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, address: &DeviceAddress) -> Result<RegisterResponse, ClientError> {
        let ip = address.authority();
        self.post("/register", &RegisterBody { ip: &ip }).await
    }

    pub async fn control(
        &self,
        address: &DeviceAddress,
        command: &str,
    ) -> Result<ControlResponse, ClientError> {
        let ip = address.authority();
        self.post("/control", &ControlBody { ip: &ip, command })
            .await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await?;
        let (message, kind) = match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(err) => (err.error, err.kind),
            Err(_) => (text, None),
        };
        Err(ClientError::Rejected {
            status: status.as_u16(),
            kind,
            message,
        })
    }
}
