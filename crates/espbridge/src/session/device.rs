use std::time::Duration;

use super::client::ClientError;
use crate::address::DeviceAddress;

/// Power state reported by the device's `/status` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    /// The device reports `on`; anything else reads as off.
    pub fn from_body(body: &str) -> Self {
        if body.trim() == "on" {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

/// Direct reads from a device, bypassing the relay.
pub struct DeviceClient {
    client: reqwest::Client,
}

impl DeviceClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client })
    }

    pub async fn status(&self, address: &DeviceAddress) -> Result<PowerState, ClientError> {
        let url = address.url("/status");
        tracing::debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                kind: None,
                message: body,
            });
        }

        Ok(PowerState::from_body(&body))
    }
}
