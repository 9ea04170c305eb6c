use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::error::RelayError;
use crate::address::DeviceAddress;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_PREFLIGHT_TIMEOUT: Duration = Duration::from_millis(3_000);
pub const DEFAULT_HEALTH_PATH: &str = "/status";

/// Request method for the pre-flight health check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HealthMethod {
    #[default]
    Get,
    Head,
}

#[derive(Debug, Clone)]
pub struct PreflightConfig {
    /// Check reachability before answering `/register`
    pub on_register: bool,

    /// Check reachability before forwarding a `/control` command
    pub on_control: bool,

    pub path: String,
    pub method: HealthMethod,
    pub timeout: Duration,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            on_register: true,
            on_control: true,
            path: DEFAULT_HEALTH_PATH.to_string(),
            method: HealthMethod::Get,
            timeout: DEFAULT_PREFLIGHT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub forward_timeout: Duration,
    pub preflight: PreflightConfig,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            preflight: PreflightConfig::default(),
        }
    }
}

/// Device reply, parsed as JSON when possible and kept as raw text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandResult {
    Json(serde_json::Value),
    Text(String),
}

impl CommandResult {
    /// Interpret raw response bytes. UTF-8 text is kept byte for byte. The
    /// reply travels inside a JSON string, so any invalid sequences are
    /// replaced with U+FFFD.
    pub fn from_bytes(body: &[u8]) -> Self {
        if let Ok(value) = serde_json::from_slice(body) {
            return CommandResult::Json(value);
        }
        match std::str::from_utf8(body) {
            Ok(text) => CommandResult::Text(text.to_string()),
            Err(e) => {
                warn!("Device reply is not valid UTF-8 ({}), replacing invalid bytes", e);
                CommandResult::Text(String::from_utf8_lossy(body).into_owned())
            }
        }
    }
}

/// Stateless forwarder from relay requests to devices.
///
/// Each call resolves reachability and issues its request from scratch.
/// Idle connections are not pooled, so a timed-out request leaves nothing
/// behind.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Verify the device answers, for the `/register` endpoint.
    pub async fn register(&self, address: &DeviceAddress) -> Result<(), RelayError> {
        if self.config.preflight.on_register {
            self.check_reachable(address).await?;
        }
        info!("Registered device {}", address);
        Ok(())
    }

    /// Send `command` to the device's `/control` endpoint.
    pub async fn forward(
        &self,
        address: &DeviceAddress,
        command: &str,
    ) -> Result<CommandResult, RelayError> {
        if self.config.preflight.on_control {
            self.check_reachable(address).await?;
        }

        let mut url = reqwest::Url::parse(&address.url("/control"))
            .map_err(|_| RelayError::InvalidInput("Invalid IP address or domain"))?;
        url.query_pairs_mut().append_pair("cmd", command);

        debug!("Forwarding {:?} to {}", command, url);
        let response = self
            .client
            .get(url)
            .timeout(self.config.forward_timeout)
            .send()
            .await
            .map_err(|e| forward_error(address, e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| forward_error(address, e))?;

        if !status.is_success() {
            warn!("Device {} answered command with {}", address, status);
        }
        info!("Forwarded {:?} to {} ({})", command, address, status);

        Ok(CommandResult::from_bytes(&body))
    }

    /// Pre-flight health check. Any non-2xx answer or transport failure
    /// marks the device unreachable; running out of time is a timeout.
    pub async fn check_reachable(&self, address: &DeviceAddress) -> Result<(), RelayError> {
        let preflight = &self.config.preflight;
        let url = address.url(&preflight.path);
        let request = match preflight.method {
            HealthMethod::Get => self.client.get(&url),
            HealthMethod::Head => self.client.head(&url),
        };

        debug!("Pre-flight {} {}", preflight.method, url);
        match request.timeout(preflight.timeout).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                warn!(
                    "Pre-flight to {} answered {}, treating device as unreachable",
                    url,
                    response.status()
                );
                Err(RelayError::Unreachable(address.to_string()))
            }
            Err(e) if e.is_timeout() => Err(RelayError::Timeout(address.to_string())),
            Err(e) => {
                warn!("Pre-flight to {} failed: {}", url, e);
                Err(RelayError::Unreachable(address.to_string()))
            }
        }
    }

    /// Fetch an arbitrary URL for the `/proxy` endpoint.
    pub async fn fetch(&self, url: &str) -> Result<ProxiedResponse, RelayError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| RelayError::InvalidInput("Invalid URL parameter"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RelayError::InvalidInput("Invalid URL parameter"));
        }

        let proxy_error = |source| RelayError::ProxyFetch {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(parsed)
            .header("Accept", "text/plain")
            .header("Cache-Control", "no-cache")
            .timeout(self.config.forward_timeout)
            .send()
            .await
            .map_err(proxy_error)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(proxy_error)?.to_vec();

        Ok(ProxiedResponse {
            status: StatusCode::from_u16(status.as_u16())
                .map_err(|e| RelayError::Internal(e.to_string()))?,
            content_type,
            body,
        })
    }
}

#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,

    /// Upstream body, unmodified
    pub body: Vec<u8>,
}

fn forward_error(address: &DeviceAddress, source: reqwest::Error) -> RelayError {
    if source.is_timeout() {
        RelayError::Timeout(address.to_string())
    } else {
        RelayError::Upstream {
            address: address.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing;
    use crate::testing::FakeDevice;

    fn forwarder(preflight: bool, forward_timeout: Duration) -> Forwarder {
        Forwarder::new(ForwarderConfig {
            forward_timeout,
            preflight: PreflightConfig {
                on_register: preflight,
                on_control: preflight,
                timeout: Duration::from_millis(500),
                ..Default::default()
            },
        })
        .unwrap()
    }

    fn address(addr: std::net::SocketAddr) -> DeviceAddress {
        DeviceAddress::parse(&addr.to_string()).unwrap()
    }

    #[test]
    fn test_json_body_is_parsed() {
        assert_eq!(
            CommandResult::from_bytes(br#"{"status":"ok"}"#),
            CommandResult::Json(json!({"status": "ok"}))
        );
    }

    #[test]
    fn test_text_body_is_kept_verbatim() {
        let raw = "LED is ON\n".to_string();
        assert_eq!(
            CommandResult::from_bytes(raw.as_bytes()),
            CommandResult::Text(raw)
        );
        assert_eq!(
            CommandResult::from_bytes(b""),
            CommandResult::Text(String::new())
        );
    }

    #[test]
    fn test_body_bytes() {
        assert_eq!(
            CommandResult::from_bytes(br#"{"led":"on"}"#),
            CommandResult::Json(json!({"led": "on"}))
        );
        assert_eq!(
            CommandResult::from_bytes("Température 21°C\r\n".as_bytes()),
            CommandResult::Text("Température 21°C\r\n".to_string())
        );
        assert_eq!(
            CommandResult::from_bytes(b"ok\xff"),
            CommandResult::Text("ok\u{fffd}".to_string())
        );
    }

    #[tokio::test]
    async fn test_preflight_timeout_skips_command() {
        let device = FakeDevice::new("ok").with_health_delay(Duration::from_secs(30));
        let addr = device.spawn().await;

        let started = std::time::Instant::now();
        let err = forwarder(true, Duration::from_secs(2))
            .forward(&address(addr), "ON")
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Timeout(_)), "{:?}", err);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn test_forward_encodes_command() {
        let device = FakeDevice::new("ok");
        let addr = device.spawn().await;

        let result = forwarder(false, Duration::from_secs(2))
            .forward(&address(addr), "SET 50%")
            .await
            .unwrap();

        assert_eq!(result, CommandResult::Text("ok".to_string()));
        assert_eq!(device.commands(), vec!["SET 50%".to_string()]);
    }

    #[tokio::test]
    async fn test_preflight_failure_skips_command() {
        let device = FakeDevice::new("ok").without_health();
        let addr = device.spawn().await;

        let err = forwarder(true, Duration::from_secs(2))
            .forward(&address(addr), "ON")
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Unreachable(_)), "{:?}", err);
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn test_preflight_head() {
        let device = FakeDevice::new("ok");
        let addr = device.spawn().await;
        let mut fwd = forwarder(true, Duration::from_secs(2));
        fwd.config.preflight.method = HealthMethod::Head;

        fwd.check_reachable(&address(addr)).await.unwrap();
        assert_eq!(device.health_hits(), 1);
    }

    #[tokio::test]
    async fn test_forward_timeout_is_timeout() {
        let device = FakeDevice::new("ok").with_control_delay(Duration::from_secs(30));
        let addr = device.spawn().await;
        let fwd = forwarder(true, Duration::from_millis(200));

        for _ in 0..3 {
            let started = std::time::Instant::now();
            let err = fwd.forward(&address(addr), "ON").await.unwrap_err();
            assert!(matches!(err, RelayError::Timeout(_)), "{:?}", err);
            assert!(started.elapsed() < Duration::from_secs(5));
        }
        assert_eq!(device.health_hits(), 3);
    }

    #[tokio::test]
    async fn test_refused_without_preflight_is_upstream() {
        let addr = testing::refused_addr().await;

        let err = forwarder(false, Duration::from_secs(2))
            .forward(&address(addr), "ON")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }), "{:?}", err);
        assert_eq!(err.public_message(), "Failed to reach device");
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_urls() {
        let fwd = forwarder(false, Duration::from_secs(2));
        assert!(matches!(
            fwd.fetch("ftp://example.com/file").await,
            Err(RelayError::InvalidInput(_))
        ));
        assert!(matches!(
            fwd.fetch("not a url").await,
            Err(RelayError::InvalidInput(_))
        ));
    }
}
