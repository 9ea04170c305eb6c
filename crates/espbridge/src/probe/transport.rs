use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

/// How a single rung of the probe ladder reaches the device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransportMode {
    /// Public CORS relay: the target URL is appended to the proxy base.
    CorsProxy,

    /// The espbridge relay's `/proxy?url=` endpoint.
    Relay,

    /// Plain GET; the response status is observed.
    Direct,

    /// GET whose status and body are discarded; only transport failure is
    /// observed.
    Opaque,
}

/// One outbound GET issued by the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: String,
    pub headers: Vec<(&'static str, &'static str)>,
    pub opaque: bool,

    /// Sent through the espbridge relay, whose own failures arrive as
    /// `{error, kind}` bodies rather than as device statuses.
    pub relayed: bool,
}

/// What came back from a rung that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Status(u16),
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// The request never left the client (malformed request, TLS refusal).
    #[error("request rejected before reaching the network: {0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Failed(String),
}

/// Outbound GET used by the prober
///
/// This trait allows for mocking the network for testing purposes
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn get(&self, request: &ProbeRequest) -> Result<Reply, TransportError>;
}

/// Real transport backed by reqwest
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// `timeout` bounds each individual request; the prober applies its own
    /// deadline across the whole ladder on top of this.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeTransport for HttpTransport {
    async fn get(&self, request: &ProbeRequest) -> Result<Reply, TransportError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, *value);
        }

        let response = builder.send().await.map_err(classify_error)?;
        if request.opaque {
            return Ok(Reply::Opaque);
        }

        let status = response.status();
        if request.relayed && (status.is_client_error() || status.is_server_error()) {
            let body = response.text().await.map_err(classify_error)?;
            if let Some(error) = relay_failure(&body) {
                return Err(error);
            }
        }
        Ok(Reply::Status(status.as_u16()))
    }
}

#[derive(Deserialize)]
struct RelayErrorBody {
    error: String,
    kind: String,
}

/// Interpret an error body from the espbridge relay. Anything that is not a
/// relay error body is a status passed through from the device and yields
/// `None`.
pub fn relay_failure(body: &str) -> Option<TransportError> {
    let RelayErrorBody { error, kind } = serde_json::from_str(body).ok()?;
    match kind.as_str() {
        "timeout" => Some(TransportError::Timeout),
        "upstream" | "unreachable" | "internal" => {
            Some(TransportError::Failed(format!("relay: {}", error)))
        }
        "invalid_input" | "method_not_allowed" => {
            Some(TransportError::Rejected(format!("relay: {}", error)))
        }
        _ => None,
    }
}

/// Map a reqwest failure onto the three transport error kinds.
pub fn classify_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() || refused_by_tls(&err) {
        TransportError::Rejected(err.to_string())
    } else {
        TransportError::Failed(error_chain(&err))
    }
}

// rustls handshake failures reach us as `io::ErrorKind::InvalidData`.
// The top-level reqwest message embeds the URL, so only the causes are
// searched for certificate wording.
fn refused_by_tls(err: &(dyn Error + 'static)) -> bool {
    let mut current = err.source();
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::InvalidData {
                return true;
            }
        }

        let text = e.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return true;
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::testing;

    #[test]
    fn test_mode_names() {
        assert_eq!(TransportMode::CorsProxy.to_string(), "cors-proxy");
        assert_eq!(
            TransportMode::from_str("opaque").unwrap(),
            TransportMode::Opaque
        );
    }

    #[tokio::test]
    async fn test_direct_get_reports_status() {
        let addr = testing::spawn_device(testing::status_device("on")).await;
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let reply = transport
            .get(&ProbeRequest {
                url: format!("http://{}/missing", addr),
                headers: vec![],
                opaque: false,
                relayed: false,
            })
            .await;
        assert_eq!(reply, Ok(Reply::Status(404)));
    }

    #[tokio::test]
    async fn test_opaque_get_hides_status() {
        let addr = testing::spawn_device(testing::status_device("on")).await;
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let reply = transport
            .get(&ProbeRequest {
                url: format!("http://{}/missing", addr),
                headers: vec![("Accept", "text/plain")],
                opaque: true,
                relayed: false,
            })
            .await;
        assert_eq!(reply, Ok(Reply::Opaque));
    }

    #[tokio::test]
    async fn test_refused_connection_is_failure() {
        let addr = testing::refused_addr().await;
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let reply = transport
            .get(&ProbeRequest {
                url: format!("http://{}/", addr),
                headers: vec![],
                opaque: true,
                relayed: false,
            })
            .await;
        assert!(matches!(reply, Err(TransportError::Failed(_))), "{:?}", reply);
    }

    #[tokio::test]
    async fn test_slow_device_times_out() {
        let addr = testing::spawn_device(testing::slow_device(Duration::from_secs(5))).await;
        let transport = HttpTransport::new(Duration::from_millis(100)).unwrap();

        let reply = transport
            .get(&ProbeRequest {
                url: format!("http://{}/", addr),
                headers: vec![],
                opaque: false,
                relayed: false,
            })
            .await;
        assert_eq!(reply, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_tls_to_plain_http_is_rejected() {
        let addr = testing::spawn_device(testing::status_device("on")).await;
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let reply = transport
            .get(&ProbeRequest {
                url: format!("https://{}/status", addr),
                headers: vec![],
                opaque: true,
                relayed: false,
            })
            .await;
        assert!(matches!(reply, Err(TransportError::Rejected(_))), "{:?}", reply);
    }

    #[tokio::test]
    async fn test_malformed_url_is_rejected() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let reply = transport
            .get(&ProbeRequest {
                url: "http://[::1/".to_string(),
                headers: vec![],
                opaque: false,
                relayed: false,
            })
            .await;
        assert!(matches!(reply, Err(TransportError::Rejected(_))), "{:?}", reply);
    }

    #[test]
    fn test_relay_failure_bodies() {
        assert_eq!(
            relay_failure(r#"{"error":"Device timed out","kind":"timeout"}"#),
            Some(TransportError::Timeout)
        );
        assert!(matches!(
            relay_failure(r#"{"error":"Failed to fetch from target URL","kind":"upstream"}"#),
            Some(TransportError::Failed(_))
        ));
        assert!(matches!(
            relay_failure(r#"{"error":"Missing URL parameter","kind":"invalid_input"}"#),
            Some(TransportError::Rejected(_))
        ));

        // Statuses passed through from the device
        assert_eq!(relay_failure(""), None);
        assert_eq!(relay_failure("Not Found"), None);
        assert_eq!(relay_failure(r#"{"error":"busy"}"#), None);
    }
}
