//! Connectivity probe.
//!
//! A probe walks a configured ladder of transport strategies against one
//! device, stopping at the first rung that does not fail. A single deadline
//! covers the whole ladder, and the caller may also pass a cancellation
//! token. The result is always a [`ProbeReport`]; failures are classified
//! into an [`Outcome`] rather than returned as errors.

mod transport;

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use transport::classify_error;
pub use transport::HttpTransport;
pub use transport::ProbeRequest;
pub use transport::ProbeTransport;
pub use transport::Reply;
pub use transport::TransportError;
pub use transport::TransportMode;

use crate::address::DeviceAddress;
use crate::status::StatusMessage;

/// Default deadline for a full connection test.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Public CORS relay used by the `cors-proxy` rung unless configured otherwise.
pub const DEFAULT_PROXY_URL: &str = "https://cors-anywhere.herokuapp.com/";

/// Headers sent on the proxy rungs. Some CORS relays refuse requests that do
/// not carry `X-Requested-With`.
const PROXY_HEADERS: [(&str, &str); 3] = [
    ("Accept", "text/plain"),
    ("Cache-Control", "no-cache"),
    ("X-Requested-With", "XMLHttpRequest"),
];

const DIRECT_HEADERS: [(&str, &str); 2] = [("Accept", "text/plain"), ("Cache-Control", "no-cache")];

/// Classified terminal result of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Success,
    Timeout,
    Blocked,
    Unreachable,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    fn from_error(error: &TransportError) -> Self {
        match error {
            TransportError::Timeout => Outcome::Timeout,
            TransportError::Rejected(_) => Outcome::Blocked,
            TransportError::Failed(_) => Outcome::Unreachable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Deadline covering every rung of the ladder
    pub timeout: Duration,

    /// Strategies to try, in order
    pub ladder: Vec<TransportMode>,

    /// Base for the `cors-proxy` rung; the target URL is appended verbatim
    pub proxy_url: Option<String>,

    /// espbridge relay base URL for the `relay` rung
    pub relay_url: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            ladder: vec![TransportMode::CorsProxy, TransportMode::Opaque],
            proxy_url: Some(DEFAULT_PROXY_URL.to_string()),
            relay_url: None,
        }
    }
}

/// One rung that was actually tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub mode: TransportMode,
    pub url: String,
    pub result: Result<Reply, TransportError>,
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub outcome: Outcome,

    /// Device URL that was probed
    pub url: String,

    /// Rung that succeeded, if any
    pub mode: Option<TransportMode>,

    pub attempts: Vec<Attempt>,
    pub message: StatusMessage,
}

impl ProbeReport {
    /// HTTP status seen by the successful rung, when the mode exposes one.
    pub fn status(&self) -> Option<u16> {
        self.attempts.iter().find_map(|attempt| match attempt.result {
            Ok(Reply::Status(status)) => Some(status),
            _ => None,
        })
    }
}

pub struct Prober<T> {
    transport: T,
    config: ProbeConfig,
}

impl Prober<HttpTransport> {
    /// Build a prober backed by reqwest.
    pub fn from_config(config: ProbeConfig) -> Result<Self, reqwest::Error> {
        let transport = HttpTransport::new(config.timeout)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: ProbeTransport> Prober<T> {
    pub fn new(transport: T, config: ProbeConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe `address`.
    ///
    /// Resolves to `Timeout` if the deadline passes or `cancel` fires before a
    /// rung completes; the in-flight request is dropped at that point, which
    /// releases its connection. Cancelling after completion has no effect.
    #[tracing::instrument(skip(self, address, cancel), fields(address = %address))]
    pub async fn probe(
        &self,
        address: &DeviceAddress,
        cancel: Option<CancellationToken>,
    ) -> ProbeReport {
        let url = address.base_url();
        info!("{}", StatusMessage::connecting(&url).text);

        let cancel = cancel.unwrap_or_default();
        let mut attempts = Vec::new();
        let ladder = self.run_ladder(&url, &mut attempts);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.config.timeout) => None,
            result = ladder => Some(result),
        };

        let (outcome, mode) = match result {
            None => {
                debug!("probe of {} cancelled after {:?}", url, self.config.timeout);
                (Outcome::Timeout, None)
            }
            Some(Ok(mode)) => (Outcome::Success, Some(mode)),
            Some(Err(error)) => (Outcome::from_error(&error), None),
        };

        let message = StatusMessage::for_outcome(outcome);
        if outcome.is_success() {
            info!("{} ({} via {:?})", message.text, url, mode);
        } else {
            warn!("{} ({}: {})", message.text, url, outcome);
        }

        ProbeReport {
            outcome,
            url,
            mode,
            attempts,
            message,
        }
    }

    async fn run_ladder(
        &self,
        target: &str,
        attempts: &mut Vec<Attempt>,
    ) -> Result<TransportMode, TransportError> {
        let mut last_error =
            TransportError::Failed("no transport strategy configured".to_string());

        for &mode in &self.config.ladder {
            let request = match self.request_for(mode, target) {
                Ok(request) => request,
                Err(error) => {
                    warn!("Skipping {} rung: {}", mode, error);
                    last_error = error;
                    continue;
                }
            };

            debug!("Trying {} via {}", target, mode);
            let result = self.transport.get(&request).await;
            attempts.push(Attempt {
                mode,
                url: request.url,
                result: result.clone(),
            });

            match result {
                Ok(_) => return Ok(mode),
                Err(error) => {
                    debug!("{} rung failed: {}", mode, error);
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    fn request_for(&self, mode: TransportMode, target: &str) -> Result<ProbeRequest, TransportError> {
        match mode {
            TransportMode::CorsProxy => {
                let base = self.config.proxy_url.as_deref().ok_or_else(|| {
                    TransportError::Rejected("no proxy_url configured".to_string())
                })?;
                Ok(ProbeRequest {
                    url: format!("{}{}", base, target),
                    headers: PROXY_HEADERS.to_vec(),
                    opaque: false,
                    relayed: false,
                })
            }
            TransportMode::Relay => {
                let base = self.config.relay_url.as_deref().ok_or_else(|| {
                    TransportError::Rejected("no relay_url configured".to_string())
                })?;
                let mut url = reqwest::Url::parse(&format!("{}/proxy", base.trim_end_matches('/')))
                    .map_err(|e| TransportError::Rejected(e.to_string()))?;
                url.query_pairs_mut().append_pair("url", target);
                Ok(ProbeRequest {
                    url: url.to_string(),
                    headers: PROXY_HEADERS.to_vec(),
                    opaque: false,
                    relayed: true,
                })
            }
            TransportMode::Direct => Ok(ProbeRequest {
                url: target.to_string(),
                headers: DIRECT_HEADERS.to_vec(),
                opaque: false,
                relayed: false,
            }),
            TransportMode::Opaque => Ok(ProbeRequest {
                url: target.to_string(),
                headers: DIRECT_HEADERS.to_vec(),
                opaque: true,
                relayed: false,
            }),
        }
    }
}
