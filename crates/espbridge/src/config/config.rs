use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::EnvFilter;

use super::diagnostics::{format_diagnostics, Diagnostic, Error, LoadError, ValidationError};
use super::partial::PartialConfig;
use crate::probe::{ProbeConfig, TransportMode, DEFAULT_PROXY_URL, DEFAULT_TIMEOUT};
use crate::relay::{
    ForwarderConfig, PreflightConfig, DEFAULT_FORWARD_TIMEOUT, DEFAULT_HEALTH_PATH,
    DEFAULT_PREFLIGHT_TIMEOUT,
};

pub const DEFAULT_LISTEN: &str = "127.0.0.1";
pub const DEFAULT_RELAY_PORT: u16 = 8080;
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_STATE_FILE: &str = ".espbridge-state.toml";
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Default, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub probe: ProbeConfig,
    pub client: ClientConfig,
}

// LogLevel needs Deserialize because it's used in PartialLoggingConfig with toml::Spanned
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `tower_http = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    fn directive(target: &str, level: LogLevel) -> Result<Directive, String> {
        format!("{}={}", target, LevelFilter::from(level))
            .parse()
            .map_err(|e| format!("not a valid log target: {}", e))
    }

    /// Filter for the fmt subscriber. Overrides were checked at load time.
    pub fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.level).into())
            .parse_lossy("");
        for (target, level) in &self.overrides {
            if let Ok(directive) = Self::directive(target, *level) {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the relay binds to
    pub listen: String,
    pub port: u16,
    pub forwarder: ForwarderConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            port: DEFAULT_RELAY_PORT,
            forwarder: ForwarderConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the relay the CLI talks to
    pub relay_url: String,

    /// Where the last-used device address is remembered
    pub state_file: PathBuf,

    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("{}", format_diagnostics(.0))]
    Invalid(Vec<Diagnostic>),
}

/// Collects validation errors, pointing each at where the field was set.
struct Validator<'a> {
    partial: &'a PartialConfig,
    errors: Vec<ValidationError>,
}

impl Validator<'_> {
    fn invalid(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(ValidationError::at(
            path,
            message,
            self.partial.origins.get(path),
        ));
    }

    fn millis(&mut self, path: &str, value: Option<u64>, default: Duration) -> Duration {
        match value {
            Some(0) => {
                self.invalid(path, "timeout must be greater than zero");
                default
            }
            Some(ms) => Duration::from_millis(ms),
            None => default,
        }
    }

    fn http_url(&mut self, path: &str, url: &str) {
        match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => self.invalid(
                path,
                format!("scheme '{}' is not supported, use http or https", parsed.scheme()),
            ),
            Err(e) => self.invalid(path, format!("not a valid URL: {}", e)),
        }
    }
}

impl Config {
    /// Load configuration from TOML files with import resolution
    ///
    /// Files are merged with first-wins semantics. Warnings come back with
    /// the config; any error fails the whole load with every diagnostic
    /// rendered.
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a merged PartialConfig to a Config, validating all fields
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let mut v = Validator {
            partial: &partial,
            errors: Vec::new(),
        };

        let logging = match &partial.logging {
            Some(logging) => {
                let mut overrides = HashMap::new();
                for (target, level) in logging.overrides.iter().flatten() {
                    let level = *level.get_ref();
                    match LoggingConfig::directive(target, level) {
                        Ok(_) => {
                            overrides.insert(target.clone(), level);
                        }
                        Err(message) => {
                            v.invalid(&format!("logging.overrides.{}", target), message)
                        }
                    }
                }
                LoggingConfig {
                    level: logging.level.as_ref().map(|s| *s.get_ref()).unwrap_or_default(),
                    overrides,
                }
            }
            None => LoggingConfig::default(),
        };

        let relay = partial.relay.clone().unwrap_or_default();
        let preflight = relay.preflight.unwrap_or_default();

        let listen = relay
            .listen
            .map(|s| s.into_inner())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        if listen.parse::<IpAddr>().is_err() {
            v.invalid("relay.listen", "must be an IP address");
        }

        let port = relay.port.map(|s| s.into_inner()).unwrap_or(DEFAULT_RELAY_PORT);
        if port == 0 {
            v.invalid("relay.port", "port must be between 1 and 65535");
        }

        let path = preflight
            .path
            .map(|s| s.into_inner())
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        if !path.starts_with('/') {
            v.invalid("relay.preflight.path", "path must start with '/'");
        }

        let forwarder = ForwarderConfig {
            forward_timeout: v.millis(
                "relay.forward_timeout_ms",
                relay.forward_timeout_ms.map(|s| s.into_inner()),
                DEFAULT_FORWARD_TIMEOUT,
            ),
            preflight: PreflightConfig {
                on_register: preflight
                    .enabled_for_register
                    .map(|s| s.into_inner())
                    .unwrap_or(true),
                on_control: preflight
                    .enabled_for_control
                    .map(|s| s.into_inner())
                    .unwrap_or(true),
                path,
                method: preflight.method.map(|s| s.into_inner()).unwrap_or_default(),
                timeout: v.millis(
                    "relay.preflight.timeout_ms",
                    preflight.timeout_ms.map(|s| s.into_inner()),
                    DEFAULT_PREFLIGHT_TIMEOUT,
                ),
            },
        };

        let client_partial = partial.client.clone().unwrap_or_default();
        let relay_url = client_partial
            .relay_url
            .map(|s| s.into_inner())
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
        v.http_url("client.relay_url", &relay_url);
        let client = ClientConfig {
            relay_url: relay_url.trim_end_matches('/').to_string(),
            state_file: client_partial
                .state_file
                .map(|s| s.into_inner())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            timeout: v.millis(
                "client.timeout_ms",
                client_partial.timeout_ms.map(|s| s.into_inner()),
                DEFAULT_CLIENT_TIMEOUT,
            ),
        };

        let probe_partial = partial.probe.clone().unwrap_or_default();
        let ladder = probe_partial
            .ladder
            .map(|s| s.into_inner())
            .unwrap_or_else(|| ProbeConfig::default().ladder);
        if ladder.is_empty() {
            v.invalid("probe.ladder", "ladder needs at least one transport");
        }
        for (i, mode) in ladder.iter().enumerate() {
            if ladder[..i].contains(mode) {
                v.invalid("probe.ladder", format!("'{}' is listed more than once", mode));
            }
        }

        // An empty proxy_url switches the public relay off
        let proxy_url = match probe_partial.proxy_url.map(|s| s.into_inner()) {
            Some(url) if url.is_empty() => None,
            Some(url) => {
                v.http_url("probe.proxy_url", &url);
                Some(url)
            }
            None => Some(DEFAULT_PROXY_URL.to_string()),
        };
        if proxy_url.is_none() && ladder.contains(&TransportMode::CorsProxy) {
            v.invalid("probe.ladder", "'cors-proxy' needs probe.proxy_url to be set");
        }

        let probe = ProbeConfig {
            timeout: v.millis(
                "probe.timeout_ms",
                probe_partial.timeout_ms.map(|s| s.into_inner()),
                DEFAULT_TIMEOUT,
            ),
            ladder,
            proxy_url,
            relay_url: Some(client.relay_url.clone()),
        };

        diagnostics.extend(
            v.errors
                .into_iter()
                .map(|e| Diagnostic::Error(Error::Validation(e))),
        );

        if diagnostics.iter().any(|d| d.is_error()) {
            return Err(ConfigError::Invalid(diagnostics));
        }

        let config = Config {
            logging,
            relay: RelayConfig {
                listen,
                port,
                forwarder,
            },
            probe,
            client,
        };
        Ok((config, diagnostics))
    }
}
