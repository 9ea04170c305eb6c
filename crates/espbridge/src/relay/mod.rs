//! Relay server.
//!
//! Browsers often cannot reach a device on another network directly, so the
//! relay issues the device request on their behalf. It keeps no state
//! between calls: each request is validated, optionally pre-flighted, and
//! forwarded independently.

mod api;
mod error;
mod forwarder;

pub use api::create_router;
pub use api::serve;
pub use api::ControlRequest;
pub use api::ProxyQuery;
pub use api::RegisterRequest;
pub use error::ErrorBody;
pub use error::RelayError;
pub use forwarder::CommandResult;
pub use forwarder::Forwarder;
pub use forwarder::ForwarderConfig;
pub use forwarder::HealthMethod;
pub use forwarder::PreflightConfig;
pub use forwarder::ProxiedResponse;
pub use forwarder::DEFAULT_FORWARD_TIMEOUT;
pub use forwarder::DEFAULT_HEALTH_PATH;
pub use forwarder::DEFAULT_PREFLIGHT_TIMEOUT;
