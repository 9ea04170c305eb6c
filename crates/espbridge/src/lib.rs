pub mod address;
pub mod config;
pub mod probe;
pub mod relay;
pub mod session;
pub mod status;

#[cfg(test)]
mod testing;

pub use address::AddressError;
pub use address::DeviceAddress;
pub use config::format_diagnostics;
pub use config::Config;
pub use config::ConfigError;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use probe::Outcome;
pub use probe::ProbeConfig;
pub use probe::ProbeReport;
pub use probe::Prober;
pub use relay::Forwarder;
pub use relay::RelayError;
pub use session::RelayClient;
pub use session::Session;
pub use status::StatusMessage;
