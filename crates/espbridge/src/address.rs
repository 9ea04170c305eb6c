//! Device addressing.
//!
//! A device is reached by host (IP or DNS name) and port. Addresses come from
//! user input on every attempt, so parsing is forgiving about an `http://`
//! prefix and trailing slashes but strict about the host/port shape.

use std::fmt;
use std::str::FromStr;

/// Port assumed when the user does not give one.
pub const DEFAULT_PORT: u16 = 80;

/// Host and port of a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("invalid host '{0}'")]
    InvalidHost(String),

    #[error("invalid port '{0}': must be between 1 and 65535")]
    InvalidPort(String),
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        validate_host(&host)?;
        if port == 0 {
            return Err(AddressError::InvalidPort(port.to_string()));
        }
        Ok(Self { host, port })
    }

    /// Parse `host`, `host:port`, or `[v6]:port`, optionally prefixed with
    /// `http://`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix("http://").unwrap_or(trimmed);
        let trimmed = trimmed.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        // Bracketed IPv6, with or without a port
        if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::InvalidHost(trimmed.to_string()))?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if after.is_empty() => DEFAULT_PORT,
                None => return Err(AddressError::InvalidHost(trimmed.to_string())),
            };
            return Self::new(host, port);
        }

        match trimmed.split_once(':') {
            // More than one colon without brackets: a bare IPv6 literal
            Some((_, rest)) if rest.contains(':') => Self::new(trimmed, DEFAULT_PORT),
            Some((host, port)) => Self::new(host, parse_port(port)?),
            None => Self::new(trimmed, DEFAULT_PORT),
        }
    }

    /// Replace the port, keeping the host.
    pub fn with_port(self, port: u16) -> Result<Self, AddressError> {
        Self::new(self.host, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host` or `host:port`; the suffix is omitted for the default port.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == DEFAULT_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Root URL of the device, e.g. `http://myesp32.ddns.net:8080`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// URL of `path` on the device. `path` must start with `/`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_port(port: &str) -> Result<u16, AddressError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(AddressError::InvalidPort(port.to_string())),
        Ok(port) => Ok(port),
    }
}

fn validate_host(host: &str) -> Result<(), AddressError> {
    if host.is_empty() {
        return Err(AddressError::Empty);
    }

    let forbidden = |c: char| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '@' | '[' | ']');
    if host.contains(forbidden) {
        return Err(AddressError::InvalidHost(host.to_string()));
    }

    Ok(())
}
