//! User-facing status messages.
//!
//! Every client surface maps probe outcomes and relay responses through here,
//! so the category shown for a given result is the same everywhere. The
//! category is what callers should branch on; the text is advisory.

use std::fmt;

use serde::Serialize;

use crate::probe::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub category: Category,
    pub text: String,
}

const CONNECTED: &str = "Successfully connected to ESP32!";

const TIMED_OUT: &str =
    "Connection timed out. Check if the ESP32 is online and the port is forwarded correctly.";

const BLOCKED: &str = "Connection blocked before reaching the network. Try these solutions: \
     1. Use HTTPS on the ESP32 2. Set up a CORS proxy 3. Use a domain with valid SSL";

const UNREACHABLE: &str = "Failed to connect to ESP32. Please check: \
     1. Correct IP/domain and port 2. Port forwarding 3. Firewall settings 4. ESP32 is online";

impl StatusMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            category: Category::Info,
            text: text.into(),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self {
            category: Category::Success,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            category: Category::Error,
            text: text.into(),
        }
    }

    /// Shown while a probe is in flight.
    pub fn connecting(url: &str) -> Self {
        Self::info(format!("Attempting to connect to {}...", url))
    }

    pub fn for_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::success(CONNECTED),
            Outcome::Timeout => Self::error(TIMED_OUT),
            Outcome::Blocked => Self::error(BLOCKED),
            Outcome::Unreachable => Self::error(UNREACHABLE),
        }
    }

    /// Map a relay HTTP status (and the relay's error text, if any).
    pub fn for_relay_status(status: u16, detail: Option<&str>) -> Self {
        match status {
            200..=299 => Self::success("Command sent to ESP32."),
            400 => Self::error(format!(
                "Relay rejected the request: {}",
                detail.unwrap_or("check the address and command")
            )),
            500..=599 => Self::error(format!(
                "Relay could not reach the ESP32: {}",
                detail.unwrap_or("try again later")
            )),
            other => Self::error(format!("Relay answered with unexpected status {}", other)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.category == Category::Error
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_categories() {
        assert_eq!(
            StatusMessage::for_outcome(Outcome::Success).category,
            Category::Success
        );
        for outcome in [Outcome::Timeout, Outcome::Blocked, Outcome::Unreachable] {
            assert!(StatusMessage::for_outcome(outcome).is_error());
        }
    }

    #[test]
    fn test_failure_messages_are_distinct() {
        let timeout = StatusMessage::for_outcome(Outcome::Timeout);
        let blocked = StatusMessage::for_outcome(Outcome::Blocked);
        let unreachable = StatusMessage::for_outcome(Outcome::Unreachable);
        assert_ne!(timeout.text, blocked.text);
        assert_ne!(timeout.text, unreachable.text);
        assert!(blocked.text.contains("CORS"));
    }

    #[test]
    fn test_relay_status_categories() {
        assert_eq!(
            StatusMessage::for_relay_status(200, None).category,
            Category::Success
        );
        assert!(StatusMessage::for_relay_status(400, Some("IP is required")).is_error());
        assert!(StatusMessage::for_relay_status(500, None).is_error());
        assert!(StatusMessage::for_relay_status(302, None).is_error());
    }

    #[test]
    fn test_display() {
        insta::assert_snapshot!(
            StatusMessage::connecting("http://192.0.2.1:8080"),
            @"[info] Attempting to connect to http://192.0.2.1:8080..."
        );
    }
}
