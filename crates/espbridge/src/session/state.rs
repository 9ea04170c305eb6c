use tokio_util::sync::CancellationToken;
use tracing::info;

use super::client::ClientError;
use super::client::ControlResponse;
use super::client::RelayClient;
use crate::address::DeviceAddress;
use crate::probe::Outcome;
use crate::probe::ProbeReport;
use crate::probe::ProbeTransport;
use crate::probe::Prober;

/// Connection state owned by whichever UI drives the session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a connection attempt is already in progress")]
    Busy,

    #[error("not connected to a device")]
    NotConnected,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// One user's view of one device.
///
/// Commands are only sent once a probe has succeeded, and a new probe cannot
/// start while another is unresolved.
#[derive(Debug, Default)]
pub struct Session {
    state: ConnectionState,
    address: Option<DeviceAddress>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<&DeviceAddress> {
        self.address.as_ref()
    }

    /// Enter `Connecting` for `address`.
    pub fn begin_probe(&mut self, address: DeviceAddress) -> Result<(), SessionError> {
        if self.state == ConnectionState::Connecting {
            return Err(SessionError::Busy);
        }
        self.state = ConnectionState::Connecting;
        self.address = Some(address);
        Ok(())
    }

    /// Resolve the pending probe.
    pub fn finish_probe(&mut self, outcome: Outcome) -> ConnectionState {
        self.state = if outcome.is_success() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.state
    }

    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!("Disconnecting from {:?}", self.address);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Probe `address` and move to `Connected` or `Disconnected`.
    pub async fn connect<T: ProbeTransport>(
        &mut self,
        prober: &Prober<T>,
        address: DeviceAddress,
        cancel: Option<CancellationToken>,
    ) -> Result<ProbeReport, SessionError> {
        self.begin_probe(address.clone())?;
        let report = prober.probe(&address, cancel).await;
        let state = self.finish_probe(report.outcome);
        info!("Session for {} is now {}", address, state);
        Ok(report)
    }

    /// Send `command` through the relay to the connected device.
    pub async fn send_command(
        &self,
        client: &RelayClient,
        command: &str,
    ) -> Result<ControlResponse, SessionError> {
        let address = match (self.state, &self.address) {
            (ConnectionState::Connected, Some(address)) => address,
            _ => return Err(SessionError::NotConnected),
        };
        Ok(client.control(address, command).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::probe::ProbeConfig;
    use crate::probe::TransportMode;
    use crate::relay;
    use crate::testing;
    use crate::testing::FakeDevice;

    fn direct_prober() -> Prober<crate::probe::HttpTransport> {
        Prober::from_config(ProbeConfig {
            timeout: Duration::from_secs(2),
            ladder: vec![TransportMode::Direct],
            proxy_url: None,
            relay_url: None,
        })
        .unwrap()
    }

    #[test]
    fn test_transitions() {
        let mut session = Session::new();
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let address = DeviceAddress::parse("192.0.2.1").unwrap();
        session.begin_probe(address.clone()).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(matches!(
            session.begin_probe(address.clone()),
            Err(SessionError::Busy)
        ));

        assert_eq!(
            session.finish_probe(Outcome::Success),
            ConnectionState::Connected
        );

        // Re-testing a connected device is allowed
        session.begin_probe(address).unwrap();
        assert_eq!(
            session.finish_probe(Outcome::Timeout),
            ConnectionState::Disconnected
        );

        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_command_requires_connection() {
        let client = RelayClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();

        let session = Session::new();
        assert!(matches!(
            session.send_command(&client, "ON").await,
            Err(SessionError::NotConnected)
        ));

        let mut connecting = Session::new();
        connecting
            .begin_probe(DeviceAddress::parse("192.0.2.1").unwrap())
            .unwrap();
        assert!(matches!(
            connecting.send_command(&client, "ON").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_probe_leaves_disconnected() {
        let addr = testing::refused_addr().await;
        let mut session = Session::new();

        let report = session
            .connect(
                &direct_prober(),
                DeviceAddress::parse(&addr.to_string()).unwrap(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, Outcome::Unreachable);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_then_command() {
        let device = FakeDevice::new(r#"{"status":"ok"}"#);
        let device_addr = device.spawn().await;
        let forwarder = relay::Forwarder::new(relay::ForwarderConfig::default()).unwrap();
        let relay_addr = testing::spawn_device(relay::create_router(forwarder)).await;
        let client =
            RelayClient::new(&format!("http://{}", relay_addr), Duration::from_secs(5)).unwrap();

        let mut session = Session::new();
        let report = session
            .connect(
                &direct_prober(),
                DeviceAddress::parse(&device_addr.to_string()).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(session.state(), ConnectionState::Connected);

        let response = session.send_command(&client, "OFF").await.unwrap();
        assert_eq!(response.status, "success");
        assert_eq!(device.commands(), vec!["OFF".to_string()]);
    }
}
