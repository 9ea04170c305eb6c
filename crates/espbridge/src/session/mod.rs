//! Client side of the bridge: connection state, the relay client, direct
//! device reads, and the remembered address.

mod client;
mod device;
mod state;
mod store;

pub use client::ClientError;
pub use client::ControlResponse;
pub use client::RegisterResponse;
pub use client::RelayClient;
pub use device::DeviceClient;
pub use device::PowerState;
pub use state::ConnectionState;
pub use state::Session;
pub use state::SessionError;
pub use store::AddressStore;
pub use store::StoreError;
