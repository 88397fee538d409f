//! Boundary to the platform radio stack.
//!
//! Commands go down through [`RadioDriver`]. Everything the radio observes on
//! its own comes back as a [`RadioSignal`] on the receiver handed to the host.

pub mod sim;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{DeviceId, PermissionAction, UwbData, UwbDevice};

#[cfg(test)]
use mockall::automock;

pub use sim::SimulatedRadio;

/// Radio operations issued by the host.
///
/// Errors that are a [`UwbError`](crate::error::UwbError) reach the
/// controller unchanged, any other error is reported as unexpected.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RadioDriver: Send + Sync + 'static {
    /// Advertises `device_name` and starts scanning for peers.
    async fn start_discovery(&self, device_name: String) -> Result<()>;

    async fn stop_discovery(&self) -> Result<()>;

    /// Answers the pending out-of-band connection request of `device_id`.
    async fn respond_to_connection(
        &self, device_id: DeviceId, accept: bool,
    ) -> Result<()>;

    async fn is_uwb_supported(&self) -> Result<bool>;

    async fn start_ranging(&self, device: UwbDevice) -> Result<()>;

    async fn stop_ranging(&self, device_id: DeviceId) -> Result<()>;
}

/// Unsolicited observations of the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioSignal {
    PeerFound { device: UwbDevice },
    PeerLost { device_id: DeviceId },
    ConnectionRequest { device: UwbDevice },
    PeerDisconnected { device_id: DeviceId },
    RangingResult { device_id: DeviceId, data: UwbData },
    /// The session ended without a stop request, e.g. the peer stopped it.
    RangingSessionClosed { device_id: DeviceId },
    PermissionRequired(PermissionAction),
}
