//! In-memory radio used by the binary and the tests.
//!
//! Peers are injected by hand. Every peer answers connection attempts and
//! ranging requests immediately, so the host can be driven end to end without
//! any hardware.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{RadioDriver, RadioSignal};
use crate::error::{Result, UwbError};
use crate::model::{
    DeviceId, DeviceType, ErrorCode, PermissionAction, UwbData, UwbDevice,
};

#[derive(Debug, Default)]
struct SimState {
    advertised_name: Option<String>,
    ranging: HashSet<DeviceId>,
    failing_ranging: HashSet<DeviceId>,
}

#[derive(Clone)]
pub struct SimulatedRadio {
    uwb_supported: bool,
    state: Arc<Mutex<SimState>>,
    signal_tx: mpsc::Sender<RadioSignal>,
}

impl SimulatedRadio {
    /// Builds the radio together with the receiver of its signals.
    pub fn new(
        uwb_supported: bool, buffer_size: usize,
    ) -> (Self, mpsc::Receiver<RadioSignal>) {
        let (signal_tx, signal_rx) = mpsc::channel(buffer_size);

        let radio = Self {
            uwb_supported,
            state: Arc::new(Mutex::new(SimState::default())),
            signal_tx,
        };

        (radio, signal_rx)
    }

    /// A peer with a fresh random id.
    pub fn peer(name: &str, device_type: DeviceType) -> UwbDevice {
        UwbDevice::new(Uuid::new_v4().to_string(), name, device_type)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn advertised_name(&self) -> Option<String> {
        self.lock().advertised_name.clone()
    }

    pub fn is_discovering(&self) -> bool {
        self.lock().advertised_name.is_some()
    }

    pub fn is_ranging(&self, device_id: &str) -> bool {
        self.lock().ranging.contains(device_id)
    }

    /// Makes the next ranging calls for `device_id` fail.
    pub fn fail_ranging_for(&self, device_id: &str) {
        self.lock().failing_ranging.insert(device_id.to_string());
    }

    pub async fn emit(&self, signal: RadioSignal) -> Result<()> {
        self.signal_tx
            .send(signal)
            .await
            .map_err(|_| anyhow!("Radio signal receiver is closed"))
    }

    pub async fn peer_found(&self, device: UwbDevice) -> Result<()> {
        self.emit(RadioSignal::PeerFound { device }).await
    }

    pub async fn peer_lost(&self, device_id: &str) -> Result<()> {
        self.emit(RadioSignal::PeerLost { device_id: device_id.to_string() })
            .await
    }

    pub async fn connection_request(&self, device: UwbDevice) -> Result<()> {
        self.emit(RadioSignal::ConnectionRequest { device }).await
    }

    pub async fn peer_disconnected(&self, device_id: &str) -> Result<()> {
        self.lock().ranging.remove(device_id);
        self.emit(RadioSignal::PeerDisconnected {
            device_id: device_id.to_string(),
        })
        .await
    }

    pub async fn ranging_result(
        &self, device_id: &str, data: UwbData,
    ) -> Result<()> {
        self.emit(RadioSignal::RangingResult {
            device_id: device_id.to_string(),
            data,
        })
        .await
    }

    pub async fn close_session(&self, device_id: &str) -> Result<()> {
        self.lock().ranging.remove(device_id);
        self.emit(RadioSignal::RangingSessionClosed {
            device_id: device_id.to_string(),
        })
        .await
    }

    pub async fn permission_required(
        &self, action: PermissionAction,
    ) -> Result<()> {
        self.emit(RadioSignal::PermissionRequired(action)).await
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    async fn start_discovery(&self, device_name: String) -> Result<()> {
        let mut state = self.lock();

        if state.advertised_name.is_some() {
            return Err(UwbError::domain(
                ErrorCode::OobAlreadyAdvertising,
                "Radio is already advertising",
            )
            .into());
        }

        info!("Advertising as {}", device_name);
        state.advertised_name = Some(device_name);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        if let Some(name) = self.lock().advertised_name.take() {
            info!("Stopped advertising as {}", name);
        }
        Ok(())
    }

    async fn respond_to_connection(
        &self, device_id: DeviceId, accept: bool,
    ) -> Result<()> {
        debug!("Connection with {} accepted: {}", device_id, accept);
        Ok(())
    }

    async fn is_uwb_supported(&self) -> Result<bool> {
        Ok(self.uwb_supported)
    }

    async fn start_ranging(&self, device: UwbDevice) -> Result<()> {
        let mut state = self.lock();

        if !self.uwb_supported {
            return Err(UwbError::domain(
                ErrorCode::UwbError,
                "UWB is not supported",
            )
            .into());
        }

        if state.failing_ranging.contains(&device.id) {
            return Err(anyhow!("Session with {} could not be opened", device.id));
        }

        state.ranging.insert(device.id);
        Ok(())
    }

    async fn stop_ranging(&self, device_id: DeviceId) -> Result<()> {
        let mut state = self.lock();

        if state.failing_ranging.contains(&device_id) {
            return Err(anyhow!("Session with {} could not be closed", device_id));
        }

        state.ranging.remove(&device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_is_exclusive() {
        let (radio, _signals) = SimulatedRadio::new(true, 8);

        radio.start_discovery("Laptop".to_string()).await.unwrap();
        assert_eq!(radio.advertised_name().as_deref(), Some("Laptop"));

        let err = radio.start_discovery("Other".to_string()).await.unwrap_err();
        let err = err.downcast::<UwbError>().unwrap();
        assert_eq!(err.code(), Some(ErrorCode::OobAlreadyAdvertising));

        radio.stop_discovery().await.unwrap();
        assert!(!radio.is_discovering());
    }

    #[tokio::test]
    async fn test_signals_are_forwarded() {
        let (radio, mut signals) = SimulatedRadio::new(true, 8);
        let peer = SimulatedRadio::peer("Tag", DeviceType::Accessory);

        radio.peer_found(peer.clone()).await.unwrap();
        radio.peer_lost(&peer.id).await.unwrap();

        assert_eq!(
            signals.recv().await,
            Some(RadioSignal::PeerFound { device: peer.clone() })
        );
        assert_eq!(
            signals.recv().await,
            Some(RadioSignal::PeerLost { device_id: peer.id })
        );
    }

    #[tokio::test]
    async fn test_ranging_sessions() {
        let (radio, _signals) = SimulatedRadio::new(true, 8);
        let peer = SimulatedRadio::peer("Phone", DeviceType::Smartphone);

        radio.start_ranging(peer.clone()).await.unwrap();
        assert!(radio.is_ranging(&peer.id));

        radio.stop_ranging(peer.id.clone()).await.unwrap();
        assert!(!radio.is_ranging(&peer.id));

        radio.fail_ranging_for(&peer.id);
        assert!(radio.start_ranging(peer).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_radio() {
        let (radio, _signals) = SimulatedRadio::new(false, 8);
        let peer = SimulatedRadio::peer("Phone", DeviceType::Smartphone);

        assert!(!radio.is_uwb_supported().await.unwrap());
        assert!(radio.start_ranging(peer).await.is_err());
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (radio, signals) = SimulatedRadio::new(true, 8);
        drop(signals);

        assert!(radio.permission_required(PermissionAction::Request).await.is_err());
    }
}
