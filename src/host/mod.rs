//! Host side of the protocol: owns the radio and the authoritative device
//! states, serves the controller's operations and reports every state change
//! back as an event.

mod device_locks;
mod event_queue;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, trace, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;

pub use device_locks::{DeviceGuard, DeviceLocks};
pub use event_queue::{EventQueue, UndeliveredEvent};

use crate::api::controller::{UwbControllerApi, UwbEvent};
use crate::api::host::UwbHostApi;
use crate::config::UwbConfig;
use crate::device_state::{DeviceStateMachine, Transition};
use crate::error::UwbError;
use crate::model::{DeviceId, DeviceState, ErrorCode, UwbDevice};
use crate::radio::{RadioDriver, RadioSignal};

#[derive(Default)]
struct HostState {
    devices: DeviceStateMachine,
    discovering: bool,
    /// Ranging sessions being opened, they count against the limit.
    starting: HashSet<DeviceId>,
}

/// State shared with the radio signal task.
struct Shared {
    state: Mutex<HostState>,
    events: EventQueue,
    ranging_tx: broadcast::Sender<UwbDevice>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn process_signal(&self, signal: RadioSignal) {
        trace!("Radio signal: {:?}", signal);

        match signal {
            RadioSignal::PeerFound { device } => {
                let id = device.id.clone();
                self.discovery_transition(&id, |devices| {
                    Ok(vec![UwbEvent::DeviceFound(devices.discover(device)?)])
                });
            }
            RadioSignal::PeerLost { device_id } => {
                self.discovery_transition(&device_id, |devices| {
                    let device =
                        devices.apply(&device_id, Transition::OutOfRange)?;
                    Ok(vec![UwbEvent::DeviceLost(device)])
                });
            }
            RadioSignal::ConnectionRequest { device } => {
                let id = device.id.clone();
                self.discovery_transition(&id, |devices| {
                    let mut events = vec![];
                    if Transition::Discovered.accepts(devices.state(&id))
                        && devices.get(&id).is_some()
                    {
                        events.push(UwbEvent::DeviceFound(
                            devices.discover(device.clone())?,
                        ));
                    }
                    events.push(UwbEvent::ConnectionRequestReceived(
                        devices.connection_requested(device)?,
                    ));
                    Ok(events)
                });
            }
            RadioSignal::PeerDisconnected { device_id } => {
                self.device_transition(&device_id, |devices| {
                    let was_ranging =
                        devices.state(&device_id) == Some(DeviceState::Ranging);
                    let device =
                        devices.apply(&device_id, Transition::PeerDisconnected)?;

                    let mut events = vec![];
                    if was_ranging {
                        events.push(UwbEvent::SessionDisconnected(device.clone()));
                    }
                    events.push(UwbEvent::DeviceDisconnected(device));
                    Ok(events)
                });
            }
            RadioSignal::RangingSessionClosed { device_id } => {
                self.device_transition(&device_id, |devices| {
                    let device =
                        devices.apply(&device_id, Transition::RangingStopped)?;
                    Ok(vec![UwbEvent::SessionDisconnected(device)])
                });
            }
            RadioSignal::RangingResult { device_id, data } => {
                let device = self.lock().devices.update_measurement(&device_id, data);

                match device {
                    Some(device) => {
                        // No subscriber is not an error.
                        let _ = self.ranging_tx.send(device);
                    }
                    None => {
                        trace!("Measurement for {} outside a session", device_id)
                    }
                }
            }
            RadioSignal::PermissionRequired(action) => {
                self.events.push(UwbEvent::PermissionRequired(action));
            }
        }
    }

    /// Applies a discovery signal, only while discovery is running.
    fn discovery_transition<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut DeviceStateMachine) -> Result<Vec<UwbEvent>, UwbError>,
    {
        let mut state = self.lock();

        if !state.discovering {
            debug!("Discovery is not running, signal for {} ignored", id);
            return;
        }

        self.apply_signal(&mut state, id, f);
    }

    fn device_transition<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut DeviceStateMachine) -> Result<Vec<UwbEvent>, UwbError>,
    {
        let mut state = self.lock();
        self.apply_signal(&mut state, id, f);
    }

    fn apply_signal<F>(&self, state: &mut HostState, id: &str, f: F)
    where
        F: FnOnce(&mut DeviceStateMachine) -> Result<Vec<UwbEvent>, UwbError>,
    {
        match f(&mut state.devices) {
            Ok(events) => {
                for event in events {
                    self.events.push(event);
                }
            }
            Err(e) => debug!("Signal for {} ignored: {}", id, e),
        }
    }
}

/// Serves [`UwbHostApi`] on top of a [`RadioDriver`].
///
/// Operations on one device are serialized, operations on different devices
/// run concurrently. Events go to the controller in the order the transitions
/// happened.
pub struct UwbHost<R> {
    radio: R,
    shared: Arc<Shared>,
    locks: DeviceLocks,
    /// Name advertised by the running discovery.
    discovery: tokio::sync::Mutex<Option<String>>,
    undelivered: Mutex<Option<mpsc::Receiver<UndeliveredEvent>>>,
    max_ranging_sessions: usize,
    _drop_tx: oneshot::Sender<()>,
}

impl<R: RadioDriver> UwbHost<R> {
    pub fn new(
        radio: R, mut signals: mpsc::Receiver<RadioSignal>,
        controller: Arc<dyn UwbControllerApi>, config: &UwbConfig,
    ) -> Self {
        let buffer_size = config.event_buffer_size.max(1);
        let (events, undelivered) = EventQueue::new(controller, buffer_size);
        let (ranging_tx, _) = broadcast::channel(buffer_size);

        let shared = Arc::new(Shared {
            state: Mutex::new(HostState::default()),
            events,
            ranging_tx,
        });

        let (drop_tx, mut drop_rx) = oneshot::channel();

        let signal_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(signal) = signals.recv() => {
                        signal_shared.process_signal(signal);
                    }
                    _ = &mut drop_rx => {
                        info!("Radio signal task is stopping");
                        break;
                    }
                }
            }
        });

        Self {
            radio,
            shared,
            locks: DeviceLocks::new(),
            discovery: tokio::sync::Mutex::new(None),
            undelivered: Mutex::new(Some(undelivered)),
            max_ranging_sessions: config.max_ranging_sessions,
            _drop_tx: drop_tx,
        }
    }

    /// Measurements of every ranging device.
    pub fn ranging_updates(&self) -> BroadcastStream<UwbDevice> {
        BroadcastStream::new(self.shared.ranging_tx.subscribe())
    }

    /// Events the controller failed to acknowledge. Can be taken once.
    pub fn take_undelivered(&self) -> Option<mpsc::Receiver<UndeliveredEvent>> {
        self.undelivered.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn device(&self, id: &str) -> Option<UwbDevice> {
        self.shared.lock().devices.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<UwbDevice> {
        self.shared.lock().devices.devices()
    }

    /// Closes the ranging session of `device_id`. With `force` the session
    /// is closed locally even when the radio fails to stop it.
    async fn end_session(
        &self, device_id: &str, force: bool,
    ) -> Result<(), UwbError> {
        let _guard = self.locks.lock(device_id).await;

        let state = self.shared.lock().devices.state(device_id);
        if state != Some(DeviceState::Ranging) {
            debug!("No ranging session with {}", device_id);
            return Ok(());
        }

        if let Err(e) = self.radio.stop_ranging(device_id.to_string()).await {
            let err = UwbError::from_driver("stopRanging", e);
            if !force {
                return Err(err);
            }
            warn!("Radio failed to stop ranging with {}: {}", device_id, err);
        }

        let mut state = self.shared.lock();
        match state.devices.apply(device_id, Transition::RangingStopped) {
            Ok(device) => {
                info!("Ranging with {} stopped", device_id);
                self.shared.events.push(UwbEvent::SessionDisconnected(device));
            }
            Err(e) => debug!("Session with {} already closed: {}", device_id, e),
        }

        Ok(())
    }
}

#[async_trait]
impl<R: RadioDriver> UwbHostApi for UwbHost<R> {
    async fn discover_devices(
        &self, device_name: String,
    ) -> Result<(), UwbError> {
        let mut session = self.discovery.lock().await;

        if let Some(active) = session.as_ref() {
            return Err(UwbError::domain(
                ErrorCode::OobAlreadyDiscovering,
                format!("Already discovering as {}", active),
            ));
        }

        self.shared.lock().discovering = true;

        if let Err(e) = self.radio.start_discovery(device_name.clone()).await {
            self.shared.lock().discovering = false;
            return Err(UwbError::from_driver("discoverDevices", e));
        }

        info!("Discovery started as {}", device_name);
        *session = Some(device_name);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), UwbError> {
        let mut session = self.discovery.lock().await;

        let Some(device_name) = session.take() else {
            debug!("Discovery is not running");
            return Ok(());
        };

        let candidates = {
            let mut state = self.shared.lock();
            state.discovering = false;
            self.shared.events.end_discovery();
            state.devices.candidates()
        };

        // Operations already running on a candidate finish before it goes.
        let mut guards = Vec::with_capacity(candidates.len());
        for id in &candidates {
            guards.push(self.locks.lock(id).await);
        }

        let pruned = {
            let mut state = self.shared.lock();
            // Also voids what those operations reported meanwhile.
            self.shared.events.end_discovery();
            state.devices.prune_candidates()
        };
        drop(guards);

        info!(
            "Discovery as {} stopped, {} candidates dropped",
            device_name,
            pruned.len()
        );

        self.radio
            .stop_discovery()
            .await
            .map_err(|e| UwbError::from_driver("stopDiscovery", e))
    }

    async fn handle_connection_request(
        &self, device: UwbDevice, accept: bool,
    ) -> Result<(), UwbError> {
        let _guard = self.locks.lock(&device.id).await;

        let transition =
            if accept { Transition::Accepted } else { Transition::Rejected };

        self.shared.lock().devices.check(&device.id, transition)?;

        self.radio
            .respond_to_connection(device.id.clone(), accept)
            .await
            .map_err(|e| UwbError::from_driver("handleConnectionRequest", e))?;

        let mut state = self.shared.lock();
        let device = state.devices.apply(&device.id, transition)?;

        info!("Connection request of {} accepted: {}", device.id, accept);

        let event = if accept {
            UwbEvent::DeviceConnected(device)
        } else {
            UwbEvent::DeviceRejected(device)
        };
        self.shared.events.push(event);

        Ok(())
    }

    async fn is_uwb_supported(&self) -> Result<bool, UwbError> {
        match self.radio.is_uwb_supported().await {
            Ok(supported) => Ok(supported),
            Err(e) => {
                warn!("UWB capability probe failed: {:#}", e);
                Ok(false)
            }
        }
    }

    async fn start_ranging(&self, device: UwbDevice) -> Result<(), UwbError> {
        let _guard = self.locks.lock(&device.id).await;

        let tracked = {
            let mut state = self.shared.lock();
            state.devices.check(&device.id, Transition::RangingStarted)?;

            let sessions =
                state.devices.ranging_devices().len() + state.starting.len();
            if sessions >= self.max_ranging_sessions {
                return Err(UwbError::domain(
                    ErrorCode::UwbTooManySessions,
                    format!("{} ranging sessions already active", sessions),
                ));
            }

            let tracked = state
                .devices
                .get(&device.id)
                .cloned()
                .ok_or_else(|| UwbError::device_not_found(&device.id))?;

            state.starting.insert(device.id.clone());
            tracked
        };

        let result = self.radio.start_ranging(tracked).await;

        let outcome = {
            let mut state = self.shared.lock();
            state.starting.remove(&device.id);

            if let Err(e) = result {
                return Err(UwbError::from_driver("startRanging", e));
            }

            state.devices.apply(&device.id, Transition::RangingStarted).map(
                |device| {
                    info!("Ranging with {} started", device.id);
                    self.shared.events.push(UwbEvent::SessionStarted(device));
                },
            )
        };

        // The peer left while the session was being opened.
        if outcome.is_err() {
            if let Err(e) = self.radio.stop_ranging(device.id.clone()).await {
                warn!("Radio failed to close session with {}: {:#}", device.id, e)
            }
        }

        outcome
    }

    async fn stop_ranging(&self, device: UwbDevice) -> Result<(), UwbError> {
        self.end_session(&device.id, false).await
    }

    async fn stop_uwb_sessions(&self) -> Result<(), UwbError> {
        let devices = self.shared.lock().devices.ranging_devices();

        info!("Stopping {} ranging sessions", devices.len());

        let stops =
            devices.iter().map(|device| self.end_session(&device.id, true));
        for (device, result) in devices.iter().zip(join_all(stops).await) {
            if let Err(e) = result {
                warn!("Stopping ranging with {} failed: {}", device.id, e);
            }
        }

        Ok(())
    }
}
