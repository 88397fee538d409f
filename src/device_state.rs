//! Per-device lifecycle across discovery, connection and ranging.
//!
//! The host owns the authoritative instance. The controller keeps a mirror
//! that follows the states pushed to it, see
//! [`DeviceMirror`](crate::api::controller::DeviceMirror).

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::UwbError;
use crate::model::{DeviceId, DeviceState, ErrorCode, UwbData, UwbDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Discovered,
    ConnectionRequested,
    Accepted,
    Rejected,
    RangingStarted,
    RangingStopped,
    PeerDisconnected,
    OutOfRange,
}

impl Transition {
    pub const ALL: [Transition; 8] = [
        Transition::Discovered,
        Transition::ConnectionRequested,
        Transition::Accepted,
        Transition::Rejected,
        Transition::RangingStarted,
        Transition::RangingStopped,
        Transition::PeerDisconnected,
        Transition::OutOfRange,
    ];

    /// States the transition may start from. Creating transitions also
    /// accept a device that is not tracked yet.
    pub fn sources(&self) -> &'static [DeviceState] {
        use DeviceState::*;

        match self {
            Transition::Discovered => &[Lost, Disconnected, Rejected],
            Transition::ConnectionRequested => &[Found],
            Transition::Accepted | Transition::Rejected => &[Pending],
            Transition::RangingStarted => &[Connected],
            Transition::RangingStopped => &[Ranging],
            Transition::PeerDisconnected => &[Connected, Ranging],
            Transition::OutOfRange => &[Found, Connected, Ranging],
        }
    }

    pub fn target(&self) -> DeviceState {
        match self {
            Transition::Discovered => DeviceState::Found,
            Transition::ConnectionRequested => DeviceState::Pending,
            Transition::Accepted => DeviceState::Connected,
            Transition::Rejected => DeviceState::Rejected,
            Transition::RangingStarted => DeviceState::Ranging,
            Transition::RangingStopped => DeviceState::Connected,
            Transition::PeerDisconnected => DeviceState::Disconnected,
            Transition::OutOfRange => DeviceState::Lost,
        }
    }

    pub fn creates(&self) -> bool {
        matches!(self, Transition::Discovered | Transition::ConnectionRequested)
    }

    pub fn accepts(&self, from: Option<DeviceState>) -> bool {
        match from {
            None => self.creates(),
            Some(state) => self.sources().contains(&state),
        }
    }

    /// The transition that moves a device from `from` to `to`, if any.
    pub fn between(from: Option<DeviceState>, to: DeviceState) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.target() == to && t.accepts(from))
    }
}

fn check(
    id: &str, from: Option<DeviceState>, transition: Transition,
) -> Result<(), UwbError> {
    if transition.accepts(from) {
        return Ok(());
    }

    match from {
        None => Err(UwbError::device_not_found(id)),
        Some(state) => Err(UwbError::domain(
            ErrorCode::OobConnectionError,
            format!(
                "Device {} is {}, cannot move to {}",
                id,
                state,
                transition.target()
            ),
        )),
    }
}

#[derive(Debug, Default)]
pub struct DeviceStateMachine {
    devices: HashMap<DeviceId, UwbDevice>,
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&UwbDevice> {
        self.devices.get(id)
    }

    pub fn state(&self, id: &str) -> Option<DeviceState> {
        self.devices.get(id).and_then(|d| d.state)
    }

    pub fn devices(&self) -> Vec<UwbDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn ranging_devices(&self) -> Vec<UwbDevice> {
        self.devices
            .values()
            .filter(|d| d.state == Some(DeviceState::Ranging))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Verifies that `transition` can be applied to `id` without applying it.
    pub fn check(&self, id: &str, transition: Transition) -> Result<(), UwbError> {
        check(id, self.state(id), transition)
    }

    /// Records a peer seen by the scanner. A known peer keeps its type and
    /// loses its last measurement.
    pub fn discover(&mut self, device: UwbDevice) -> Result<UwbDevice, UwbError> {
        self.observe(device, Transition::Discovered)
    }

    /// Records an inbound connection request, creating the device if the
    /// scanner never reported it.
    pub fn connection_requested(
        &mut self, device: UwbDevice,
    ) -> Result<UwbDevice, UwbError> {
        self.observe(device, Transition::ConnectionRequested)
    }

    fn observe(
        &mut self, device: UwbDevice, transition: Transition,
    ) -> Result<UwbDevice, UwbError> {
        if !transition.creates() {
            return self.apply(&device.id, transition);
        }

        self.check(&device.id, transition)?;

        let record = match self.devices.entry(device.id.clone()) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                record.name = device.name;
                record
            }
            Entry::Vacant(entry) => entry.insert(device),
        };

        record.state = Some(transition.target());
        record.uwb_data = None;

        Ok(record.clone())
    }

    /// Moves a tracked device along `transition`. On error the device is
    /// left untouched.
    pub fn apply(
        &mut self, id: &str, transition: Transition,
    ) -> Result<UwbDevice, UwbError> {
        self.check(id, transition)?;

        let record = self
            .devices
            .get_mut(id)
            .ok_or_else(|| UwbError::device_not_found(id))?;

        record.state = Some(transition.target());
        if transition == Transition::RangingStopped {
            record.uwb_data = None;
        }

        Ok(record.clone())
    }

    /// Replays a device state reported by the other side.
    pub fn follow(&mut self, device: &UwbDevice) -> Result<UwbDevice, UwbError> {
        let Some(target) = device.state else {
            return Err(UwbError::domain(
                ErrorCode::OobConnectionError,
                format!("Device {} has no state", device.id),
            ));
        };

        let from = self.state(&device.id);
        if from == Some(target) {
            let record = self
                .devices
                .get_mut(&device.id)
                .ok_or_else(|| UwbError::device_not_found(&device.id))?;
            record.uwb_data = device.uwb_data.clone();
            return Ok(record.clone());
        }

        let transition = Transition::between(from, target).ok_or_else(|| {
            match from {
                None => UwbError::device_not_found(&device.id),
                Some(from) => UwbError::domain(
                    ErrorCode::OobConnectionError,
                    format!(
                        "Device {} cannot move from {} to {}",
                        device.id, from, target
                    ),
                ),
            }
        })?;

        self.observe(device.clone(), transition)
    }

    /// Stores a measurement, only while the device is ranging.
    pub fn update_measurement(
        &mut self, id: &str, data: UwbData,
    ) -> Option<UwbDevice> {
        let record = self.devices.get_mut(id)?;

        if record.state != Some(DeviceState::Ranging) {
            return None;
        }

        record.uwb_data = Some(data);
        Some(record.clone())
    }

    /// Ids of the devices that are not connected.
    pub fn candidates(&self) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| !d.state.map_or(false, |s| s.is_connected()))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Drops every device that is not connected, returns their ids.
    pub fn prune_candidates(&mut self) -> Vec<DeviceId> {
        let pruned = self.candidates();

        for id in &pruned {
            self.devices.remove(id);
        }

        pruned
    }

    pub fn remove(&mut self, id: &str) -> Option<UwbDevice> {
        self.devices.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceType;

    fn phone(id: &str) -> UwbDevice {
        UwbDevice::new(id, "Phone", DeviceType::Smartphone)
    }

    fn machine_with(id: &str, path: &[Transition]) -> DeviceStateMachine {
        let mut machine = DeviceStateMachine::new();
        machine.discover(phone(id)).unwrap();
        for transition in path {
            machine.apply(id, *transition).unwrap();
        }
        machine
    }

    #[test]
    fn test_transition_acceptance_matches_sources() {
        for transition in Transition::ALL {
            for state in DeviceState::ALL {
                assert_eq!(
                    transition.accepts(Some(state)),
                    transition.sources().contains(&state),
                    "{:?} from {}",
                    transition,
                    state
                );
            }
            assert_eq!(transition.accepts(None), transition.creates());
        }
    }

    #[test]
    fn test_between() {
        use DeviceState::*;

        assert_eq!(Transition::between(None, Found), Some(Transition::Discovered));
        assert_eq!(
            Transition::between(Some(Found), Pending),
            Some(Transition::ConnectionRequested)
        );
        assert_eq!(
            Transition::between(Some(Ranging), Connected),
            Some(Transition::RangingStopped)
        );
        assert_eq!(
            Transition::between(Some(Pending), Connected),
            Some(Transition::Accepted)
        );
        assert_eq!(Transition::between(Some(Found), Ranging), None);
        assert_eq!(Transition::between(None, Connected), None);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut machine = DeviceStateMachine::new();

        let device = machine.discover(phone("a")).unwrap();
        assert_eq!(device.state, Some(DeviceState::Found));

        machine.connection_requested(phone("a")).unwrap();
        machine.apply("a", Transition::Accepted).unwrap();
        machine.apply("a", Transition::RangingStarted).unwrap();
        machine.apply("a", Transition::RangingStopped).unwrap();
        machine.apply("a", Transition::PeerDisconnected).unwrap();

        let device = machine.discover(phone("a")).unwrap();
        assert_eq!(device.state, Some(DeviceState::Found));
    }

    #[test]
    fn test_invalid_transition_leaves_state_unchanged() {
        let mut machine = machine_with("a", &[]);

        let err = machine.apply("a", Transition::RangingStarted).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OobConnectionError));
        assert_eq!(machine.state("a"), Some(DeviceState::Found));

        let err = machine.discover(phone("a")).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OobConnectionError));
        assert_eq!(machine.state("a"), Some(DeviceState::Found));
    }

    #[test]
    fn test_unknown_device() {
        let mut machine = machine_with("a", &[]);

        let err = machine.apply("b", Transition::Accepted).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OobDeviceNotFound));
        assert_eq!(machine.len(), 1);

        let device = machine.connection_requested(phone("b")).unwrap();
        assert_eq!(device.state, Some(DeviceState::Pending));
    }

    #[test]
    fn test_measurements_only_while_ranging() {
        let data = UwbData { distance: Some(1.5), ..Default::default() };
        let mut machine = machine_with("a", &[]);
        machine.connection_requested(phone("a")).unwrap();
        machine.apply("a", Transition::Accepted).unwrap();

        assert_eq!(machine.update_measurement("a", data.clone()), None);

        machine.apply("a", Transition::RangingStarted).unwrap();
        let device = machine.update_measurement("a", data.clone()).unwrap();
        assert_eq!(device.uwb_data, Some(data));
        assert_eq!(machine.ranging_devices().len(), 1);

        let device = machine.apply("a", Transition::RangingStopped).unwrap();
        assert_eq!(device.uwb_data, None);
        assert_eq!(machine.update_measurement("missing", UwbData::default()), None);
    }

    #[test]
    fn test_rediscovery_resets_measurement() {
        let mut machine = machine_with("a", &[Transition::OutOfRange]);
        let mut seen = phone("a");
        seen.name = "Renamed".to_string();
        seen.uwb_data = Some(UwbData { distance: Some(3.0), ..Default::default() });

        let device = machine.discover(seen).unwrap();
        assert_eq!(device.name, "Renamed");
        assert_eq!(device.uwb_data, None);
    }

    #[test]
    fn test_prune_keeps_connected_devices() {
        let mut machine = machine_with("found", &[]);
        machine.discover(phone("lost")).unwrap();
        machine.apply("lost", Transition::OutOfRange).unwrap();
        machine.connection_requested(phone("conn")).unwrap();
        machine.apply("conn", Transition::Accepted).unwrap();

        let mut candidates = machine.candidates();
        candidates.sort();

        let mut pruned = machine.prune_candidates();
        pruned.sort();
        assert_eq!(pruned, vec!["found".to_string(), "lost".to_string()]);
        assert_eq!(pruned, candidates);
        assert_eq!(machine.len(), 1);
        assert_eq!(machine.state("conn"), Some(DeviceState::Connected));
    }

    #[test]
    fn test_follow() {
        let mut mirror = DeviceStateMachine::new();

        mirror.follow(&phone("a").with_state(DeviceState::Found)).unwrap();
        mirror.follow(&phone("a").with_state(DeviceState::Pending)).unwrap();
        mirror.follow(&phone("a").with_state(DeviceState::Connected)).unwrap();

        let err = mirror
            .follow(&phone("a").with_state(DeviceState::Found))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OobConnectionError));

        let err = mirror
            .follow(&phone("b").with_state(DeviceState::Ranging))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OobDeviceNotFound));

        assert!(mirror.follow(&phone("c")).is_err());
        assert_eq!(mirror.state("a"), Some(DeviceState::Connected));
    }
}
