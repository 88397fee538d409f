//! Data types exchanged between the controller and the host.
//!
//! Enums carry the raw integer codes used on the wire. Structured types keep
//! every optional field as an `Option` so that absence is never confused with
//! a real measurement.

use std::fmt;

/// Identifier of a physical peer, stable for the lifetime of the process.
pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Smartphone,
    Accessory,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Smartphone, DeviceType::Accessory];

    pub fn raw(&self) -> i32 {
        match self {
            DeviceType::Smartphone => 0,
            DeviceType::Accessory => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| i64::from(t.raw()) == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Connected,
    Disconnected,
    Found,
    Lost,
    Rejected,
    Pending,
    Ranging,
}

impl DeviceState {
    pub const ALL: [DeviceState; 7] = [
        DeviceState::Connected,
        DeviceState::Disconnected,
        DeviceState::Found,
        DeviceState::Lost,
        DeviceState::Rejected,
        DeviceState::Pending,
        DeviceState::Ranging,
    ];

    pub fn raw(&self) -> i32 {
        match self {
            DeviceState::Connected => 0,
            DeviceState::Disconnected => 1,
            DeviceState::Found => 2,
            DeviceState::Lost => 3,
            DeviceState::Rejected => 4,
            DeviceState::Pending => 5,
            DeviceState::Ranging => 6,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| i64::from(s.raw()) == raw)
    }

    /// Connected peers survive a discovery stop, everything else is a
    /// discovery candidate.
    pub fn is_connected(&self) -> bool {
        matches!(self, DeviceState::Connected | DeviceState::Ranging)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Connected => "CONNECTED",
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::Found => "FOUND",
            DeviceState::Lost => "LOST",
            DeviceState::Rejected => "REJECTED",
            DeviceState::Pending => "PENDING",
            DeviceState::Ranging => "RANGING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OobError,
    OobDeviceAlreadyConnected,
    OobConnectionError,
    OobDeviceNotFound,
    OobAlreadyAdvertising,
    OobAlreadyDiscovering,
    OobSendingDataFailed,
    UwbError,
    UwbTooManySessions,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::OobError,
        ErrorCode::OobDeviceAlreadyConnected,
        ErrorCode::OobConnectionError,
        ErrorCode::OobDeviceNotFound,
        ErrorCode::OobAlreadyAdvertising,
        ErrorCode::OobAlreadyDiscovering,
        ErrorCode::OobSendingDataFailed,
        ErrorCode::UwbError,
        ErrorCode::UwbTooManySessions,
    ];

    pub fn raw(&self) -> i32 {
        match self {
            ErrorCode::OobError => 0,
            ErrorCode::OobDeviceAlreadyConnected => 1,
            ErrorCode::OobConnectionError => 2,
            ErrorCode::OobDeviceNotFound => 3,
            ErrorCode::OobAlreadyAdvertising => 4,
            ErrorCode::OobAlreadyDiscovering => 5,
            ErrorCode::OobSendingDataFailed => 6,
            ErrorCode::UwbError => 7,
            ErrorCode::UwbTooManySessions => 8,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| i64::from(c.raw()) == raw)
    }

    /// Name used as the error code string of a structured wire error.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::OobError => "OOB_ERROR",
            ErrorCode::OobDeviceAlreadyConnected => "OOB_DEVICE_ALREADY_CONNECTED",
            ErrorCode::OobConnectionError => "OOB_CONNECTION_ERROR",
            ErrorCode::OobDeviceNotFound => "OOB_DEVICE_NOT_FOUND",
            ErrorCode::OobAlreadyAdvertising => "OOB_ALREADY_ADVERTISING",
            ErrorCode::OobAlreadyDiscovering => "OOB_ALREADY_DISCOVERING",
            ErrorCode::OobSendingDataFailed => "OOB_SENDING_DATA_FAILED",
            ErrorCode::UwbError => "UWB_ERROR",
            ErrorCode::UwbTooManySessions => "UWB_TOO_MANY_SESSIONS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionAction {
    /// The controller must prompt the user for the missing permission.
    Request,
    /// The permission was granted but only takes effect after a restart.
    Restart,
}

impl PermissionAction {
    pub const ALL: [PermissionAction; 2] =
        [PermissionAction::Request, PermissionAction::Restart];

    pub fn raw(&self) -> i32 {
        match self {
            PermissionAction::Request => 0,
            PermissionAction::Restart => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|a| i64::from(a.raw()) == raw)
    }
}

/// Vector pointing from the local device towards the peer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Direction3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One ranging measurement. Every field is independently optional: a missing
/// value means the platform or session does not provide it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UwbData {
    /// Line-of-sight distance in meters.
    pub distance: Option<f64>,
    /// Azimuth in degrees.
    pub azimuth: Option<f64>,
    /// Elevation in degrees.
    pub elevation: Option<f64>,
    /// Absent when the peer is out of view.
    pub direction: Option<Direction3D>,
    /// Azimuth in radians, only populated with camera assistance.
    pub horizontal_angle: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UwbDevice {
    pub id: DeviceId,
    pub name: String,
    pub uwb_data: Option<UwbData>,
    pub device_type: DeviceType,
    /// `None` until the device has been classified.
    pub state: Option<DeviceState>,
}

impl UwbDevice {
    pub fn new(
        id: impl Into<DeviceId>, name: impl Into<String>, device_type: DeviceType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            uwb_data: None,
            device_type,
            state: None,
        }
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = Some(state);
        self
    }
}
