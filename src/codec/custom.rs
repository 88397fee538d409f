//! Registry of the structured types carried on the wire.
//!
//! Each structured value is written as its tag followed by its fields as a
//! plain list. Nested structures inside a field list are written as plain
//! lists without a tag; the decoder also accepts tagged values there.

use super::{CodecError, Value};
use crate::model::{
    DeviceState, DeviceType, Direction3D, ErrorCode, PermissionAction, UwbData,
    UwbDevice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustomTag {
    Direction3D,
    UwbData,
    UwbDevice,
}

impl CustomTag {
    pub const ALL: [CustomTag; 3] =
        [CustomTag::Direction3D, CustomTag::UwbData, CustomTag::UwbDevice];

    pub fn as_u8(&self) -> u8 {
        match self {
            CustomTag::Direction3D => 128,
            CustomTag::UwbData => 129,
            CustomTag::UwbDevice => 130,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_u8() == tag)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CustomTag::Direction3D => "Direction3D",
            CustomTag::UwbData => "UwbData",
            CustomTag::UwbDevice => "UwbDevice",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CustomValue {
    Direction3D(Direction3D),
    UwbData(UwbData),
    UwbDevice(UwbDevice),
}

impl CustomValue {
    pub fn tag(&self) -> CustomTag {
        match self {
            CustomValue::Direction3D(_) => CustomTag::Direction3D,
            CustomValue::UwbData(_) => CustomTag::UwbData,
            CustomValue::UwbDevice(_) => CustomTag::UwbDevice,
        }
    }

    pub fn to_list(&self) -> Vec<Value> {
        match self {
            CustomValue::Direction3D(d) => direction_fields(d),
            CustomValue::UwbData(data) => uwb_data_fields(data),
            CustomValue::UwbDevice(device) => uwb_device_fields(device),
        }
    }

    pub fn from_list(tag: CustomTag, list: Vec<Value>) -> Result<Self, CodecError> {
        let fields = Fields::new(tag, list);
        let value = match tag {
            CustomTag::Direction3D => CustomValue::Direction3D(direction_from(fields)?),
            CustomTag::UwbData => CustomValue::UwbData(uwb_data_from(fields)?),
            CustomTag::UwbDevice => CustomValue::UwbDevice(uwb_device_from(fields)?),
        };
        Ok(value)
    }
}

fn optional_f64(value: Option<f64>) -> Value {
    value.map(Value::Float64).unwrap_or(Value::Null)
}

fn direction_fields(d: &Direction3D) -> Vec<Value> {
    vec![Value::Float64(d.x), Value::Float64(d.y), Value::Float64(d.z)]
}

fn uwb_data_fields(data: &UwbData) -> Vec<Value> {
    vec![
        optional_f64(data.distance),
        optional_f64(data.azimuth),
        optional_f64(data.elevation),
        data.direction
            .as_ref()
            .map(|d| Value::List(direction_fields(d)))
            .unwrap_or(Value::Null),
        optional_f64(data.horizontal_angle),
    ]
}

fn uwb_device_fields(device: &UwbDevice) -> Vec<Value> {
    vec![
        Value::String(device.id.clone()),
        Value::String(device.name.clone()),
        device
            .uwb_data
            .as_ref()
            .map(|data| Value::List(uwb_data_fields(data)))
            .unwrap_or(Value::Null),
        Value::Int32(device.device_type.raw()),
        device.state.map(|s| Value::Int32(s.raw())).unwrap_or(Value::Null),
    ]
}

/// Positional field reader for one structured value.
struct Fields {
    tag: CustomTag,
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(tag: CustomTag, list: Vec<Value>) -> Self {
        Self { tag, items: list.into_iter() }
    }

    fn optional(&mut self) -> Option<Value> {
        self.items.next().filter(|v| !v.is_null())
    }

    fn required(&mut self, field: &'static str) -> Result<Value, CodecError> {
        self.optional().ok_or(CodecError::MissingField {
            type_name: self.tag.type_name(),
            field,
        })
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, CodecError> {
        as_f64(self.required(field)?)
    }

    fn optional_f64(&mut self) -> Result<Option<f64>, CodecError> {
        self.optional().map(as_f64).transpose()
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        self.required(field)?.try_into()
    }

    fn raw(&mut self, field: &'static str) -> Result<i64, CodecError> {
        self.required(field)?.as_i64()
    }
}

fn as_f64(value: Value) -> Result<f64, CodecError> {
    match value {
        Value::Float64(v) => Ok(v),
        other => Err(other.mismatch("float64")),
    }
}

fn nested(value: Value, tag: CustomTag) -> Result<CustomValue, CodecError> {
    match value {
        Value::List(list) => CustomValue::from_list(tag, list),
        Value::Custom(custom) if custom.tag() == tag => Ok(custom),
        other => Err(other.mismatch(tag.type_name())),
    }
}

fn direction_from(mut fields: Fields) -> Result<Direction3D, CodecError> {
    Ok(Direction3D {
        x: fields.f64("x")?,
        y: fields.f64("y")?,
        z: fields.f64("z")?,
    })
}

fn uwb_data_from(mut fields: Fields) -> Result<UwbData, CodecError> {
    let distance = fields.optional_f64()?;
    let azimuth = fields.optional_f64()?;
    let elevation = fields.optional_f64()?;
    let direction = fields
        .optional()
        .map(|v| nested(v, CustomTag::Direction3D).and_then(Direction3D::try_from_custom))
        .transpose()?;
    let horizontal_angle = fields.optional_f64()?;

    Ok(UwbData { distance, azimuth, elevation, direction, horizontal_angle })
}

fn uwb_device_from(mut fields: Fields) -> Result<UwbDevice, CodecError> {
    let id = fields.string("id")?;
    let name = fields.string("name")?;
    let uwb_data = fields
        .optional()
        .map(|v| nested(v, CustomTag::UwbData).and_then(UwbData::try_from_custom))
        .transpose()?;
    let device_type = device_type_from_raw(fields.raw("deviceType")?)?;
    let state = fields
        .optional()
        .map(|v| v.as_i64().and_then(device_state_from_raw))
        .transpose()?;

    Ok(UwbDevice { id, name, uwb_data, device_type, state })
}

fn device_type_from_raw(raw: i64) -> Result<DeviceType, CodecError> {
    DeviceType::from_raw(raw)
        .ok_or(CodecError::InvalidEnum { type_name: "DeviceType", raw })
}

fn device_state_from_raw(raw: i64) -> Result<DeviceState, CodecError> {
    DeviceState::from_raw(raw)
        .ok_or(CodecError::InvalidEnum { type_name: "DeviceState", raw })
}

trait FromCustom: Sized {
    fn try_from_custom(custom: CustomValue) -> Result<Self, CodecError>;
}

impl FromCustom for Direction3D {
    fn try_from_custom(custom: CustomValue) -> Result<Self, CodecError> {
        match custom {
            CustomValue::Direction3D(d) => Ok(d),
            other => Err(CodecError::TypeMismatch {
                expected: "Direction3D",
                found: other.tag().type_name(),
            }),
        }
    }
}

impl FromCustom for UwbData {
    fn try_from_custom(custom: CustomValue) -> Result<Self, CodecError> {
        match custom {
            CustomValue::UwbData(data) => Ok(data),
            other => Err(CodecError::TypeMismatch {
                expected: "UwbData",
                found: other.tag().type_name(),
            }),
        }
    }
}

impl FromCustom for UwbDevice {
    fn try_from_custom(custom: CustomValue) -> Result<Self, CodecError> {
        match custom {
            CustomValue::UwbDevice(device) => Ok(device),
            other => Err(CodecError::TypeMismatch {
                expected: "UwbDevice",
                found: other.tag().type_name(),
            }),
        }
    }
}

impl From<Direction3D> for Value {
    fn from(value: Direction3D) -> Self {
        Value::Custom(CustomValue::Direction3D(value))
    }
}

impl From<UwbData> for Value {
    fn from(value: UwbData) -> Self {
        Value::Custom(CustomValue::UwbData(value))
    }
}

impl From<UwbDevice> for Value {
    fn from(value: UwbDevice) -> Self {
        Value::Custom(CustomValue::UwbDevice(value))
    }
}

impl TryFrom<Value> for Direction3D {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        nested(value, CustomTag::Direction3D).and_then(Self::try_from_custom)
    }
}

impl TryFrom<Value> for UwbData {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        nested(value, CustomTag::UwbData).and_then(Self::try_from_custom)
    }
}

impl TryFrom<Value> for UwbDevice {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        nested(value, CustomTag::UwbDevice).and_then(Self::try_from_custom)
    }
}

impl From<DeviceState> for Value {
    fn from(value: DeviceState) -> Self {
        Value::Int32(value.raw())
    }
}

impl TryFrom<Value> for DeviceState {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        device_state_from_raw(value.as_i64()?)
    }
}

impl From<DeviceType> for Value {
    fn from(value: DeviceType) -> Self {
        Value::Int32(value.raw())
    }
}

impl TryFrom<Value> for DeviceType {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        device_type_from_raw(value.as_i64()?)
    }
}

impl From<PermissionAction> for Value {
    fn from(value: PermissionAction) -> Self {
        Value::Int32(value.raw())
    }
}

impl TryFrom<Value> for PermissionAction {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let raw = value.as_i64()?;
        PermissionAction::from_raw(raw)
            .ok_or(CodecError::InvalidEnum { type_name: "PermissionAction", raw })
    }
}

impl From<ErrorCode> for Value {
    fn from(value: ErrorCode) -> Self {
        Value::Int32(value.raw())
    }
}

impl TryFrom<Value> for ErrorCode {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let raw = value.as_i64()?;
        ErrorCode::from_raw(raw)
            .ok_or(CodecError::InvalidEnum { type_name: "ErrorCode", raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn full_device() -> UwbDevice {
        UwbDevice {
            id: "dev-1".to_string(),
            name: "Pixel".to_string(),
            uwb_data: Some(UwbData {
                distance: Some(1.25),
                azimuth: Some(-30.0),
                elevation: Some(12.5),
                direction: Some(Direction3D { x: 0.1, y: -0.2, z: 0.97 }),
                horizontal_angle: Some(0.52),
            }),
            device_type: DeviceType::Smartphone,
            state: Some(DeviceState::Ranging),
        }
    }

    #[test]
    fn test_device_round_trip_all_fields() {
        let value = Value::from(full_device());
        let decoded = decode(&encode(&value)).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(UwbDevice::try_from(decoded).unwrap(), full_device());
    }

    #[test]
    fn test_device_round_trip_optional_fields_absent() {
        let device = UwbDevice::new("dev-2", "Tag", DeviceType::Accessory);
        let decoded = decode(&encode(&Value::from(device.clone()))).unwrap();
        assert_eq!(UwbDevice::try_from(decoded).unwrap(), device);
    }

    #[test]
    fn test_uwb_data_round_trip() {
        let empty = UwbData::default();
        let decoded = decode(&encode(&Value::from(empty.clone()))).unwrap();
        assert_eq!(UwbData::try_from(decoded).unwrap(), empty);

        // zero is a measurement, not an absent value
        let zeros = UwbData {
            distance: Some(0.0),
            azimuth: None,
            elevation: Some(0.0),
            direction: None,
            horizontal_angle: Some(0.0),
        };
        let decoded = decode(&encode(&Value::from(zeros.clone()))).unwrap();
        assert_eq!(UwbData::try_from(decoded).unwrap(), zeros);
    }

    #[test]
    fn test_direction_round_trip() {
        let direction = Direction3D { x: 1.0, y: 2.0, z: -3.5 };
        let encoded = encode(&Value::from(direction));
        assert_eq!(encoded[0], 128);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(Direction3D::try_from(decoded).unwrap(), direction);
    }

    #[test]
    fn test_tags_are_in_private_range() {
        assert_eq!(encode(&Value::from(UwbData::default()))[0], 129);
        assert_eq!(encode(&Value::from(full_device()))[0], 130);
        for tag in CustomTag::ALL {
            assert!(tag.as_u8() >= 128);
            assert_eq!(CustomTag::from_u8(tag.as_u8()), Some(tag));
        }
    }

    #[test]
    fn test_nested_values_are_plain_lists() {
        let fields = CustomValue::UwbDevice(full_device()).to_list();
        assert!(matches!(fields[2], Value::List(_)));
        assert_eq!(fields[3], Value::Int32(0));
        assert_eq!(fields[4], Value::Int32(6));
    }

    #[test]
    fn test_nested_tagged_values_are_accepted() {
        let mut fields = CustomValue::UwbDevice(full_device()).to_list();
        fields[2] = Value::from(full_device().uwb_data.unwrap());
        let decoded = CustomValue::from_list(CustomTag::UwbDevice, fields).unwrap();
        assert_eq!(decoded, CustomValue::UwbDevice(full_device()));
    }

    #[test]
    fn test_missing_required_field() {
        let fields = vec![Value::from("dev-1"), Value::Null];
        assert_eq!(
            CustomValue::from_list(CustomTag::UwbDevice, fields),
            Err(CodecError::MissingField { type_name: "UwbDevice", field: "name" })
        );

        let fields = vec![Value::Float64(1.0), Value::Float64(2.0)];
        assert_eq!(
            CustomValue::from_list(CustomTag::Direction3D, fields),
            Err(CodecError::MissingField { type_name: "Direction3D", field: "z" })
        );
    }

    #[test]
    fn test_invalid_enum_and_wrong_kind() {
        let mut fields = CustomValue::UwbDevice(full_device()).to_list();
        fields[4] = Value::Int32(42);
        assert_eq!(
            CustomValue::from_list(CustomTag::UwbDevice, fields),
            Err(CodecError::InvalidEnum { type_name: "DeviceState", raw: 42 })
        );

        let fields = vec![Value::from("x"), Value::Float64(0.0), Value::Float64(0.0)];
        assert_eq!(
            CustomValue::from_list(CustomTag::Direction3D, fields),
            Err(CodecError::TypeMismatch { expected: "float64", found: "string" })
        );
    }

    #[test]
    fn test_enum_values_accept_both_integer_widths() {
        assert_eq!(DeviceState::try_from(Value::Int64(2)), Ok(DeviceState::Found));
        assert_eq!(
            PermissionAction::try_from(Value::from(PermissionAction::Restart)),
            Ok(PermissionAction::Restart)
        );
        assert!(ErrorCode::try_from(Value::Int32(9)).is_err());
    }
}
