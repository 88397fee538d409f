//! Typed calls on top of the byte channels.
//!
//! A call carries its positional arguments as one encoded list. The reply is
//! a list too: `[result]` on success, `[code, message, details]` on error.

pub mod controller;
pub mod host;

use log::{debug, trace};

use crate::codec::{self, CodecError, Value};
use crate::error::UwbError;
use crate::messenger::BinaryMessenger;

pub const DEFAULT_NAMESPACE: &str = "dev.flutter.pigeon.uwb";

/// Flat channel identifier `<namespace>.<api>.<operation>`.
pub fn channel_name(namespace: &str, api: &str, operation: &str) -> String {
    format!("{}.{}.{}", namespace, api, operation)
}

pub fn wrap_result(value: Value) -> Vec<u8> {
    codec::encode(&Value::List(vec![value]))
}

pub fn wrap_error(err: &UwbError) -> Vec<u8> {
    let (code, message, details) = err.to_wire();
    codec::encode(&Value::List(vec![
        Value::String(code),
        Value::from(message),
        details,
    ]))
}

/// Wraps the outcome of a handler into its reply message.
pub fn wrap_outcome(outcome: Result<Value, UwbError>) -> Vec<u8> {
    match outcome {
        Ok(value) => wrap_result(value),
        Err(err) => wrap_error(&err),
    }
}

/// Sends a call and waits for its reply. Transport failures become a
/// channel error carrying the channel name.
pub async fn call(
    messenger: &dyn BinaryMessenger, channel: &str, args: Vec<Value>,
) -> Result<Value, UwbError> {
    let message = if args.is_empty() {
        codec::encode(&Value::Null)
    } else {
        codec::encode(&Value::List(args))
    };

    trace!("Sending {} bytes on channel: {}", message.len(), channel);

    let reply = messenger.send(channel, message).await.map_err(|e| {
        debug!("Delivery on channel {} failed: {}", channel, e);
        UwbError::channel(channel)
    })?;

    decode_reply(&reply)
}

pub fn decode_reply(reply: &[u8]) -> Result<Value, UwbError> {
    let items = match codec::decode(reply)? {
        Value::List(items) => items,
        other => return Err(other.mismatch("reply list").into()),
    };

    let mut items = items.into_iter();
    match (items.next(), items.next(), items.next()) {
        (result, None, None) => Ok(result.unwrap_or_default()),
        (Some(code), message, details) => {
            let code = String::try_from(code)?;
            let message = match message {
                Some(Value::String(message)) => Some(message),
                _ => None,
            };
            Err(UwbError::from_wire(code, message, details.unwrap_or_default()))
        }
        (None, _, _) => Ok(Value::Null),
    }
}

/// Positional arguments of an incoming call.
#[derive(Debug, Default)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn decode(message: &[u8]) -> Result<Self, CodecError> {
        if message.is_empty() {
            return Ok(Self::default());
        }

        match codec::decode(message)? {
            Value::Null => Ok(Self::default()),
            Value::List(values) => Ok(Self { values }),
            other => Err(other.mismatch("argument list")),
        }
    }

    pub fn take<T>(&mut self, index: usize) -> Result<T, CodecError>
    where
        T: TryFrom<Value, Error = CodecError>,
    {
        let value = self
            .values
            .get_mut(index)
            .map(std::mem::take)
            .filter(|v| !v.is_null())
            .ok_or(CodecError::MissingArgument(index))?;

        T::try_from(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::{DeliveryError, MockBinaryMessenger};
    use crate::model::{DeviceType, ErrorCode, UwbDevice};

    #[test]
    fn test_channel_name() {
        assert_eq!(
            channel_name(DEFAULT_NAMESPACE, "UwbHostApi", "discoverDevices"),
            "dev.flutter.pigeon.uwb.UwbHostApi.discoverDevices"
        );
    }

    #[test]
    fn test_reply_envelopes() {
        assert_eq!(decode_reply(&wrap_result(Value::Null)), Ok(Value::Null));
        assert_eq!(decode_reply(&wrap_result(Value::Bool(true))), Ok(Value::Bool(true)));

        let err = UwbError::domain(ErrorCode::OobDeviceNotFound, "dev-9");
        assert_eq!(decode_reply(&wrap_error(&err)), Err(err));
    }

    #[test]
    fn test_malformed_reply() {
        let reply = codec::encode(&Value::Int32(1));
        assert!(matches!(decode_reply(&reply), Err(UwbError::Codec(_))));
    }

    #[test]
    fn test_args() {
        let device = UwbDevice::new("dev-1", "Phone", DeviceType::Smartphone);
        let message = codec::encode(&Value::List(vec![
            Value::from(device.clone()),
            Value::Bool(true),
        ]));

        let mut args = Args::decode(&message).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args.take::<UwbDevice>(0), Ok(device));
        assert_eq!(args.take::<bool>(1), Ok(true));
        assert_eq!(args.take::<bool>(2), Err(CodecError::MissingArgument(2)));

        assert!(Args::decode(&codec::encode(&Value::Null)).unwrap().is_empty());
        assert!(Args::decode(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_maps_delivery_failure_to_channel_error() {
        let mut messenger = MockBinaryMessenger::new();
        messenger
            .expect_send()
            .returning(|_, _| Err(DeliveryError::NoHandler));

        let result = call(&messenger, "ns.Api.op", vec![]).await;
        assert_eq!(result, Err(UwbError::channel("ns.Api.op")));
    }

    #[tokio::test]
    async fn test_call_sends_null_without_arguments() {
        let mut messenger = MockBinaryMessenger::new();
        messenger
            .expect_send()
            .withf(|channel, message| channel == "ns.Api.op" && message == &vec![0])
            .returning(|_, _| Ok(wrap_result(Value::Bool(false))));

        let result = call(&messenger, "ns.Api.op", vec![]).await;
        assert_eq!(result, Ok(Value::Bool(false)));
    }
}
