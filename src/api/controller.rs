//! Events the host pushes to the controller.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{trace, warn};

use super::{call, channel_name, wrap_outcome, Args};
use crate::codec::{CodecError, Value};
use crate::device_state::DeviceStateMachine;
use crate::error::UwbError;
use crate::messenger::{BinaryMessenger, MessageHandler};
use crate::model::{PermissionAction, UwbDevice};

#[cfg(test)]
use mockall::automock;

pub const CONTROLLER_API: &str = "UwbFlutterApi";

/// Controller side contract. Each push is acknowledged exactly once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UwbControllerApi: Send + Sync + 'static {
    async fn on_discovery_device_connected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_discovery_device_disconnected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_discovery_device_found(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_discovery_device_lost(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_discovery_device_rejected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_discovery_connection_request_received(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_permission_required(
        &self, action: PermissionAction,
    ) -> Result<(), UwbError>;

    async fn on_uwb_session_started(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;

    async fn on_uwb_session_disconnected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerEvent {
    DeviceConnected,
    DeviceDisconnected,
    DeviceFound,
    DeviceLost,
    DeviceRejected,
    ConnectionRequestReceived,
    PermissionRequired,
    SessionStarted,
    SessionDisconnected,
}

impl ControllerEvent {
    pub const ALL: [ControllerEvent; 9] = [
        ControllerEvent::DeviceConnected,
        ControllerEvent::DeviceDisconnected,
        ControllerEvent::DeviceFound,
        ControllerEvent::DeviceLost,
        ControllerEvent::DeviceRejected,
        ControllerEvent::ConnectionRequestReceived,
        ControllerEvent::PermissionRequired,
        ControllerEvent::SessionStarted,
        ControllerEvent::SessionDisconnected,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ControllerEvent::DeviceConnected => "onDiscoveryDeviceConnected",
            ControllerEvent::DeviceDisconnected => "onDiscoveryDeviceDisconnected",
            ControllerEvent::DeviceFound => "onDiscoveryDeviceFound",
            ControllerEvent::DeviceLost => "onDiscoveryDeviceLost",
            ControllerEvent::DeviceRejected => "onDiscoveryDeviceRejected",
            ControllerEvent::ConnectionRequestReceived => {
                "onDiscoveryConnectionRequestReceived"
            }
            ControllerEvent::PermissionRequired => "onPermissionRequired",
            ControllerEvent::SessionStarted => "onUwbSessionStarted",
            ControllerEvent::SessionDisconnected => "onUwbSessionDisconnected",
        }
    }

    pub fn channel_name(&self, namespace: &str) -> String {
        channel_name(namespace, CONTROLLER_API, self.name())
    }

    /// Events that belong to a discovery session and are void once it stops.
    pub fn is_discovery_scoped(&self) -> bool {
        matches!(
            self,
            ControllerEvent::DeviceFound
                | ControllerEvent::DeviceLost
                | ControllerEvent::DeviceRejected
                | ControllerEvent::ConnectionRequestReceived
        )
    }
}

/// Payload of one push.
#[derive(Debug, Clone, PartialEq)]
pub enum UwbEvent {
    DeviceConnected(UwbDevice),
    DeviceDisconnected(UwbDevice),
    DeviceFound(UwbDevice),
    DeviceLost(UwbDevice),
    DeviceRejected(UwbDevice),
    ConnectionRequestReceived(UwbDevice),
    PermissionRequired(PermissionAction),
    SessionStarted(UwbDevice),
    SessionDisconnected(UwbDevice),
}

impl UwbEvent {
    pub fn kind(&self) -> ControllerEvent {
        match self {
            UwbEvent::DeviceConnected(_) => ControllerEvent::DeviceConnected,
            UwbEvent::DeviceDisconnected(_) => ControllerEvent::DeviceDisconnected,
            UwbEvent::DeviceFound(_) => ControllerEvent::DeviceFound,
            UwbEvent::DeviceLost(_) => ControllerEvent::DeviceLost,
            UwbEvent::DeviceRejected(_) => ControllerEvent::DeviceRejected,
            UwbEvent::ConnectionRequestReceived(_) => {
                ControllerEvent::ConnectionRequestReceived
            }
            UwbEvent::PermissionRequired(_) => ControllerEvent::PermissionRequired,
            UwbEvent::SessionStarted(_) => ControllerEvent::SessionStarted,
            UwbEvent::SessionDisconnected(_) => ControllerEvent::SessionDisconnected,
        }
    }

    pub fn device(&self) -> Option<&UwbDevice> {
        match self {
            UwbEvent::DeviceConnected(device)
            | UwbEvent::DeviceDisconnected(device)
            | UwbEvent::DeviceFound(device)
            | UwbEvent::DeviceLost(device)
            | UwbEvent::DeviceRejected(device)
            | UwbEvent::ConnectionRequestReceived(device)
            | UwbEvent::SessionStarted(device)
            | UwbEvent::SessionDisconnected(device) => Some(device),
            UwbEvent::PermissionRequired(_) => None,
        }
    }

    pub fn into_args(self) -> Vec<Value> {
        match self {
            UwbEvent::PermissionRequired(action) => vec![action.into()],
            UwbEvent::DeviceConnected(device)
            | UwbEvent::DeviceDisconnected(device)
            | UwbEvent::DeviceFound(device)
            | UwbEvent::DeviceLost(device)
            | UwbEvent::DeviceRejected(device)
            | UwbEvent::ConnectionRequestReceived(device)
            | UwbEvent::SessionStarted(device)
            | UwbEvent::SessionDisconnected(device) => vec![device.into()],
        }
    }

    pub fn decode(kind: ControllerEvent, mut args: Args) -> Result<Self, CodecError> {
        let event = match kind {
            ControllerEvent::DeviceConnected => UwbEvent::DeviceConnected(args.take(0)?),
            ControllerEvent::DeviceDisconnected => {
                UwbEvent::DeviceDisconnected(args.take(0)?)
            }
            ControllerEvent::DeviceFound => UwbEvent::DeviceFound(args.take(0)?),
            ControllerEvent::DeviceLost => UwbEvent::DeviceLost(args.take(0)?),
            ControllerEvent::DeviceRejected => UwbEvent::DeviceRejected(args.take(0)?),
            ControllerEvent::ConnectionRequestReceived => {
                UwbEvent::ConnectionRequestReceived(args.take(0)?)
            }
            ControllerEvent::PermissionRequired => {
                UwbEvent::PermissionRequired(args.take(0)?)
            }
            ControllerEvent::SessionStarted => UwbEvent::SessionStarted(args.take(0)?),
            ControllerEvent::SessionDisconnected => {
                UwbEvent::SessionDisconnected(args.take(0)?)
            }
        };

        Ok(event)
    }

    /// Invokes the trait method matching this event.
    pub async fn deliver(self, api: &dyn UwbControllerApi) -> Result<(), UwbError> {
        match self {
            UwbEvent::DeviceConnected(d) => api.on_discovery_device_connected(d).await,
            UwbEvent::DeviceDisconnected(d) => {
                api.on_discovery_device_disconnected(d).await
            }
            UwbEvent::DeviceFound(d) => api.on_discovery_device_found(d).await,
            UwbEvent::DeviceLost(d) => api.on_discovery_device_lost(d).await,
            UwbEvent::DeviceRejected(d) => api.on_discovery_device_rejected(d).await,
            UwbEvent::ConnectionRequestReceived(d) => {
                api.on_discovery_connection_request_received(d).await
            }
            UwbEvent::PermissionRequired(a) => api.on_permission_required(a).await,
            UwbEvent::SessionStarted(d) => api.on_uwb_session_started(d).await,
            UwbEvent::SessionDisconnected(d) => {
                api.on_uwb_session_disconnected(d).await
            }
        }
    }
}

struct ControllerEventHandler {
    event: ControllerEvent,
    api: Arc<dyn UwbControllerApi>,
}

#[async_trait]
impl MessageHandler for ControllerEventHandler {
    async fn on_message(&self, message: Vec<u8>) -> Vec<u8> {
        trace!("{} received {} bytes", self.event.name(), message.len());

        let event = Args::decode(&message)
            .and_then(|args| UwbEvent::decode(self.event, args));

        let outcome = match event {
            Ok(event) => event.deliver(self.api.as_ref()).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &outcome {
            warn!("{} handler failed: {}", self.event.name(), e);
        }

        wrap_outcome(outcome.map(|_| Value::Null))
    }
}

/// Installs a handler for every controller event, or removes them all when
/// `api` is `None`.
pub fn register_controller_api(
    messenger: &dyn BinaryMessenger, namespace: &str,
    api: Option<Arc<dyn UwbControllerApi>>,
) {
    for event in ControllerEvent::ALL {
        let handler = api.clone().map(|api| {
            Arc::new(ControllerEventHandler { event, api }) as Arc<dyn MessageHandler>
        });

        messenger.set_message_handler(&event.channel_name(namespace), handler);
    }
}

/// Host side stub: every method pushes on the matching channel.
#[derive(Clone)]
pub struct UwbControllerClient {
    messenger: Arc<dyn BinaryMessenger>,
    namespace: String,
}

impl UwbControllerClient {
    pub fn new(messenger: Arc<dyn BinaryMessenger>, namespace: &str) -> Self {
        Self { messenger, namespace: namespace.to_string() }
    }

    pub async fn push(&self, event: UwbEvent) -> Result<(), UwbError> {
        let channel = event.kind().channel_name(&self.namespace);
        call(self.messenger.as_ref(), &channel, event.into_args())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl UwbControllerApi for UwbControllerClient {
    async fn on_discovery_device_connected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::DeviceConnected(device)).await
    }

    async fn on_discovery_device_disconnected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::DeviceDisconnected(device)).await
    }

    async fn on_discovery_device_found(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::DeviceFound(device)).await
    }

    async fn on_discovery_device_lost(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::DeviceLost(device)).await
    }

    async fn on_discovery_device_rejected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::DeviceRejected(device)).await
    }

    async fn on_discovery_connection_request_received(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::ConnectionRequestReceived(device)).await
    }

    async fn on_permission_required(
        &self, action: PermissionAction,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::PermissionRequired(action)).await
    }

    async fn on_uwb_session_started(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::SessionStarted(device)).await
    }

    async fn on_uwb_session_disconnected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.push(UwbEvent::SessionDisconnected(device)).await
    }
}

/// Keeps a controller side copy of the device states.
///
/// Every pushed device is checked against the transition table before it is
/// forwarded to the wrapped handler. A push that does not follow from the
/// mirrored state is refused with `OOB_CONNECTION_ERROR` and not forwarded.
pub struct DeviceMirror<C> {
    devices: Mutex<DeviceStateMachine>,
    inner: C,
}

impl<C: UwbControllerApi> DeviceMirror<C> {
    pub fn new(inner: C) -> Self {
        Self { devices: Mutex::new(DeviceStateMachine::new()), inner }
    }

    pub fn device(&self, id: &str) -> Option<UwbDevice> {
        self.lock().get(id).cloned()
    }

    pub fn devices(&self) -> Vec<UwbDevice> {
        self.lock().devices()
    }

    /// Forgets the discovery candidates, the host does the same when
    /// `stopDiscovery` completes.
    pub fn discovery_stopped(&self) -> Vec<String> {
        self.lock().prune_candidates()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceStateMachine> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn mirror(&self, event: UwbEvent) -> Result<(), UwbError> {
        if let Some(device) = event.device() {
            self.lock().follow(device)?;
        }

        event.deliver(&self.inner).await
    }
}

#[async_trait]
impl<C: UwbControllerApi> UwbControllerApi for DeviceMirror<C> {
    async fn on_discovery_device_connected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::DeviceConnected(device)).await
    }

    async fn on_discovery_device_disconnected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::DeviceDisconnected(device)).await
    }

    async fn on_discovery_device_found(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::DeviceFound(device)).await
    }

    async fn on_discovery_device_lost(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::DeviceLost(device)).await
    }

    async fn on_discovery_device_rejected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::DeviceRejected(device)).await
    }

    async fn on_discovery_connection_request_received(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::ConnectionRequestReceived(device)).await
    }

    async fn on_permission_required(
        &self, action: PermissionAction,
    ) -> Result<(), UwbError> {
        self.inner.on_permission_required(action).await
    }

    async fn on_uwb_session_started(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::SessionStarted(device)).await
    }

    async fn on_uwb_session_disconnected(
        &self, device: UwbDevice,
    ) -> Result<(), UwbError> {
        self.mirror(UwbEvent::SessionDisconnected(device)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DEFAULT_NAMESPACE;
    use crate::messenger::Endpoint;
    use crate::model::{DeviceState, DeviceType, ErrorCode};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn phone(state: DeviceState) -> UwbDevice {
        UwbDevice::new("dev-1", "Phone", DeviceType::Smartphone).with_state(state)
    }

    fn connect(api: impl UwbControllerApi) -> (UwbControllerClient, Endpoint) {
        let (controller, host) = Endpoint::pair(8);
        register_controller_api(&controller, DEFAULT_NAMESPACE, Some(Arc::new(api)));
        (UwbControllerClient::new(Arc::new(host), DEFAULT_NAMESPACE), controller)
    }

    #[test]
    fn test_event_table() {
        assert_eq!(
            ControllerEvent::ConnectionRequestReceived.channel_name("ns"),
            "ns.UwbFlutterApi.onDiscoveryConnectionRequestReceived"
        );
        assert_eq!(
            ControllerEvent::ALL.iter().filter(|e| e.is_discovery_scoped()).count(),
            4
        );

        let event = UwbEvent::PermissionRequired(PermissionAction::Restart);
        assert_eq!(event.kind(), ControllerEvent::PermissionRequired);
        assert_eq!(event.device(), None);
    }

    #[tokio::test]
    async fn test_push_reaches_the_controller() {
        init_logger();

        let mut api = MockUwbControllerApi::new();
        api.expect_on_discovery_device_found()
            .withf(|device| device.id == "dev-1")
            .times(1)
            .returning(|_| Ok(()));
        api.expect_on_permission_required()
            .withf(|action| *action == PermissionAction::Request)
            .times(1)
            .returning(|_| Ok(()));

        let (client, _controller) = connect(api);

        assert_eq!(client.on_discovery_device_found(phone(DeviceState::Found)).await, Ok(()));
        assert_eq!(client.on_permission_required(PermissionAction::Request).await, Ok(()));
    }

    #[tokio::test]
    async fn test_handler_error_is_returned_to_the_pusher() {
        init_logger();

        let mut api = MockUwbControllerApi::new();
        api.expect_on_uwb_session_started().returning(|_| {
            Err(UwbError::domain(ErrorCode::UwbError, "ui not ready"))
        });

        let (client, _controller) = connect(api);

        assert_eq!(
            client.on_uwb_session_started(phone(DeviceState::Ranging)).await,
            Err(UwbError::domain(ErrorCode::UwbError, "ui not ready"))
        );
    }

    #[tokio::test]
    async fn test_push_to_a_closed_controller() {
        init_logger();

        let (client, controller) = connect(MockUwbControllerApi::new());
        drop(controller);

        assert_eq!(
            client.on_discovery_device_lost(phone(DeviceState::Lost)).await,
            Err(UwbError::channel(
                "dev.flutter.pigeon.uwb.UwbFlutterApi.onDiscoveryDeviceLost"
            ))
        );
    }

    #[tokio::test]
    async fn test_mirror_follows_valid_pushes() {
        init_logger();

        let mut api = MockUwbControllerApi::new();
        api.expect_on_discovery_device_found().times(1).returning(|_| Ok(()));
        api.expect_on_discovery_connection_request_received()
            .times(1)
            .returning(|_| Ok(()));
        api.expect_on_discovery_device_connected().times(1).returning(|_| Ok(()));

        let mirror = DeviceMirror::new(api);

        mirror.on_discovery_device_found(phone(DeviceState::Found)).await.unwrap();
        mirror
            .on_discovery_connection_request_received(phone(DeviceState::Pending))
            .await
            .unwrap();
        mirror
            .on_discovery_device_connected(phone(DeviceState::Connected))
            .await
            .unwrap();

        assert_eq!(
            mirror.device("dev-1").and_then(|d| d.state),
            Some(DeviceState::Connected)
        );
    }

    #[tokio::test]
    async fn test_mirror_refuses_out_of_order_pushes() {
        init_logger();

        let mut api = MockUwbControllerApi::new();
        api.expect_on_discovery_device_found().times(1).returning(|_| Ok(()));
        api.expect_on_uwb_session_started().never();

        let mirror = DeviceMirror::new(api);
        mirror.on_discovery_device_found(phone(DeviceState::Found)).await.unwrap();

        let err = mirror
            .on_uwb_session_started(phone(DeviceState::Ranging))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OobConnectionError));
        assert_eq!(
            mirror.device("dev-1").and_then(|d| d.state),
            Some(DeviceState::Found)
        );
    }

    #[tokio::test]
    async fn test_mirror_forgets_candidates_when_discovery_stops() {
        init_logger();

        let mut api = MockUwbControllerApi::new();
        api.expect_on_discovery_device_found().times(3).returning(|_| Ok(()));
        api.expect_on_discovery_device_lost().times(1).returning(|_| Ok(()));
        api.expect_on_discovery_connection_request_received()
            .times(1)
            .returning(|_| Ok(()));
        api.expect_on_discovery_device_connected().times(1).returning(|_| Ok(()));

        let mirror = DeviceMirror::new(api);
        let device = |id: &str, state| {
            UwbDevice::new(id, "Phone", DeviceType::Smartphone).with_state(state)
        };

        mirror.on_discovery_device_found(device("found", DeviceState::Found))
            .await
            .unwrap();
        mirror.on_discovery_device_found(device("lost", DeviceState::Found))
            .await
            .unwrap();
        mirror.on_discovery_device_lost(device("lost", DeviceState::Lost))
            .await
            .unwrap();
        mirror
            .on_discovery_connection_request_received(device(
                "conn",
                DeviceState::Pending,
            ))
            .await
            .unwrap();
        mirror
            .on_discovery_device_connected(device("conn", DeviceState::Connected))
            .await
            .unwrap();

        let mut pruned = mirror.discovery_stopped();
        pruned.sort();
        assert_eq!(pruned, vec!["found".to_string(), "lost".to_string()]);
        assert_eq!(mirror.devices().len(), 1);
        assert_eq!(
            mirror.device("conn").and_then(|d| d.state),
            Some(DeviceState::Connected)
        );

        // A later discovery starts from scratch.
        mirror.on_discovery_device_found(device("found", DeviceState::Found))
            .await
            .unwrap();
        assert_eq!(mirror.devices().len(), 2);
    }
}
