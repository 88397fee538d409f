//! Operations the controller invokes on the host.

use std::sync::Arc;

use async_trait::async_trait;
use log::{trace, warn};

use super::{call, channel_name, wrap_outcome, Args};
use crate::codec::Value;
use crate::error::UwbError;
use crate::messenger::{BinaryMessenger, MessageHandler};
use crate::model::UwbDevice;

#[cfg(test)]
use mockall::automock;

pub const HOST_API: &str = "UwbHostApi";

/// Host side contract. Every call completes exactly once, either with its
/// result or with a [`UwbError`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UwbHostApi: Send + Sync + 'static {
    /// Starts advertising `device_name` and scanning for peers.
    async fn discover_devices(&self, device_name: String) -> Result<(), UwbError>;

    async fn stop_discovery(&self) -> Result<(), UwbError>;

    async fn handle_connection_request(
        &self, device: UwbDevice, accept: bool,
    ) -> Result<(), UwbError>;

    async fn is_uwb_supported(&self) -> Result<bool, UwbError>;

    async fn start_ranging(&self, device: UwbDevice) -> Result<(), UwbError>;

    async fn stop_ranging(&self, device: UwbDevice) -> Result<(), UwbError>;

    async fn stop_uwb_sessions(&self) -> Result<(), UwbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOperation {
    DiscoverDevices,
    StopDiscovery,
    HandleConnectionRequest,
    IsUwbSupported,
    StartRanging,
    StopRanging,
    StopUwbSessions,
}

impl HostOperation {
    pub const ALL: [HostOperation; 7] = [
        HostOperation::DiscoverDevices,
        HostOperation::StopDiscovery,
        HostOperation::HandleConnectionRequest,
        HostOperation::IsUwbSupported,
        HostOperation::StartRanging,
        HostOperation::StopRanging,
        HostOperation::StopUwbSessions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HostOperation::DiscoverDevices => "discoverDevices",
            HostOperation::StopDiscovery => "stopDiscovery",
            HostOperation::HandleConnectionRequest => "handleConnectionRequest",
            HostOperation::IsUwbSupported => "isUwbSupported",
            HostOperation::StartRanging => "startRanging",
            HostOperation::StopRanging => "stopRanging",
            HostOperation::StopUwbSessions => "stopUwbSessions",
        }
    }

    pub fn channel_name(&self, namespace: &str) -> String {
        channel_name(namespace, HOST_API, self.name())
    }

    async fn dispatch(
        &self, api: &dyn UwbHostApi, mut args: Args,
    ) -> Result<Value, UwbError> {
        match self {
            HostOperation::DiscoverDevices => {
                api.discover_devices(args.take(0)?).await?;
            }
            HostOperation::StopDiscovery => api.stop_discovery().await?,
            HostOperation::HandleConnectionRequest => {
                let device = args.take(0)?;
                let accept = args.take(1)?;
                api.handle_connection_request(device, accept).await?;
            }
            HostOperation::IsUwbSupported => {
                return api.is_uwb_supported().await.map(Value::from);
            }
            HostOperation::StartRanging => api.start_ranging(args.take(0)?).await?,
            HostOperation::StopRanging => api.stop_ranging(args.take(0)?).await?,
            HostOperation::StopUwbSessions => api.stop_uwb_sessions().await?,
        }

        Ok(Value::Null)
    }
}

struct HostOperationHandler {
    operation: HostOperation,
    api: Arc<dyn UwbHostApi>,
}

#[async_trait]
impl MessageHandler for HostOperationHandler {
    async fn on_message(&self, message: Vec<u8>) -> Vec<u8> {
        trace!("{} received {} bytes", self.operation.name(), message.len());

        let outcome = match Args::decode(&message) {
            Ok(args) => self.operation.dispatch(self.api.as_ref(), args).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &outcome {
            warn!("{} failed: {}", self.operation.name(), e);
        }

        wrap_outcome(outcome)
    }
}

/// Installs a handler for every host operation, or removes them all when
/// `api` is `None`.
pub fn register_host_api(
    messenger: &dyn BinaryMessenger, namespace: &str,
    api: Option<Arc<dyn UwbHostApi>>,
) {
    for operation in HostOperation::ALL {
        let handler = api.clone().map(|api| {
            Arc::new(HostOperationHandler { operation, api })
                as Arc<dyn MessageHandler>
        });

        messenger.set_message_handler(&operation.channel_name(namespace), handler);
    }
}

/// Controller side stub: every method is a call on the matching channel.
#[derive(Clone)]
pub struct UwbHostClient {
    messenger: Arc<dyn BinaryMessenger>,
    namespace: String,
}

impl UwbHostClient {
    pub fn new(messenger: Arc<dyn BinaryMessenger>, namespace: &str) -> Self {
        Self { messenger, namespace: namespace.to_string() }
    }

    async fn invoke(
        &self, operation: HostOperation, args: Vec<Value>,
    ) -> Result<Value, UwbError> {
        let channel = operation.channel_name(&self.namespace);
        call(self.messenger.as_ref(), &channel, args).await
    }
}

#[async_trait]
impl UwbHostApi for UwbHostClient {
    async fn discover_devices(&self, device_name: String) -> Result<(), UwbError> {
        self.invoke(HostOperation::DiscoverDevices, vec![device_name.into()])
            .await
            .map(|_| ())
    }

    async fn stop_discovery(&self) -> Result<(), UwbError> {
        self.invoke(HostOperation::StopDiscovery, vec![]).await.map(|_| ())
    }

    async fn handle_connection_request(
        &self, device: UwbDevice, accept: bool,
    ) -> Result<(), UwbError> {
        self.invoke(
            HostOperation::HandleConnectionRequest,
            vec![device.into(), accept.into()],
        )
        .await
        .map(|_| ())
    }

    async fn is_uwb_supported(&self) -> Result<bool, UwbError> {
        let value = self.invoke(HostOperation::IsUwbSupported, vec![]).await?;
        Ok(bool::try_from(value)?)
    }

    async fn start_ranging(&self, device: UwbDevice) -> Result<(), UwbError> {
        self.invoke(HostOperation::StartRanging, vec![device.into()])
            .await
            .map(|_| ())
    }

    async fn stop_ranging(&self, device: UwbDevice) -> Result<(), UwbError> {
        self.invoke(HostOperation::StopRanging, vec![device.into()])
            .await
            .map(|_| ())
    }

    async fn stop_uwb_sessions(&self) -> Result<(), UwbError> {
        self.invoke(HostOperation::StopUwbSessions, vec![]).await.map(|_| ())
    }
}
