//! Ordered delivery of controller events.
//!
//! Events are enqueued without awaiting, so the host can enqueue while it
//! still holds its state lock. That keeps the delivery order identical to the
//! order in which the transitions happened. A single task delivers them one
//! at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::api::controller::{UwbControllerApi, UwbEvent};
use crate::error::UwbError;

/// An event the controller did not acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct UndeliveredEvent {
    pub event: UwbEvent,
    pub error: UwbError,
}

struct QueuedEvent {
    event: UwbEvent,
    discovery_epoch: u64,
}

pub struct EventQueue {
    event_tx: mpsc::UnboundedSender<QueuedEvent>,
    discovery_epoch: Arc<AtomicU64>,
    _drop_tx: oneshot::Sender<()>,
}

impl EventQueue {
    pub fn new(
        controller: Arc<dyn UwbControllerApi>, undelivered_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<UndeliveredEvent>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<QueuedEvent>();
        let (undelivered_tx, undelivered_rx) =
            mpsc::channel(undelivered_buffer_size);
        let (drop_tx, mut drop_rx) = oneshot::channel();
        let discovery_epoch = Arc::new(AtomicU64::new(0));

        let epoch = discovery_epoch.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(queued) = event_rx.recv() => {
                        Self::deliver(
                            controller.as_ref(),
                            queued,
                            &epoch,
                            &undelivered_tx,
                        )
                        .await;
                    }
                    _ = &mut drop_rx => {
                        info!("Event queue task is stopping");
                        break;
                    }
                }
            }
        });

        let queue = Self { event_tx, discovery_epoch, _drop_tx: drop_tx };

        (queue, undelivered_rx)
    }

    async fn deliver(
        controller: &dyn UwbControllerApi, queued: QueuedEvent,
        epoch: &AtomicU64, undelivered_tx: &mpsc::Sender<UndeliveredEvent>,
    ) {
        let QueuedEvent { event, discovery_epoch } = queued;
        let kind = event.kind();

        if kind.is_discovery_scoped()
            && discovery_epoch != epoch.load(Ordering::SeqCst)
        {
            debug!("Dropping {} from a stopped discovery", kind.name());
            return;
        }

        trace!("Delivering {}", kind.name());

        if let Err(e) = event.clone().deliver(controller).await {
            warn!("Controller did not take {}: {}", kind.name(), e);

            let undelivered = UndeliveredEvent { event, error: e };
            if undelivered_tx.try_send(undelivered).is_err() {
                error!("Undelivered queue is full or closed, {} lost", kind.name());
            }
        }
    }

    /// Enqueues `event` tagged with the current discovery session.
    pub fn push(&self, event: UwbEvent) {
        let queued = QueuedEvent {
            event,
            discovery_epoch: self.discovery_epoch.load(Ordering::SeqCst),
        };

        if self.event_tx.send(queued).is_err() {
            error!("Event queue task is gone, event dropped");
        }
    }

    /// Voids every queued event of the current discovery session.
    pub fn end_discovery(&self) {
        self.discovery_epoch.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::controller::MockUwbControllerApi;
    use crate::model::{
        DeviceState, DeviceType, ErrorCode, PermissionAction, UwbDevice,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn phone(id: &str, state: DeviceState) -> UwbDevice {
        UwbDevice::new(id, "Phone", DeviceType::Smartphone).with_state(state)
    }

    #[tokio::test]
    async fn test_events_keep_their_order() {
        init_logger();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let found_tx = order_tx.clone();
        let connected_tx = order_tx.clone();

        let mut controller = MockUwbControllerApi::new();
        controller.expect_on_discovery_device_found().returning(move |d| {
            let _ = found_tx.send(format!("found {}", d.id));
            Ok(())
        });
        controller.expect_on_discovery_device_connected().returning(move |d| {
            let _ = connected_tx.send(format!("connected {}", d.id));
            Ok(())
        });

        let (queue, _undelivered) = EventQueue::new(Arc::new(controller), 8);
        queue.push(UwbEvent::DeviceFound(phone("a", DeviceState::Found)));
        queue.push(UwbEvent::DeviceFound(phone("b", DeviceState::Found)));
        queue.push(UwbEvent::DeviceConnected(phone("a", DeviceState::Connected)));

        for expected in ["found a", "found b", "connected a"] {
            assert_eq!(order_rx.recv().await.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_stale_discovery_events_are_dropped() {
        init_logger();

        let mut controller = MockUwbControllerApi::new();
        controller.expect_on_discovery_device_found().never();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        controller.expect_on_permission_required().times(1).returning(move |_| {
            let _ = done_tx.send(());
            Ok(())
        });

        let (queue, _undelivered) = EventQueue::new(Arc::new(controller), 8);
        queue.push(UwbEvent::DeviceFound(phone("a", DeviceState::Found)));
        queue.end_discovery();
        queue.push(UwbEvent::PermissionRequired(PermissionAction::Request));

        assert_eq!(done_rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_failed_delivery_is_reported() {
        init_logger();

        let mut controller = MockUwbControllerApi::new();
        controller
            .expect_on_uwb_session_started()
            .returning(|_| Err(UwbError::domain(ErrorCode::OobError, "busy")));

        let (queue, mut undelivered) = EventQueue::new(Arc::new(controller), 8);
        let event = UwbEvent::SessionStarted(phone("a", DeviceState::Ranging));
        queue.push(event.clone());

        let failed = timeout(Duration::from_secs(1), undelivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.event, event);
        assert_eq!(failed.error.code(), Some(ErrorCode::OobError));
    }
}
