use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::frame::{Frame, FrameKind};
use super::{BinaryMessenger, DeliveryError, MessageHandler, Responder};

/// Capacity of the in-process pipe built by [`Endpoint::pair`].
const PAIR_PIPE_SIZE: usize = 64 * 1024;

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>;

enum Command {
    Call {
        channel: String,
        payload: Vec<u8>,
        resp: Responder<Result<Vec<u8>, DeliveryError>>,
    },
    Reply {
        id: u32,
        kind: FrameKind,
        payload: Vec<u8>,
    },
}

/// One side of a message channel over a byte stream.
///
/// Outgoing calls are matched to their replies by call id. Incoming calls
/// are routed to the handler registered for their channel, each on its own
/// task.
pub struct Endpoint {
    cmd_tx: mpsc::Sender<Command>,
    handlers: HandlerMap,
    _drop_tx: oneshot::Sender<()>,
}

impl Endpoint {
    pub fn new<R, W>(reader: R, writer: W, req_buffer_size: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(req_buffer_size);
        let (frame_tx, frame_rx) = mpsc::channel(req_buffer_size);
        let (drop_tx, drop_rx) = oneshot::channel();
        let handlers = HandlerMap::default();

        tokio::spawn(read_frames(reader, frame_tx));

        tokio::spawn(run_endpoint(
            writer,
            cmd_rx,
            cmd_tx.clone(),
            frame_rx,
            handlers.clone(),
            drop_rx,
        ));

        Self { cmd_tx, handlers, _drop_tx: drop_tx }
    }

    pub fn from_stream<S>(stream: S, req_buffer_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, req_buffer_size)
    }

    /// Two endpoints connected to each other in memory.
    pub fn pair(req_buffer_size: usize) -> (Endpoint, Endpoint) {
        let (a, b) = tokio::io::duplex(PAIR_PIPE_SIZE);
        (
            Self::from_stream(a, req_buffer_size),
            Self::from_stream(b, req_buffer_size),
        )
    }

    /// Resolves once the endpoint stopped, usually because the peer closed
    /// the stream.
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }
}

#[async_trait]
impl BinaryMessenger for Endpoint {
    async fn send(
        &self, channel: &str, message: Vec<u8>,
    ) -> Result<Vec<u8>, DeliveryError> {
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Call {
                channel: channel.to_string(),
                payload: message,
                resp: tx,
            })
            .await
            .map_err(|_| DeliveryError::Disconnected)?;

        rx.await.map_err(|_| DeliveryError::Disconnected)?
    }

    fn set_message_handler(
        &self, channel: &str, handler: Option<Arc<dyn MessageHandler>>,
    ) {
        let mut handlers =
            self.handlers.write().unwrap_or_else(|e| e.into_inner());

        match handler {
            Some(handler) => {
                if handlers.insert(channel.to_string(), handler).is_some() {
                    debug!("Replaced handler on channel: {}", channel);
                }
            }
            None => {
                handlers.remove(channel);
            }
        }
    }
}

async fn read_frames<R>(mut reader: R, frame_tx: mpsc::Sender<Frame>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = Frame::read_from(&mut reader) => frame,
            _ = frame_tx.closed() => break,
        };

        match frame {
            Ok(Some(frame)) => {
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("Peer closed the message stream");
                break;
            }
            Err(e) => {
                error!("Error reading frame: {:?}", e);
                break;
            }
        }
    }
}

async fn run_endpoint<W>(
    mut writer: W, mut cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>, mut frame_rx: mpsc::Receiver<Frame>,
    handlers: HandlerMap, mut drop_rx: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut pending: HashMap<u32, Responder<Result<Vec<u8>, DeliveryError>>> =
        HashMap::new();
    let mut next_id: u32 = 0;

    loop {
        tokio::select! {
            biased;

            _ = &mut drop_rx => {
                info!("Endpoint task is stopping");
                break;
            }

            Some(cmd) = cmd_rx.recv() => {
                let frame = match cmd {
                    Command::Call { channel, payload, resp } => {
                        next_id = next_id.wrapping_add(1);
                        trace!("Call {} on channel: {}", next_id, channel);
                        pending.insert(next_id, resp);
                        Frame { kind: FrameKind::Call, id: next_id, channel, payload }
                    }
                    Command::Reply { id, kind, payload } => {
                        Frame { kind, id, channel: String::new(), payload }
                    }
                };

                if let Err(e) = frame.write_to(&mut writer).await {
                    error!("Error writing frame: {:?}", e);
                    break;
                }
            }

            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Some(reply) = handle_frame(frame, &mut pending, &handlers, &cmd_tx) {
                            if let Err(e) = reply.write_to(&mut writer).await {
                                error!("Error writing frame: {:?}", e);
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Error shutting down writer: {:?}", e);
    }

    for (id, resp) in pending.drain() {
        debug!("Call {} dropped, transport disconnected", id);
        let _ = resp.send(Err(DeliveryError::Disconnected));
    }
}

/// Routes an incoming frame, returns the frame to write back immediately if
/// any.
fn handle_frame(
    frame: Frame,
    pending: &mut HashMap<u32, Responder<Result<Vec<u8>, DeliveryError>>>,
    handlers: &HandlerMap, cmd_tx: &mpsc::Sender<Command>,
) -> Option<Frame> {
    let Frame { kind, id, channel, payload } = frame;

    let result = match kind {
        FrameKind::Call => {
            let handler = handlers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&channel)
                .cloned();

            let Some(handler) = handler else {
                warn!("No handler registered on channel: {}", channel);
                return Some(Frame {
                    kind: FrameKind::Unhandled,
                    id,
                    channel,
                    payload: vec![],
                });
            };

            spawn_handler(id, channel, payload, handler, cmd_tx.clone());
            return None;
        }
        FrameKind::Reply => Ok(payload),
        FrameKind::Unhandled => Err(DeliveryError::NoHandler),
        FrameKind::Aborted => Err(DeliveryError::Aborted),
    };

    match pending.remove(&id) {
        Some(resp) => {
            if resp.send(result).is_err() {
                debug!("Caller of call {} is gone", id);
            }
        }
        None => warn!("Reply for unknown call id: {}", id),
    }

    None
}

fn spawn_handler(
    id: u32, channel: String, payload: Vec<u8>, handler: Arc<dyn MessageHandler>,
    cmd_tx: mpsc::Sender<Command>,
) {
    tokio::spawn(async move {
        let task = tokio::spawn(async move { handler.on_message(payload).await });

        let reply = match task.await {
            Ok(payload) => Command::Reply { id, kind: FrameKind::Reply, payload },
            Err(e) => {
                error!("Handler on channel {} failed: {:?}", channel, e);
                Command::Reply { id, kind: FrameKind::Aborted, payload: vec![] }
            }
        };

        if cmd_tx.send(reply).await.is_err() {
            debug!("Endpoint stopped before reply {} was sent", id);
        }
    });
}
