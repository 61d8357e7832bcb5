use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError as WsProtocolError},
};
use url::Url;

use super::url::relay_socket_url;
use super::{Identity, TransportConfig, TransportError, TransportEvent};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::supervisor::{ReconnectBudget, ReconnectDecision, ScheduledTask};

const EVENT_CAPACITY: usize = 256;

type RelaySocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One persistent socket to the signaling relay.
///
/// Unexpected closes are retried on a fixed delay until the reconnect budget
/// runs out. [`SignalingTransport::close`] stops everything without retrying.
#[derive(Clone)]
pub struct SignalingTransport {
    shared: Arc<Shared>,
}

struct Shared {
    url: Url,
    identity: Identity,
    config: TransportConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    ready: AtomicBool,
    manual_close: AtomicBool,
    attempts: AtomicU32,
    session_id: RwLock<Option<String>>,
    events: broadcast::Sender<TransportEvent>,
    shutdown: Notify,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    /// Prepares a transport without opening the socket, so callers can
    /// subscribe before the first event is emitted.
    pub fn new(config: TransportConfig, identity: Identity) -> Result<Self, TransportError> {
        let url = relay_socket_url(&config.relay_url, &identity.token)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                url,
                identity,
                config,
                outbound: Mutex::new(None),
                ready: AtomicBool::new(false),
                manual_close: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                session_id: RwLock::new(None),
                events,
                shutdown: Notify::new(),
                driver: Mutex::new(None),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Spawns the connection driver. Calling it again is a no-op.
    pub fn start(&self) {
        if self.shared.manual_close.load(Ordering::SeqCst) {
            return;
        }
        let mut driver = self.shared.driver.lock();
        if driver.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *driver = Some(tokio::spawn(async move {
            run_driver(shared).await;
        }));
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        if self.shared.manual_close.load(Ordering::SeqCst) {
            return true;
        }
        self.shared
            .driver
            .lock()
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Session id stamped on heartbeats.
    pub fn bind_session(&self, session_id: Option<String>) {
        *self.shared.session_id.write() = session_id;
    }

    pub fn same_as(&self, other: &SignalingTransport) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.shared.send(envelope)
    }

    /// Closes on request. No reconnect is attempted and every timer stops.
    pub fn close(&self) {
        if self.shared.manual_close.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.ready.store(false, Ordering::SeqCst);
        self.shared.outbound.lock().take();
        self.shared.shutdown.notify_one();
        tracing::debug!(
            target = "transport",
            participant = %self.shared.identity.participant_id,
            "signaling transport closed locally"
        );
        self.shared.emit(TransportEvent::Closed);
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        let text = envelope.to_text()?;
        if !envelope.is_heartbeat() {
            tracing::debug!(
                target = "transport",
                kind = ?envelope.kind,
                session_id = envelope.session_id.as_deref().unwrap_or("-"),
                len = text.len(),
                "ws_out"
            );
        }
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::NotReady)?;
        sender
            .send(Message::Text(text))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn send_heartbeat(&self) -> bool {
        let envelope = Envelope::new(EnvelopeKind::Heartbeat, &self.identity.participant_id)
            .with_session(self.session_id.read().clone());
        match self.send(&envelope) {
            Ok(()) => true,
            Err(TransportError::NotReady) | Err(TransportError::ChannelClosed) => false,
            Err(_) => true,
        }
    }

    fn dispatch_text(&self, text: &str) {
        match Envelope::from_text(text) {
            Ok(envelope) if envelope.is_heartbeat() => {}
            Ok(envelope) => {
                tracing::trace!(
                    target = "transport",
                    event = "ws_in",
                    kind = ?envelope.kind,
                    len = text.len()
                );
                self.emit(TransportEvent::Message(envelope));
            }
            Err(err) => {
                tracing::warn!(
                    target = "transport",
                    error = %err,
                    "dropping malformed relay frame"
                );
            }
        }
    }
}

async fn run_driver(shared: Arc<Shared>) {
    let mut budget = ReconnectBudget::new(
        shared.config.max_reconnect_attempts,
        shared.config.reconnect_delay,
    );

    loop {
        if shared.manual_close.load(Ordering::SeqCst) {
            break;
        }

        let connected = tokio::select! {
            result = connect_async(shared.url.as_str()) => result,
            _ = shared.shutdown.notified() => break,
        };

        let reason = match connected {
            Ok((socket, _)) => {
                budget.reset();
                shared.attempts.store(0, Ordering::SeqCst);
                tracing::debug!(
                    target = "transport",
                    url = %redacted(&shared.url),
                    "signaling websocket connected"
                );
                run_connection(&shared, socket).await
            }
            Err(err) => format!("connect failed: {err}"),
        };
        shared.ready.store(false, Ordering::SeqCst);
        shared.outbound.lock().take();

        if shared.manual_close.load(Ordering::SeqCst) {
            break;
        }

        tracing::warn!(target = "transport", reason = %reason, "signaling websocket lost");
        shared.emit(TransportEvent::Disconnected { reason });

        match budget.record_closure() {
            ReconnectDecision::Retry { attempt, delay } => {
                shared.attempts.store(attempt, Ordering::SeqCst);
                tracing::info!(
                    target = "transport",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling signaling reconnect"
                );
                shared.emit(TransportEvent::Reconnecting { attempt, delay });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.shutdown.notified() => break,
                }
            }
            ReconnectDecision::Exhausted { attempts } => {
                tracing::warn!(
                    target = "transport",
                    attempts,
                    "signaling reconnect budget exhausted"
                );
                shared.emit(TransportEvent::Failed { attempts });
                break;
            }
        }
    }
}

async fn run_connection(shared: &Arc<Shared>, socket: RelaySocket) -> String {
    let (mut ws_write, mut ws_read) = socket.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
    *shared.outbound.lock() = Some(send_tx);
    shared.ready.store(true, Ordering::SeqCst);
    shared.emit(TransportEvent::Opened);

    let heartbeat_shared = Arc::clone(shared);
    let mut heartbeat = ScheduledTask::every(
        "heartbeat",
        shared.config.heartbeat_interval,
        move || heartbeat_shared.send_heartbeat(),
    );

    let reason = loop {
        tokio::select! {
            outbound = send_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(err) = ws_write.send(message).await {
                        break format!("send failed: {err}");
                    }
                }
                None => break "outbound channel closed".to_string(),
            },
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.dispatch_text(&text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => shared.dispatch_text(&text),
                    Err(_) => tracing::warn!(target = "transport", "dropping non-utf8 relay frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("relay closed: {} {}", u16::from(frame.code), frame.reason),
                        None => "relay closed".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "transport", "signaling websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "transport", "signaling websocket error: {err}");
                        }
                    }
                    break err.to_string();
                }
                None => break "relay stream ended".to_string(),
            },
            _ = shared.shutdown.notified() => {
                // Frames queued before the close request still go out.
                while let Ok(message) = send_rx.try_recv() {
                    let _ = ws_write.send(message).await;
                }
                let _ = ws_write.send(Message::Close(None)).await;
                break "closed locally".to_string();
            }
        }
    };

    heartbeat.cancel();
    reason
}

fn redacted(url: &Url) -> String {
    let mut copy = url.clone();
    copy.set_query(None);
    copy.to_string()
}
