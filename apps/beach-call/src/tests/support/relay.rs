use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{
    Envelope, EnvelopeKind, ErrorPayload, JoinAckPayload, JoinPayload, NegotiationRole,
};

pub const SESSION_ID: &str = "s-1";
const RELAY: &str = "relay";

struct Connection {
    tx: mpsc::UnboundedSender<WsMessage>,
    participant: Option<String>,
}

#[derive(Default)]
struct RelayInner {
    next_id: u64,
    connections: HashMap<u64, Connection>,
    roles: HashMap<String, NegotiationRole>,
    joins: Vec<(String, JoinPayload)>,
    join_frames: Vec<Envelope>,
    forwarded: Vec<Envelope>,
    reject: Option<String>,
}

#[derive(Clone, Default)]
struct RelayState {
    inner: Arc<Mutex<RelayInner>>,
}

/// A two-party relay: assigns roles, announces arrivals and departures, and
/// fans every other frame out to all joined sockets, the author included.
pub struct TestRelay {
    addr: SocketAddr,
    state: RelayState,
    _shutdown: oneshot::Sender<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let state = RelayState::default();
        let router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            addr,
            state,
            _shutdown: shutdown_tx,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answers every later JOIN with an ERROR instead of an ack.
    pub fn reject_joins(&self, message: &str) {
        self.state.inner.lock().reject = Some(message.to_string());
    }

    pub fn joins(&self) -> Vec<(String, JoinPayload)> {
        self.state.inner.lock().joins.clone()
    }

    /// Every JOIN as it arrived, envelope fields included.
    pub fn join_frames(&self) -> Vec<Envelope> {
        self.state.inner.lock().join_frames.clone()
    }

    /// Closes every socket joined as `participant`, as a relay restart or a
    /// network drop would.
    pub fn drop_participant(&self, participant: &str) {
        let inner = self.state.inner.lock();
        for connection in inner.connections.values() {
            if connection.participant.as_deref() == Some(participant) {
                let _ = connection.tx.send(WsMessage::Close(None));
            }
        }
    }

    /// Frames of `kind` the relay received from `from`.
    pub fn received(&self, kind: EnvelopeKind, from: &str) -> Vec<Envelope> {
        self.state
            .inner
            .lock()
            .forwarded
            .iter()
            .filter(|envelope| envelope.kind == kind && envelope.from == from)
            .cloned()
            .collect()
    }

    pub async fn wait_for(&self, kind: EnvelopeKind, from: &str, count: usize) {
        while self.received(kind, from).len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Delivers `envelope` to every socket joined as `participant`.
    pub fn send_to(&self, participant: &str, envelope: &Envelope) {
        let inner = self.state.inner.lock();
        for connection in inner.connections.values() {
            if connection.participant.as_deref() == Some(participant) {
                send_envelope(&connection.tx, envelope);
            }
        }
    }

    /// A frame as the relay would author it on behalf of `from`.
    pub fn envelope(kind: EnvelopeKind, from: &str) -> Envelope {
        Envelope::new(kind, from).with_session(Some(SESSION_ID.to_string()))
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let id = {
        let mut inner = state.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.connections.insert(
            id,
            Connection {
                tx: tx.clone(),
                participant: None,
            },
        );
        id
    };

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = Envelope::from_text(&text) else {
            continue;
        };
        match envelope.kind {
            EnvelopeKind::Heartbeat => {}
            EnvelopeKind::Join => on_join(&state, id, &tx, envelope),
            _ => {
                let mut inner = state.inner.lock();
                for connection in inner.connections.values() {
                    if connection.participant.is_some() {
                        send_envelope(&connection.tx, &envelope);
                    }
                }
                inner.forwarded.push(envelope);
            }
        }
    }

    let mut inner = state.inner.lock();
    if let Some(connection) = inner.connections.remove(&id) {
        if let Some(participant) = connection.participant {
            let left = TestRelay::envelope(EnvelopeKind::PeerLeft, &participant);
            for other in inner.connections.values() {
                if other.participant.as_deref().is_some_and(|p| p != participant) {
                    send_envelope(&other.tx, &left);
                }
            }
        }
    }
    drop(inner);
    send_task.abort();
}

fn on_join(state: &RelayState, id: u64, tx: &mpsc::UnboundedSender<WsMessage>, envelope: Envelope) {
    let mut inner = state.inner.lock();
    let participant = envelope.from.clone();
    let join = envelope.payload_as::<JoinPayload>().unwrap_or_default();
    inner.joins.push((participant.clone(), join));
    inner.join_frames.push(envelope);

    if let Some(message) = inner.reject.clone() {
        let error = Envelope::new(EnvelopeKind::Error, RELAY)
            .with_payload(&ErrorPayload {
                code: Some("rejected".into()),
                message,
            })
            .expect("error payload");
        send_envelope(tx, &error);
        return;
    }

    let role = match inner.roles.get(&participant) {
        Some(role) => *role,
        None => {
            let taken = inner
                .roles
                .values()
                .any(|role| *role == NegotiationRole::Initiator);
            let role = if taken {
                NegotiationRole::Responder
            } else {
                NegotiationRole::Initiator
            };
            inner.roles.insert(participant.clone(), role);
            role
        }
    };
    let peer_present = inner.connections.iter().any(|(other, connection)| {
        *other != id
            && connection
                .participant
                .as_deref()
                .is_some_and(|p| p != participant)
    });
    if let Some(connection) = inner.connections.get_mut(&id) {
        connection.participant = Some(participant.clone());
    }

    let ack = TestRelay::envelope(EnvelopeKind::JoinAck, RELAY)
        .with_payload(&JoinAckPayload { role, peer_present })
        .expect("ack payload");
    send_envelope(tx, &ack);

    let joined = TestRelay::envelope(EnvelopeKind::PeerJoined, &participant);
    for (other, connection) in &inner.connections {
        if *other != id
            && connection
                .participant
                .as_deref()
                .is_some_and(|p| p != participant)
        {
            send_envelope(&connection.tx, &joined);
        }
    }
}

fn send_envelope(tx: &mpsc::UnboundedSender<WsMessage>, envelope: &Envelope) {
    if let Ok(text) = envelope.to_text() {
        let _ = tx.send(WsMessage::Text(text));
    }
}
