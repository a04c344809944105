use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::message::SignalingMessage;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Signaling channel state machine. `Error` is terminal: there is no
/// reconnection, the owner is expected to tear the whole session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Open,
    Registered,
    Error,
}

/// Notifications delivered to the channel's single owner.
#[derive(Debug)]
pub enum ChannelEvent {
    State(ChannelState),
    Message(SignalingMessage),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("room and client identifiers must be non-empty")]
    InvalidIdentifiers,
    #[error("no room registration for fallback delivery")]
    NotRegistered,
    #[error("invalid fallback url: {0}")]
    InvalidFallbackUrl(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Persistent duplex connection to the low-latency signaling relay
/// ("collider"), with REST fallback delivery while the live connection is
/// not yet registered.
///
/// The spawned connection tasks hold only weak references back to the
/// channel, so dropping the handle drains any queued outbound frames and
/// then closes the websocket.
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    post_url: Url,
    state: Mutex<ChannelState>,
    ids: Mutex<Option<RoomIds>>,
    outbound: mpsc::UnboundedSender<WsCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    http: reqwest::Client,
}

#[derive(Clone)]
struct RoomIds {
    room_id: String,
    client_id: String,
}

enum WsCommand {
    Frame(String),
    Close,
}

/// Inbound transport envelope, distinct from the signaling message envelope.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

impl SignalingChannel {
    /// Starts connecting to the collider. Returns immediately; the `Open`
    /// transition (or `Error` on connect failure) is reported through
    /// `events` once the handshake resolves. Frames queued before the
    /// connection opens are flushed in order afterwards.
    pub fn new(
        ws_url: Url,
        post_url: Url,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            post_url,
            state: Mutex::new(ChannelState::Closed),
            ids: Mutex::new(None),
            outbound,
            events,
            http,
        });

        tokio::spawn(run_connection(Arc::downgrade(&inner), ws_url, outbound_rx));

        Ok(Self { inner })
    }

    pub fn state(&self) -> ChannelState {
        self.inner.current_state()
    }

    /// Registers with the collider for the given room and client once the
    /// connection is open. Idempotent: a second call while `Registered` is a
    /// no-op.
    pub fn register(&self, room_id: &str, client_id: &str) -> Result<(), ChannelError> {
        if room_id.is_empty() || client_id.is_empty() {
            return Err(ChannelError::InvalidIdentifiers);
        }
        {
            let mut ids = self.inner.ids.lock().expect("channel lock poisoned");
            *ids = Some(RoomIds {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
            });
        }
        self.inner.register_with_collider();
        Ok(())
    }

    /// Sends one signaling message: over the live connection when
    /// `Registered`, otherwise through the REST fallback so nothing is
    /// dropped while registration races readiness.
    pub fn send(&self, message: &SignalingMessage) -> Result<(), ChannelError> {
        let payload = message.encode();
        if self.inner.current_state() == ChannelState::Registered {
            let frame = json!({ "cmd": "send", "msg": payload }).to_string();
            tracing::debug!(target: "roomcall::channel", kind = message.kind(), "sending live frame");
            let _ = self.inner.outbound.send(WsCommand::Frame(frame));
            return Ok(());
        }

        let url = self.inner.fallback_url()?;
        tracing::debug!(target: "roomcall::channel", kind = message.kind(), %url, "sending via rest fallback");
        let http = self.inner.http.clone();
        tokio::spawn(async move {
            match http.post(url).body(payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(
                        target: "roomcall::channel",
                        status = %response.status(),
                        "rest fallback delivery rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(target: "roomcall::channel", error = %err, "rest fallback delivery failed");
                }
            }
        });
        Ok(())
    }

    /// Closes the live connection and releases the server-side registration
    /// with a best-effort DELETE. No-op once `Closed` or `Error`.
    pub fn disconnect(&self) {
        let state = self.inner.current_state();
        if state == ChannelState::Closed || state == ChannelState::Error {
            return;
        }
        let _ = self.inner.outbound.send(WsCommand::Close);

        if let Ok(url) = self.inner.fallback_url() {
            tracing::debug!(target: "roomcall::channel", %url, "releasing collider registration");
            let http = self.inner.http.clone();
            tokio::spawn(async move {
                if let Err(err) = http.delete(url).send().await {
                    tracing::debug!(target: "roomcall::channel", error = %err, "collider delete failed");
                }
            });
        }
        self.inner.set_state(ChannelState::Closed);
    }
}

impl ChannelInner {
    fn current_state(&self) -> ChannelState {
        *self.state.lock().expect("channel lock poisoned")
    }

    fn set_state(&self, next: ChannelState) {
        {
            let mut state = self.state.lock().expect("channel lock poisoned");
            if *state == next {
                return;
            }
            // Terminal states do not regress into one another: a reader
            // failing after a local disconnect must not resurrect the
            // channel as `Error`.
            if matches!(
                (*state, next),
                (ChannelState::Closed, ChannelState::Error)
                    | (ChannelState::Error, ChannelState::Closed)
            ) {
                return;
            }
            *state = next;
        }
        tracing::debug!(target: "roomcall::channel", state = ?next, "channel state changed");
        let _ = self.events.send(ChannelEvent::State(next));
    }

    /// Sends the register frame once the connection is open. Called both
    /// from `register` and from the connector when the handshake completes,
    /// whichever happens last.
    fn register_with_collider(&self) {
        if self.current_state() != ChannelState::Open {
            return;
        }
        let Some(ids) = self.ids.lock().expect("channel lock poisoned").clone() else {
            return;
        };
        let frame = json!({
            "cmd": "register",
            "roomid": ids.room_id,
            "clientid": ids.client_id,
        })
        .to_string();
        tracing::debug!(
            target: "roomcall::channel",
            room_id = %ids.room_id,
            client_id = %ids.client_id,
            "registering with collider"
        );
        // Registration can still be rejected server-side; a rejection comes
        // back as an error frame.
        let _ = self.outbound.send(WsCommand::Frame(frame));
        self.set_state(ChannelState::Registered);
    }

    fn fallback_url(&self) -> Result<Url, ChannelError> {
        let ids = self
            .ids
            .lock()
            .expect("channel lock poisoned")
            .clone()
            .ok_or(ChannelError::NotRegistered)?;
        let raw = format!("{}{}{}", self.post_url, ids.room_id, ids.client_id);
        Url::parse(&raw).map_err(|err| ChannelError::InvalidFallbackUrl(format!("{raw}: {err}")))
    }

    fn handle_frame(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target: "roomcall::channel", error = %err, "undecodable collider frame");
                return;
            }
        };
        if let Some(error) = frame.error {
            tracing::warn!(target: "roomcall::channel", error = %error, "collider reported an error");
            return;
        }
        let Some(payload) = frame.msg else {
            tracing::warn!(target: "roomcall::channel", "collider frame missing payload");
            return;
        };
        match SignalingMessage::decode(&payload) {
            Ok(message) => {
                tracing::debug!(target: "roomcall::channel", kind = message.kind(), "received live message");
                let _ = self.events.send(ChannelEvent::Message(message));
            }
            Err(err) => {
                tracing::warn!(target: "roomcall::channel", error = %err, "undecodable signaling payload");
            }
        }
    }
}

async fn run_connection(
    inner: Weak<ChannelInner>,
    ws_url: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<WsCommand>,
) {
    let ws_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(ws_url.as_str()))
        .await
    {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(err)) => {
            tracing::warn!(target: "roomcall::channel", error = %err, "collider connect failed");
            if let Some(inner) = inner.upgrade() {
                inner.set_state(ChannelState::Error);
            }
            return;
        }
        Err(_) => {
            tracing::warn!(target: "roomcall::channel", url = %ws_url, "collider handshake timed out");
            if let Some(inner) = inner.upgrade() {
                inner.set_state(ChannelState::Error);
            }
            return;
        }
    };
    tracing::debug!(target: "roomcall::channel", url = %ws_url, "collider connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let writer_inner = inner.clone();
    tokio::spawn(async move {
        while let Some(command) = outbound_rx.recv().await {
            match command {
                WsCommand::Frame(text) => {
                    if let Err(err) = ws_write.send(Message::Text(text)).await {
                        tracing::warn!(target: "roomcall::channel", error = %err, "collider write failed");
                        if let Some(inner) = writer_inner.upgrade() {
                            inner.set_state(ChannelState::Error);
                        }
                        return;
                    }
                }
                WsCommand::Close => break,
            }
        }
        // Close requested, or every handle dropped after draining the queue.
        let _ = ws_write.send(Message::Close(None)).await;
    });

    let reader_inner = inner.clone();
    tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            let Some(inner) = reader_inner.upgrade() else {
                return;
            };
            match frame {
                Ok(Message::Text(text)) => inner.handle_frame(&text),
                Ok(Message::Binary(data)) => {
                    if let Ok(text) = String::from_utf8(data) {
                        inner.handle_frame(&text);
                    }
                }
                Ok(Message::Close(_)) => {
                    inner.set_state(ChannelState::Closed);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target: "roomcall::channel", error = %err, "collider read failed");
                    inner.set_state(ChannelState::Error);
                    break;
                }
            }
        }
        // Stream exhausted without a close frame: the transport is gone.
        if let Some(inner) = reader_inner.upgrade() {
            inner.set_state(ChannelState::Closed);
        }
    });

    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.set_state(ChannelState::Open);
    // Registration may have been requested while we were still connecting.
    inner.register_with_collider();
}

#[cfg(test)]
mod tests;
