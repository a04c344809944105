//! Call orchestration. A [`CallClient`] handle feeds commands into a single
//! actor task that owns all per-call state; registration, relay discovery,
//! channel traffic and media engine callbacks re-enter the actor as inputs,
//! so every decision is made in one serialized context.
//!
//! Completions from spawned sub-tasks are tagged with the epoch of the call
//! they belong to. Disconnecting bumps the epoch, which retires anything
//! still in flight from the previous call.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::channel::{ChannelEvent, ChannelState, SignalingChannel};
use crate::config::Config;
use crate::media::{MediaEngine, MediaError, MediaEvent, MediaSession};
use crate::message::{SdpType, SessionDescription, SignalingMessage};
use crate::queue::MessageQueue;
use crate::room::{MessageResult, Registration, RoomClient, RoomError};
use crate::turn::{IceServer, default_stun_server, fetch_ice_servers};

const TARGET: &str = "roomcall::client";

/// Lifecycle of a call as observed from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("already connected to a room")]
    AlreadyConnected,
    #[error("room is full")]
    RoomFull,
    #[error("room registration failed: {0}")]
    Registration(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("room server rejected the client")]
    InvalidClient,
    #[error("room server rejected the room")]
    InvalidRoom,
    #[error("room server rejected a relayed message")]
    MessageRejected,
    #[error("signaling channel failed")]
    Channel,
    #[error("media engine failure: {0}")]
    Media(String),
    #[error("failed to create session description: {0}")]
    SdpCreation(String),
    #[error("failed to apply session description: {0}")]
    SdpApply(String),
}

/// Notifications delivered to the application. A failed call always reports
/// the `Disconnected` state change before the error that caused it.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    Error(CallError),
}

/// Handle to a call actor. Single owner; dropping the handle shuts the
/// actor down after it tears down any active call.
pub struct CallClient {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<CallState>,
}

impl CallClient {
    /// Creates a client and its event stream. Must be called from within a
    /// tokio runtime.
    pub fn new(
        config: &Config,
        media: Arc<dyn MediaEngine>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        let room = RoomClient::new(config.room_server_url.clone())
            .map_err(|err| CallError::Network(err.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()
            .map_err(|err| CallError::Network(err.to_string()))?;
        Ok(Self::spawn(room, config.turn_url.clone(), http, media))
    }

    #[cfg(test)]
    pub(crate) fn with_room_client(
        room: RoomClient,
        turn_url: Option<Url>,
        media: Arc<dyn MediaEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        Self::spawn(room, turn_url, reqwest::Client::new(), media)
    }

    fn spawn(
        room: RoomClient,
        turn_url: Option<Url>,
        http: reqwest::Client,
        media: Arc<dyn MediaEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Disconnected);

        let actor = CallActor {
            room,
            turn_url,
            http,
            media,
            inputs_tx: inputs_tx.clone(),
            events: events_tx,
            state: state_tx,
            epoch: 0,
            registration: None,
            ice_servers: vec![default_stun_server()],
            turn_complete: false,
            channel: None,
            session: None,
            session_starting: false,
            queue: MessageQueue::new(),
            local_description_set: false,
            answer_pending: false,
        };
        tokio::spawn(actor.run(inputs_rx));

        (
            Self {
                inputs: inputs_tx,
                state: state_rx,
            },
            events_rx,
        )
    }

    /// Joins a room and starts call setup. Rejected while a call is already
    /// connecting or connected.
    pub fn connect(&self, room_id: &str) -> Result<(), CallError> {
        if room_id.is_empty() {
            return Err(CallError::Registration("room id must not be empty".into()));
        }
        if *self.state.borrow() != CallState::Disconnected {
            return Err(CallError::AlreadyConnected);
        }
        let _ = self.inputs.send(Input::Connect {
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    /// Hangs up and releases every resource of the active call. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.inputs.send(Input::Disconnect);
    }

    /// Sends one signaling message to the remote participant. A `Bye` is
    /// treated as a local hangup.
    pub fn send(&self, message: SignalingMessage) {
        let _ = self.inputs.send(Input::Send { message });
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Watch handle for state transitions, usable independently of the
    /// event stream.
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Shutdown);
    }
}

enum Input {
    Connect {
        room_id: String,
    },
    Disconnect,
    Send {
        message: SignalingMessage,
    },
    Shutdown,
    Registered {
        epoch: u64,
        result: Result<Registration, RoomError>,
    },
    TurnResolved {
        epoch: u64,
        servers: Vec<IceServer>,
    },
    Channel {
        epoch: u64,
        event: ChannelEvent,
    },
    SessionCreated {
        epoch: u64,
        result: Result<Arc<dyn MediaSession>, MediaError>,
    },
    SdpCreated {
        epoch: u64,
        result: Result<SessionDescription, MediaError>,
    },
    SdpApplied {
        epoch: u64,
        local: bool,
        result: Result<(), MediaError>,
    },
    Media {
        epoch: u64,
        event: MediaEvent,
    },
    MessageSent {
        epoch: u64,
        result: Result<MessageResult, RoomError>,
    },
}

struct CallActor {
    room: RoomClient,
    turn_url: Option<Url>,
    http: reqwest::Client,
    media: Arc<dyn MediaEngine>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<CallEvent>,
    state: watch::Sender<CallState>,
    epoch: u64,
    registration: Option<Registration>,
    ice_servers: Vec<IceServer>,
    turn_complete: bool,
    channel: Option<SignalingChannel>,
    session: Option<Arc<dyn MediaSession>>,
    session_starting: bool,
    queue: MessageQueue,
    local_description_set: bool,
    answer_pending: bool,
}

impl CallActor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            if matches!(input, Input::Shutdown) {
                break;
            }
            self.handle(input);
        }
        self.do_disconnect();
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Connect { room_id } => self.handle_connect(room_id),
            Input::Disconnect => self.do_disconnect(),
            Input::Send { message } => self.handle_send(message),
            Input::Shutdown => {}
            Input::Registered { epoch, result } => {
                if self.current(epoch) {
                    self.handle_registered(result);
                }
            }
            Input::TurnResolved { epoch, servers } => {
                if self.current(epoch) {
                    self.handle_turn_resolved(servers);
                }
            }
            Input::Channel { epoch, event } => {
                if self.current(epoch) {
                    self.handle_channel_event(event);
                }
            }
            Input::SessionCreated { epoch, result } => {
                if self.current(epoch) {
                    self.handle_session_created(result);
                }
            }
            Input::SdpCreated { epoch, result } => {
                if self.current(epoch) {
                    self.handle_sdp_created(result);
                }
            }
            Input::SdpApplied {
                epoch,
                local,
                result,
            } => {
                if self.current(epoch) {
                    self.handle_sdp_applied(local, result);
                }
            }
            Input::Media { epoch, event } => {
                if self.current(epoch) {
                    self.handle_media_event(event);
                }
            }
            Input::MessageSent { epoch, result } => {
                if self.current(epoch) {
                    self.handle_message_sent(result);
                }
            }
        }
    }

    fn current(&self, epoch: u64) -> bool {
        if epoch != self.epoch {
            tracing::trace!(target: TARGET, epoch, current = self.epoch, "dropping stale completion");
            return false;
        }
        true
    }

    fn is_initiator(&self) -> bool {
        self.registration.as_ref().is_some_and(|r| r.is_initiator)
    }

    fn set_state(&self, next: CallState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(target: TARGET, state = ?next, "call state changed");
            let _ = self.events.send(CallEvent::StateChanged(next));
        }
    }

    fn handle_connect(&mut self, room_id: String) {
        if *self.state.borrow() != CallState::Disconnected {
            let _ = self.events.send(CallEvent::Error(CallError::AlreadyConnected));
            return;
        }
        tracing::info!(target: TARGET, room_id = %room_id, "connecting");
        self.set_state(CallState::Connecting);
        let epoch = self.epoch;

        // Relay discovery and room registration run concurrently; the media
        // session starts once both have landed.
        match &self.turn_url {
            Some(turn_url) => {
                let http = self.http.clone();
                let turn_url = turn_url.clone();
                let origin = self.room.base_url().clone();
                let tx = self.inputs_tx.clone();
                tokio::spawn(async move {
                    let servers = fetch_ice_servers(&http, &turn_url, &origin).await;
                    let _ = tx.send(Input::TurnResolved { epoch, servers });
                });
            }
            None => self.turn_complete = true,
        }

        let room = self.room.clone();
        let tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = room.register(&room_id).await;
            let _ = tx.send(Input::Registered { epoch, result });
        });
    }

    fn handle_registered(&mut self, result: Result<Registration, RoomError>) {
        let registration = match result {
            Ok(registration) => registration,
            Err(err) => {
                let error = match err {
                    RoomError::Full => CallError::RoomFull,
                    err @ (RoomError::Network(_) | RoomError::HttpStatus(_)) => {
                        CallError::Network(err.to_string())
                    }
                    other => CallError::Registration(other.to_string()),
                };
                self.fail(error);
                return;
            }
        };
        tracing::info!(
            target: TARGET,
            room_id = %registration.room_id,
            client_id = %registration.client_id,
            is_initiator = registration.is_initiator,
            backlog = registration.messages.len(),
            "room registration complete"
        );

        let (channel_events, mut channel_rx) = mpsc::unbounded_channel();
        let channel = match SignalingChannel::new(
            registration.ws_url.clone(),
            registration.post_url.clone(),
            channel_events,
        ) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "signaling channel setup failed");
                self.fail(CallError::Channel);
                return;
            }
        };
        if let Err(err) = channel.register(&registration.room_id, &registration.client_id) {
            tracing::warn!(target: TARGET, error = %err, "collider registration failed");
            self.fail(CallError::Channel);
            return;
        }
        let epoch = self.epoch;
        let tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if tx.send(Input::Channel { epoch, event }).is_err() {
                    break;
                }
            }
        });
        self.channel = Some(channel);

        let backlog = registration.messages.clone();
        self.registration = Some(registration);
        for message in backlog {
            self.handle_incoming(message);
        }
        self.maybe_start_session();
    }

    fn handle_turn_resolved(&mut self, servers: Vec<IceServer>) {
        tracing::debug!(target: TARGET, count = servers.len(), "relay discovery complete");
        self.ice_servers.extend(servers);
        self.turn_complete = true;
        self.maybe_start_session();
    }

    fn maybe_start_session(&mut self) {
        if !self.turn_complete
            || self.registration.is_none()
            || self.session.is_some()
            || self.session_starting
        {
            return;
        }
        self.session_starting = true;
        let epoch = self.epoch;
        let servers = self.ice_servers.clone();

        let (media_events, mut media_rx) = mpsc::unbounded_channel();
        let event_tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = media_rx.recv().await {
                if event_tx.send(Input::Media { epoch, event }).is_err() {
                    break;
                }
            }
        });

        tracing::debug!(target: TARGET, ice_servers = servers.len(), "starting media session");
        let media = Arc::clone(&self.media);
        let tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = media.create_session(servers, media_events).await;
            let _ = tx.send(Input::SessionCreated { epoch, result });
        });
    }

    fn handle_session_created(&mut self, result: Result<Arc<dyn MediaSession>, MediaError>) {
        self.session_starting = false;
        match result {
            Ok(session) => {
                self.session = Some(session);
                self.set_state(CallState::Connected);
                if self.is_initiator() {
                    self.spawn_create_description(SdpType::Offer);
                }
                self.drain_queue();
            }
            Err(err) => self.fail(CallError::Media(err.to_string())),
        }
    }

    fn spawn_create_description(&self, kind: SdpType) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let epoch = self.epoch;
        let tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = match kind {
                SdpType::Offer => session.create_offer().await,
                SdpType::Answer => session.create_answer().await,
            };
            let _ = tx.send(Input::SdpCreated { epoch, result });
        });
    }

    fn handle_sdp_created(&mut self, result: Result<SessionDescription, MediaError>) {
        match result {
            Ok(desc) => {
                let Some(session) = self.session.clone() else {
                    return;
                };
                let epoch = self.epoch;
                let tx = self.inputs_tx.clone();
                let to_apply = desc.clone();
                tokio::spawn(async move {
                    let result = session.set_local_description(to_apply).await;
                    let _ = tx.send(Input::SdpApplied {
                        epoch,
                        local: true,
                        result,
                    });
                });
                self.send_to_remote(SignalingMessage::description(desc));
            }
            Err(err) => self.fail(CallError::SdpCreation(err.to_string())),
        }
    }

    fn handle_sdp_applied(&mut self, local: bool, result: Result<(), MediaError>) {
        match result {
            Ok(()) => {
                if local {
                    self.local_description_set = true;
                } else if self.answer_pending {
                    self.answer_pending = false;
                    self.spawn_create_description(SdpType::Answer);
                }
            }
            Err(err) => self.fail(CallError::SdpApply(err.to_string())),
        }
    }

    fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                self.send_to_remote(SignalingMessage::Candidate(candidate));
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::State(state) => match state {
                ChannelState::Open | ChannelState::Registered => {
                    tracing::debug!(target: TARGET, state = ?state, "signaling channel ready");
                }
                ChannelState::Closed => {
                    tracing::info!(target: TARGET, "signaling channel closed by remote");
                    self.do_disconnect();
                }
                ChannelState::Error => self.fail(CallError::Channel),
            },
            ChannelEvent::Message(message) => self.handle_incoming(message),
        }
    }

    fn handle_incoming(&mut self, message: SignalingMessage) {
        // Hangups take effect immediately and never enter the queue.
        if matches!(message, SignalingMessage::Bye) {
            tracing::info!(target: TARGET, "remote participant hung up");
            self.do_disconnect();
            return;
        }
        self.queue.push(message);
        self.drain_queue();
    }

    fn drain_queue(&mut self) {
        let Some(batch) = self.queue.drain_ready(self.session.is_some()) else {
            return;
        };
        for message in batch {
            self.process_message(message);
        }
    }

    fn process_message(&mut self, message: SignalingMessage) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let epoch = self.epoch;
        let tx = self.inputs_tx.clone();
        match message {
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                if matches!(desc.kind, SdpType::Offer)
                    && !self.is_initiator()
                    && !self.local_description_set
                {
                    self.answer_pending = true;
                }
                tokio::spawn(async move {
                    let result = session.set_remote_description(desc).await;
                    let _ = tx.send(Input::SdpApplied {
                        epoch,
                        local: false,
                        result,
                    });
                });
            }
            SignalingMessage::Candidate(candidate) => {
                tokio::spawn(async move {
                    if let Err(err) = session.add_remote_candidate(candidate).await {
                        tracing::warn!(target: TARGET, error = %err, "failed to add remote candidate");
                    }
                });
            }
            // Handled before queueing.
            SignalingMessage::Bye => {}
        }
    }

    fn handle_send(&mut self, message: SignalingMessage) {
        if *self.state.borrow() == CallState::Disconnected {
            tracing::warn!(target: TARGET, kind = message.kind(), "dropping outbound message, not in a call");
            return;
        }
        if matches!(message, SignalingMessage::Bye) {
            // A local hangup tears the call down; the bye frame goes out as
            // part of the disconnect sequence.
            self.do_disconnect();
            return;
        }
        self.send_to_remote(message);
    }

    /// The initiator relays through the room server, the joiner through the
    /// signaling channel.
    fn send_to_remote(&self, message: SignalingMessage) {
        let Some(registration) = &self.registration else {
            tracing::warn!(target: TARGET, kind = message.kind(), "dropping outbound message, no registration");
            return;
        };
        if registration.is_initiator {
            let room = self.room.clone();
            let room_id = registration.room_id.clone();
            let client_id = registration.client_id.clone();
            let epoch = self.epoch;
            let tx = self.inputs_tx.clone();
            tokio::spawn(async move {
                let result = room.send(&room_id, &client_id, &message).await;
                let _ = tx.send(Input::MessageSent { epoch, result });
            });
        } else if let Some(channel) = &self.channel {
            if let Err(err) = channel.send(&message) {
                tracing::warn!(target: TARGET, error = %err, "channel send failed");
            }
        }
    }

    /// A failed relay is surfaced as an error only; the call stays up and
    /// the caller decides whether to hang up.
    fn handle_message_sent(&mut self, result: Result<MessageResult, RoomError>) {
        let error = match result {
            Ok(MessageResult::Success) => return,
            Ok(MessageResult::InvalidClient) => CallError::InvalidClient,
            Ok(MessageResult::InvalidRoom) => CallError::InvalidRoom,
            Ok(MessageResult::Unknown) => CallError::MessageRejected,
            Err(err) => CallError::Network(err.to_string()),
        };
        tracing::warn!(target: TARGET, error = %error, "message relay failed");
        let _ = self.events.send(CallEvent::Error(error));
    }

    fn fail(&mut self, error: CallError) {
        tracing::warn!(target: TARGET, error = %error, "call failed");
        self.do_disconnect();
        let _ = self.events.send(CallEvent::Error(error));
    }

    fn do_disconnect(&mut self) {
        if *self.state.borrow() == CallState::Disconnected {
            return;
        }
        tracing::info!(target: TARGET, "disconnecting");
        // Retire completions from the call being torn down.
        self.epoch += 1;

        if let Some(registration) = self.registration.take() {
            let room = self.room.clone();
            tokio::spawn(async move {
                if let Err(err) = room
                    .leave(&registration.room_id, &registration.client_id)
                    .await
                {
                    tracing::debug!(target: TARGET, error = %err, "room leave failed");
                }
            });
        }
        if let Some(channel) = self.channel.take() {
            if channel.state() == ChannelState::Registered {
                if let Err(err) = channel.send(&SignalingMessage::Bye) {
                    tracing::debug!(target: TARGET, error = %err, "bye delivery failed");
                }
            }
            channel.disconnect();
        }
        if let Some(session) = self.session.take() {
            tokio::spawn(async move {
                session.close().await;
            });
        }
        self.session_starting = false;
        self.turn_complete = false;
        self.ice_servers = vec![default_stun_server()];
        self.queue.reset();
        self.local_description_set = false;
        self.answer_pending = false;
        self.set_state(CallState::Disconnected);
    }
}
