//! Scriptable media engine used by the orchestrator tests and the smoke
//! binary. Records every call and serves canned session descriptions.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::message::{IceCandidate, SessionDescription};
use crate::turn::IceServer;

use super::{MediaEngine, MediaError, MediaEvent, MediaSession};

#[derive(Debug, Clone, PartialEq)]
pub enum MediaCall {
    CreateSession { ice_servers: Vec<IceServer> },
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<MediaCall>>,
    events: Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
    fail_create_sdp: Mutex<bool>,
    fail_apply_sdp: Mutex<bool>,
}

/// Engine and session share one state block so tests can observe the whole
/// call history through the engine handle.
#[derive(Clone, Default)]
pub struct MockMediaEngine {
    state: Arc<MockState>,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.state.calls.lock().expect("mock lock poisoned").clone()
    }

    /// Makes create_offer / create_answer fail until cleared.
    pub fn fail_sdp_creation(&self, fail: bool) {
        *self.state.fail_create_sdp.lock().expect("mock lock poisoned") = fail;
    }

    /// Makes set_local/remote_description fail until cleared.
    pub fn fail_sdp_apply(&self, fail: bool) {
        *self.state.fail_apply_sdp.lock().expect("mock lock poisoned") = fail;
    }

    /// Emits a locally gathered candidate, as a real engine would after the
    /// session starts negotiating.
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let guard = self.state.events.lock().expect("mock lock poisoned");
        if let Some(events) = guard.as_ref() {
            let _ = events.send(MediaEvent::LocalCandidate(candidate));
        }
    }

    fn record(&self, call: MediaCall) {
        self.state.calls.lock().expect("mock lock poisoned").push(call);
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_session(
        &self,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        self.record(MediaCall::CreateSession { ice_servers });
        *self.state.events.lock().expect("mock lock poisoned") = Some(events);
        Ok(Arc::new(MockMediaSession {
            engine: self.clone(),
        }))
    }
}

pub struct MockMediaSession {
    engine: MockMediaEngine,
}

impl MockMediaSession {
    fn create_description(&self, call: MediaCall, desc: SessionDescription) -> Result<SessionDescription, MediaError> {
        self.engine.record(call);
        if *self.engine.state.fail_create_sdp.lock().expect("mock lock poisoned") {
            return Err(MediaError("scripted sdp creation failure".into()));
        }
        Ok(desc)
    }

    fn apply_description(&self, call: MediaCall) -> Result<(), MediaError> {
        self.engine.record(call);
        if *self.engine.state.fail_apply_sdp.lock().expect("mock lock poisoned") {
            return Err(MediaError("scripted sdp apply failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.create_description(MediaCall::CreateOffer, SessionDescription::offer("v=0 mock offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.create_description(
            MediaCall::CreateAnswer,
            SessionDescription::answer("v=0 mock answer"),
        )
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.apply_description(MediaCall::SetLocal(desc))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.apply_description(MediaCall::SetRemote(desc))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.engine.record(MediaCall::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) {
        self.engine.record(MediaCall::Close);
    }
}
