use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{IceCandidate, SessionDescription};
use crate::turn::IceServer;

pub mod mock;

/// Events emitted by the media engine back into the orchestrator.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally gathered connectivity candidate that must be signaled to
    /// the remote participant.
    LocalCandidate(IceCandidate),
}

#[derive(Debug, Error)]
#[error("media engine error: {0}")]
pub struct MediaError(pub String);

/// Factory boundary to the media engine. The engine is an opaque external
/// capability: it negotiates and transports media, we only shuttle its
/// descriptions and candidates.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a media session configured with the accumulated ICE server
    /// set. Engine-originated events flow through `events` and re-enter the
    /// orchestrator's serialized context.
    async fn create_session(
        &self,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}

/// One negotiation session. All operations complete asynchronously.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Releases the session. Best-effort; errors are not reported.
    async fn close(&self);
}
