pub mod channel;
pub mod client;
pub mod config;
pub mod media;
pub mod message;
pub mod queue;
pub mod room;
pub mod turn;

pub use client::{CallClient, CallError, CallEvent, CallState};
pub use message::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
pub use turn::IceServer;
