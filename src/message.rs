use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A session description produced or consumed by the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// A connectivity candidate relayed between the two participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u32,
    pub sdp: String,
}

/// The four signaling message variants exchanged through the room server and
/// the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Bye,
}

impl SignalingMessage {
    pub fn description(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpType::Offer => SignalingMessage::Offer(desc),
            SdpType::Answer => SignalingMessage::Answer(desc),
        }
    }

    pub fn is_session_description(&self) -> bool {
        matches!(self, SignalingMessage::Offer(_) | SignalingMessage::Answer(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::Bye => "bye",
        }
    }

    /// Serializes to the textual JSON envelope used on every transport.
    pub fn encode(&self) -> String {
        let wire = match self {
            SignalingMessage::Offer(desc) => WireMessage::Offer {
                sdp: desc.sdp.clone(),
            },
            SignalingMessage::Answer(desc) => WireMessage::Answer {
                sdp: desc.sdp.clone(),
            },
            SignalingMessage::Candidate(candidate) => WireMessage::Candidate {
                label: candidate.sdp_mline_index,
                id: candidate.sdp_mid.clone(),
                candidate: candidate.sdp.clone(),
            },
            SignalingMessage::Bye => WireMessage::Bye,
        };
        // A tagged enum of plain strings and integers cannot fail to serialize.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let wire: WireMessage = serde_json::from_str(raw)?;
        Ok(match wire {
            WireMessage::Offer { sdp } => SignalingMessage::Offer(SessionDescription::offer(sdp)),
            WireMessage::Answer { sdp } => {
                SignalingMessage::Answer(SessionDescription::answer(sdp))
            }
            WireMessage::Candidate {
                label,
                id,
                candidate,
            } => SignalingMessage::Candidate(IceCandidate {
                sdp_mid: id,
                sdp_mline_index: label,
                sdp: candidate,
            }),
            WireMessage::Bye => SignalingMessage::Bye,
        })
    }
}

#[derive(Debug, Error)]
#[error("malformed signaling message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// On-the-wire representation. The discriminator and the candidate field
/// names (`label`, `id`, `candidate`) are fixed by the room-server protocol.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { label: u32, id: String, candidate: String },
    Bye,
}
