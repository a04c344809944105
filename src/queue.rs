use std::collections::VecDeque;

use crate::message::SignalingMessage;

/// Buffers inbound signaling messages until the local media session can
/// consume them.
///
/// At most one offer or answer is held, and it always sits at the front of
/// the queue: the media engine must apply the remote description before any
/// buffered candidate makes sense, regardless of the order the transport
/// delivered them in. A later description supersedes a buffered one.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: VecDeque<SignalingMessage>,
    has_received_description: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any offer or answer has been enqueued during this session.
    pub fn has_received_description(&self) -> bool {
        self.has_received_description
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: SignalingMessage) {
        if message.is_session_description() {
            self.has_received_description = true;
            if self
                .messages
                .front()
                .is_some_and(SignalingMessage::is_session_description)
            {
                self.messages[0] = message;
            } else {
                self.messages.push_front(message);
            }
        } else {
            self.messages.push_back(message);
        }
    }

    /// Drains the whole queue, front to back, once both the media session
    /// exists and a session description has been seen. Otherwise leaves the
    /// queue untouched. Readiness is re-checked on every call, so later
    /// enqueue/drain cycles behave the same way.
    pub fn drain_ready(&mut self, session_exists: bool) -> Option<Vec<SignalingMessage>> {
        if !session_exists || !self.has_received_description {
            return None;
        }
        Some(self.messages.drain(..).collect())
    }

    /// Discards all buffered messages and the description flag. Called on
    /// disconnect so a fresh connect starts from empty state.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.has_received_description = false;
    }
}
