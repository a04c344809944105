use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::message::SignalingMessage;

/// Client for the room (rendezvous) server: registration, message relay and
/// unregistration over plain request/response HTTP.
#[derive(Clone)]
pub struct RoomClient {
    base_url: Arc<Url>,
    backend: Arc<dyn RoomBackend>,
}

impl RoomClient {
    pub fn new(base_url: Url) -> Result<Self, RoomError> {
        let backend = Arc::new(ReqwestRoomBackend::new()?);
        Ok(Self {
            base_url: Arc::new(base_url),
            backend,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backend(base_url: Url, backend: Arc<dyn RoomBackend>) -> Self {
        Self {
            base_url: Arc::new(base_url),
            backend,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Registers this participant with the given room. A single attempt; any
    /// failure is surfaced to the caller, who decides whether the session
    /// aborts.
    pub async fn register(&self, room_id: &str) -> Result<Registration, RoomError> {
        let response = self.backend.join(&self.base_url, room_id).await?;
        let registration = Registration::from_response(response)?;
        tracing::debug!(
            target: "roomcall::room",
            room_id = %registration.room_id,
            client_id = %registration.client_id,
            is_initiator = registration.is_initiator,
            backlog = registration.messages.len(),
            "registered with room server"
        );
        Ok(registration)
    }

    /// Relays one signaling message through the room server. Non-success
    /// results are reported but never force a disconnect by themselves.
    pub async fn send(
        &self,
        room_id: &str,
        client_id: &str,
        message: &SignalingMessage,
    ) -> Result<MessageResult, RoomError> {
        tracing::debug!(target: "roomcall::room", kind = message.kind(), "relaying message via room server");
        let response = self
            .backend
            .message(&self.base_url, room_id, client_id, message.encode())
            .await?;
        Ok(MessageResult::from_wire(&response.result))
    }

    /// Best-effort unregistration; the caller only logs the outcome.
    pub async fn leave(&self, room_id: &str, client_id: &str) -> Result<(), RoomError> {
        self.backend.leave(&self.base_url, room_id, client_id).await
    }
}

/// A successful room registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub room_id: String,
    pub client_id: String,
    pub is_initiator: bool,
    /// Server-side backlog, decoded. Entries that failed to decode have
    /// already been dropped.
    pub messages: Vec<SignalingMessage>,
    pub ws_url: Url,
    pub post_url: Url,
}

impl Registration {
    fn from_response(response: JoinResponse) -> Result<Self, RoomError> {
        match response.result.as_str() {
            "SUCCESS" => {}
            "FULL" => return Err(RoomError::Full),
            other => {
                tracing::warn!(target: "roomcall::room", result = other, "unexpected register result");
                return Err(RoomError::Unknown);
            }
        }
        let params = response
            .params
            .ok_or_else(|| RoomError::InvalidResponse("missing params".into()))?;

        let mut messages = Vec::with_capacity(params.messages.len());
        for raw in &params.messages {
            match SignalingMessage::decode(raw) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::warn!(target: "roomcall::room", error = %err, "dropping undecodable backlog entry");
                }
            }
        }
        // A backlog that decodes to nothing at all means the server handed us
        // garbage; partial decode success is accepted silently.
        if !params.messages.is_empty() && messages.is_empty() {
            return Err(RoomError::Unknown);
        }

        let ws_url = parse_url(&params.wss_url, "wss_url")?;
        let post_url = parse_url(&params.wss_post_url, "wss_post_url")?;

        Ok(Registration {
            room_id: params.room_id,
            client_id: params.client_id,
            // The server sends the flag as a string; only the literal
            // "false" means false.
            is_initiator: params.is_initiator != "false",
            messages,
            ws_url,
            post_url,
        })
    }
}

/// Outcome of relaying a message through the room server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResult {
    Success,
    InvalidClient,
    InvalidRoom,
    Unknown,
}

impl MessageResult {
    fn from_wire(result: &str) -> Self {
        match result {
            "SUCCESS" => MessageResult::Success,
            "INVALID_CLIENT" => MessageResult::InvalidClient,
            "INVALID_ROOM" => MessageResult::InvalidRoom,
            _ => MessageResult::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room is full")]
    Full,
    #[error("room server returned an unknown result")]
    Unknown,
    #[error("room server network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid room server response: {0}")]
    InvalidResponse(String),
    #[error("invalid room client configuration: {0}")]
    InvalidConfig(String),
}

#[async_trait]
pub(crate) trait RoomBackend: Send + Sync {
    async fn join(&self, base_url: &Url, room_id: &str) -> Result<JoinResponse, RoomError>;

    async fn message(
        &self,
        base_url: &Url,
        room_id: &str,
        client_id: &str,
        body: String,
    ) -> Result<MessageResponse, RoomError>;

    async fn leave(&self, base_url: &Url, room_id: &str, client_id: &str)
    -> Result<(), RoomError>;
}

struct ReqwestRoomBackend {
    client: reqwest::Client,
}

impl ReqwestRoomBackend {
    fn new() -> Result<Self, RoomError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RoomBackend for ReqwestRoomBackend {
    async fn join(&self, base_url: &Url, room_id: &str) -> Result<JoinResponse, RoomError> {
        let endpoint = join_endpoint(base_url, &format!("join/{room_id}"))?;
        let response = self.client.post(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(RoomError::HttpStatus(response.status()));
        }
        Ok(response.json::<JoinResponse>().await?)
    }

    async fn message(
        &self,
        base_url: &Url,
        room_id: &str,
        client_id: &str,
        body: String,
    ) -> Result<MessageResponse, RoomError> {
        let endpoint = join_endpoint(base_url, &format!("message/{room_id}/{client_id}"))?;
        let response = self.client.post(endpoint).body(body).send().await?;
        if !response.status().is_success() {
            return Err(RoomError::HttpStatus(response.status()));
        }
        Ok(response.json::<MessageResponse>().await?)
    }

    async fn leave(
        &self,
        base_url: &Url,
        room_id: &str,
        client_id: &str,
    ) -> Result<(), RoomError> {
        let endpoint = join_endpoint(base_url, &format!("leave/{room_id}/{client_id}"))?;
        let response = self.client.post(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(RoomError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

fn join_endpoint(base_url: &Url, path: &str) -> Result<Url, RoomError> {
    base_url
        .join(path)
        .map_err(|err| RoomError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
}

#[derive(Debug, Deserialize)]
pub(crate) struct JoinResponse {
    pub(crate) result: String,
    #[serde(default)]
    pub(crate) params: Option<JoinParams>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JoinParams {
    pub(crate) is_initiator: String,
    pub(crate) room_id: String,
    pub(crate) client_id: String,
    #[serde(default)]
    pub(crate) messages: Vec<String>,
    pub(crate) wss_url: String,
    pub(crate) wss_post_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageResponse {
    pub(crate) result: String,
}

fn parse_url(raw: &str, field: &str) -> Result<Url, RoomError> {
    Url::parse(raw)
        .map_err(|err| RoomError::InvalidResponse(format!("{field} contains invalid url '{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn join_response(value: serde_json::Value) -> JoinResponse {
        serde_json::from_value(value).unwrap()
    }

    fn success_params(messages: Vec<&str>) -> serde_json::Value {
        json!({
            "result": "SUCCESS",
            "params": {
                "is_initiator": "true",
                "room_id": "r1",
                "client_id": "c1",
                "messages": messages,
                "wss_url": "wss://collider.example.com/ws",
                "wss_post_url": "https://collider.example.com/",
            }
        })
    }

    #[test]
    fn parses_successful_registration() {
        let registration =
            Registration::from_response(join_response(success_params(vec![]))).unwrap();
        assert_eq!(registration.room_id, "r1");
        assert_eq!(registration.client_id, "c1");
        assert!(registration.is_initiator);
        assert!(registration.messages.is_empty());
        assert_eq!(registration.ws_url.as_str(), "wss://collider.example.com/ws");
    }

    #[test]
    fn full_room_maps_to_full_error() {
        let err = Registration::from_response(join_response(json!({ "result": "FULL" })))
            .unwrap_err();
        assert!(matches!(err, RoomError::Full));
    }

    #[test]
    fn unexpected_result_maps_to_unknown() {
        let err = Registration::from_response(join_response(json!({ "result": "TEAPOT" })))
            .unwrap_err();
        assert!(matches!(err, RoomError::Unknown));
    }

    #[test]
    fn only_literal_false_clears_initiator_flag() {
        let mut value = success_params(vec![]);
        value["params"]["is_initiator"] = json!("false");
        assert!(!Registration::from_response(join_response(value)).unwrap().is_initiator);

        let mut value = success_params(vec![]);
        value["params"]["is_initiator"] = json!("yes");
        assert!(Registration::from_response(join_response(value)).unwrap().is_initiator);
    }

    #[test]
    fn backlog_decodes_offer_and_candidate() {
        let response = join_response(success_params(vec![
            r#"{"type":"offer","sdp":"v=0"}"#,
            r#"{"type":"candidate","label":0,"id":"audio","candidate":"c"}"#,
        ]));
        let registration = Registration::from_response(response).unwrap();
        assert_eq!(registration.messages.len(), 2);
        assert!(registration.messages[0].is_session_description());
    }

    #[test]
    fn partially_bad_backlog_is_accepted() {
        let response = join_response(success_params(vec![
            "garbage",
            r#"{"type":"bye"}"#,
        ]));
        let registration = Registration::from_response(response).unwrap();
        assert_eq!(registration.messages, vec![SignalingMessage::Bye]);
    }

    #[test]
    fn fully_undecodable_backlog_degrades_to_unknown() {
        let response = join_response(success_params(vec!["garbage", "{}"]));
        assert!(matches!(
            Registration::from_response(response).unwrap_err(),
            RoomError::Unknown
        ));
    }

    #[test]
    fn message_results_map_from_wire_strings() {
        assert_eq!(MessageResult::from_wire("SUCCESS"), MessageResult::Success);
        assert_eq!(
            MessageResult::from_wire("INVALID_CLIENT"),
            MessageResult::InvalidClient
        );
        assert_eq!(
            MessageResult::from_wire("INVALID_ROOM"),
            MessageResult::InvalidRoom
        );
        assert_eq!(MessageResult::from_wire("WHATEVER"), MessageResult::Unknown);
    }
}
