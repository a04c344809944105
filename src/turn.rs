use serde::Deserialize;
use url::Url;

/// A relay or reflexive server descriptor handed to the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: String,
    pub username: String,
    pub credential: String,
}

/// Bootstrap STUN entry present before any TURN credentials arrive.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

pub fn default_stun_server() -> IceServer {
    IceServer {
        urls: DEFAULT_STUN_URL.to_string(),
        username: String::new(),
        credential: String::new(),
    }
}

/// Requests temporary TURN credentials from the provisioning endpoint.
///
/// Relay credentials are an optimization, not a requirement: any transport or
/// decode failure is logged and yields an empty list so the caller can still
/// treat relay discovery as complete.
pub async fn fetch_ice_servers(
    http: &reqwest::Client,
    turn_url: &Url,
    origin: &Url,
) -> Vec<IceServer> {
    // The provisioning service whitelists requests by origin.
    let request = http
        .get(turn_url.clone())
        .header("user-agent", "Mozilla/5.0")
        .header("origin", origin.as_str());

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(target: "roomcall::turn", error = %err, "turn request failed");
            return Vec::new();
        }
    };
    if !response.status().is_success() {
        tracing::warn!(
            target: "roomcall::turn",
            status = %response.status(),
            "turn endpoint returned non-success status"
        );
        return Vec::new();
    }
    match response.json::<TurnResponse>().await {
        Ok(payload) => {
            let servers = servers_from_response(payload);
            tracing::debug!(target: "roomcall::turn", count = servers.len(), "turn servers resolved");
            servers
        }
        Err(err) => {
            tracing::warn!(target: "roomcall::turn", error = %err, "turn response decode failed");
            Vec::new()
        }
    }
}

/// Provisioning response shape: one credential pair shared by every URI.
/// Distinct from the per-server descriptor format used elsewhere.
#[derive(Debug, Deserialize)]
struct TurnResponse {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    uris: Vec<String>,
}

fn servers_from_response(response: TurnResponse) -> Vec<IceServer> {
    response
        .uris
        .into_iter()
        .map(|uri| IceServer {
            urls: uri,
            username: response.username.clone(),
            credential: response.password.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uris_share_one_credential_pair() {
        let response: TurnResponse = serde_json::from_value(serde_json::json!({
            "username": "user-1",
            "password": "secret",
            "uris": ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:443"],
        }))
        .unwrap();

        let servers = servers_from_response(response);
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|s| s.username == "user-1"));
        assert!(servers.iter().all(|s| s.credential == "secret"));
        assert_eq!(servers[0].urls, "turn:turn.example.com:3478?transport=udp");
    }

    #[test]
    fn missing_fields_decode_to_empty() {
        let response: TurnResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(servers_from_response(response).is_empty());
    }

    #[test]
    fn bootstrap_entry_has_no_credentials() {
        let stun = default_stun_server();
        assert_eq!(stun.urls, DEFAULT_STUN_URL);
        assert!(stun.username.is_empty());
        assert!(stun.credential.is_empty());
    }

    #[tokio::test]
    async fn transport_error_yields_empty_list() {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        // Reserved TEST-NET-1 address; nothing listens there.
        let turn_url = Url::parse("http://192.0.2.1:9/turn").unwrap();
        let origin = Url::parse("https://rooms.example.com").unwrap();
        assert!(fetch_ice_servers(&http, &turn_url, &origin).await.is_empty());
    }
}
