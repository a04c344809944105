use std::env;
#[cfg(test)]
use std::sync::Mutex;

use url::Url;

const DEFAULT_ROOM_SERVER: &str = "https://apprtc.appspot.com";
const DEFAULT_TURN_URL: &str =
    "https://computeengineondemand.appspot.com/turn?username=iapprtc&key=4080218913";

/// Call client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the room (rendezvous) server.
    pub room_server_url: Url,
    /// TURN credential provisioning endpoint. `None` disables relay
    /// discovery; the default STUN entry is still used.
    pub turn_url: Option<Url>,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// public reference deployment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let room_server = env::var("ROOMCALL_ROOM_SERVER")
            .unwrap_or_else(|_| DEFAULT_ROOM_SERVER.to_string());
        let room_server_url = Url::parse(&room_server)
            .map_err(|err| ConfigError::new("ROOMCALL_ROOM_SERVER", &room_server, err))?;

        // An explicitly empty ROOMCALL_TURN_URL disables relay discovery.
        let turn_url = match env::var("ROOMCALL_TURN_URL") {
            Ok(value) if value.is_empty() => None,
            Ok(value) => {
                Some(Url::parse(&value)
                    .map_err(|err| ConfigError::new("ROOMCALL_TURN_URL", &value, err))?)
            }
            Err(_) => Some(default_turn_url()),
        };

        Ok(Self {
            room_server_url,
            turn_url,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room_server_url: default_room_server_url(),
            turn_url: Some(default_turn_url()),
        }
    }
}

fn default_room_server_url() -> Url {
    // The defaults are compile-time constants known to parse.
    match Url::parse(DEFAULT_ROOM_SERVER) {
        Ok(url) => url,
        Err(_) => unreachable!("default room server url is valid"),
    }
}

fn default_turn_url() -> Url {
    match Url::parse(DEFAULT_TURN_URL) {
        Ok(url) => url,
        Err(_) => unreachable!("default turn url is valid"),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {variable} '{value}': {source}")]
pub struct ConfigError {
    variable: &'static str,
    value: String,
    source: url::ParseError,
}

impl ConfigError {
    fn new(variable: &'static str, value: &str, source: url::ParseError) -> Self {
        Self {
            variable,
            value: value.to_string(),
            source,
        }
    }
}
