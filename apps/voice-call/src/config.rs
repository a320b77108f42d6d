use std::env;
#[cfg(test)]
use std::sync::Mutex;

use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::media::CaptureConstraints;

const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
const DEFAULT_TURN_URLS: &[&str] = &[
    "turn:openrelay.metered.ca:80",
    "turn:openrelay.metered.ca:443",
];
const DEFAULT_TURN_USERNAME: &str = "openrelayproject";
const DEFAULT_TURN_CREDENTIAL: &str = "openrelayproject";
const DEFAULT_ICE_POOL_SIZE: u8 = 10;

/// Voice call configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// STUN/TURN servers handed to every new peer connection
    pub ice_servers: Vec<RTCIceServer>,
    pub ice_candidate_pool_size: u8,
    /// Gather loopback candidates and skip public servers
    pub localhost_only: bool,
    /// Redis relay url; `None` keeps signaling in process
    pub relay_url: Option<String>,
    pub capture: CaptureConstraints,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(urls) = env::var("VOICE_CALL_ICE_SERVERS") {
            let username = env::var("VOICE_CALL_TURN_USERNAME").unwrap_or_default();
            let credential = env::var("VOICE_CALL_TURN_CREDENTIAL").unwrap_or_default();
            config.ice_servers = parse_ice_servers(&urls, &username, &credential);
        }

        if env_truthy("VOICE_CALL_LOCALHOST_ONLY") {
            config.localhost_only = true;
            config.ice_servers.clear();
        }

        if let Ok(url) = env::var("VOICE_CALL_RELAY_URL") {
            let url = url.trim();
            if !url.is_empty() {
                config.relay_url = Some(url.to_string());
            }
        }

        if let Ok(raw) = env::var("VOICE_CALL_ICE_POOL_SIZE") {
            match raw.trim().parse::<u8>() {
                Ok(size) => config.ice_candidate_pool_size = size,
                Err(err) => warn!(
                    target = "voice.call",
                    value = %raw,
                    error = %err,
                    "ignoring invalid VOICE_CALL_ICE_POOL_SIZE"
                ),
            }
        }

        config
    }

    /// Loopback-only configuration used by the demo and tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            localhost_only: true,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut ice_servers: Vec<RTCIceServer> = DEFAULT_STUN_URLS
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.to_string()],
                ..Default::default()
            })
            .collect();
        ice_servers.push(RTCIceServer {
            urls: DEFAULT_TURN_URLS.iter().map(|url| url.to_string()).collect(),
            username: DEFAULT_TURN_USERNAME.to_string(),
            credential: DEFAULT_TURN_CREDENTIAL.to_string(),
            ..Default::default()
        });
        Self {
            ice_servers,
            ice_candidate_pool_size: DEFAULT_ICE_POOL_SIZE,
            localhost_only: false,
            relay_url: None,
            capture: CaptureConstraints::default(),
        }
    }
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// Comma-separated urls; TURN entries pick up the shared credentials.
fn parse_ice_servers(raw: &str, username: &str, credential: &str) -> Vec<RTCIceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
            RTCIceServer {
                urls: vec![url.to_string()],
                username: if is_turn { username.to_string() } else { String::new() },
                credential: if is_turn { credential.to_string() } else { String::new() },
                ..Default::default()
            }
        })
        .collect()
}
