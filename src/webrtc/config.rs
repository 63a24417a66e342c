//! WebRTC engine configuration

use serde::{Deserialize, Serialize};
use webrtc::ice::mdns::MulticastDnsMode;

/// Public STUN server used when nothing is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.stunprotocol.org";

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// mDNS candidate handling
    pub mdns_mode: MdnsMode,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
            mdns_mode: MdnsMode::default(),
        }
    }
}

impl WebRtcConfig {
    /// Flatten STUN and TURN entries into engine ICE servers
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self.stun_servers.iter().filter(|url| !url.is_empty()).map(|url| IceServer {
            urls: vec![url.clone()],
            username: String::new(),
            credential: String::new(),
        });
        let turn = self
            .turn_servers
            .iter()
            .filter(|t| !t.urls.is_empty())
            .map(|t| IceServer {
                urls: t.urls.clone(),
                username: t.username.clone(),
                credential: t.credential.clone(),
            });
        stun.chain(turn).collect()
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

/// One ICE server handed to the engine on session creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// mDNS mode for host candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    Disabled,
    /// Resolve `.local` candidates but never gather them
    #[default]
    QueryOnly,
    QueryAndGather,
}

impl MdnsMode {
    /// Parse the loose spellings accepted from the environment
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "false" | "0" => Some(MdnsMode::Disabled),
            "query" | "query_only" | "query-only" => Some(MdnsMode::QueryOnly),
            "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
                Some(MdnsMode::QueryAndGather)
            }
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MdnsMode::Disabled => "disabled",
            MdnsMode::QueryOnly => "query_only",
            MdnsMode::QueryAndGather => "query_and_gather",
        }
    }
}

impl From<MdnsMode> for MulticastDnsMode {
    fn from(mode: MdnsMode) -> Self {
        match mode {
            MdnsMode::Disabled => MulticastDnsMode::Disabled,
            MdnsMode::QueryOnly => MulticastDnsMode::QueryOnly,
            MdnsMode::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }
}

pub fn default_mdns_host_name(session_id: &str) -> String {
    format!("{session_id}.local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_servers() {
        let servers = WebRtcConfig::default().ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn test_turn_servers_included() {
        let config = WebRtcConfig {
            stun_servers: vec![String::new()],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            mdns_mode: MdnsMode::Disabled,
        };
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "user");
    }

    #[test]
    fn test_mdns_mode_parse() {
        assert_eq!(MdnsMode::parse("off"), Some(MdnsMode::Disabled));
        assert_eq!(MdnsMode::parse(" Query-Only "), Some(MdnsMode::QueryOnly));
        assert_eq!(MdnsMode::parse("gather"), Some(MdnsMode::QueryAndGather));
        assert_eq!(MdnsMode::parse("bogus"), None);
        assert_eq!(MdnsMode::default().label(), "query_only");
    }
}
