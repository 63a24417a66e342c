use serde::{Deserialize, Serialize};

use crate::relay::{DEFAULT_CANDIDATE_CAPACITY, DEFAULT_NOTIFIER_CAPACITY};
pub use crate::webrtc::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Registry and negotiation settings
    pub relay: RelayConfig,
    /// ICE servers and mDNS handling
    pub webrtc: WebRtcConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
    /// Origins allowed by CORS; empty allows any origin
    pub allowed_origins: Vec<String>,
    /// Frontend build served for non-API paths
    pub static_dir: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            bind_address: "0.0.0.0".to_string(),
            allowed_origins: vec![],
            static_dir: None,
        }
    }
}

/// Stream addressing mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// One implied stream; the stream id may be omitted
    Single,
    /// Every request names its stream
    #[default]
    Multi,
}

impl std::str::FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(StreamMode::Single),
            "multi" => Ok(StreamMode::Multi),
            other => Err(format!("unknown stream mode: {}", other)),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: StreamMode,
    /// Stream id implied in single mode
    pub default_stream_id: String,
    /// Candidates kept per stream before the oldest is dropped
    pub candidate_capacity: usize,
    /// Events buffered per stream for slow subscribers
    pub notifier_capacity: usize,
    pub negotiation_timeout_ms: u64,
    /// Time spent collecting engine candidates for the answer
    pub answer_candidate_wait_ms: u64,
    /// Idle time before ended or candidate-only streams are reclaimed
    pub orphan_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Multi,
            default_stream_id: "default".to_string(),
            candidate_capacity: DEFAULT_CANDIDATE_CAPACITY,
            notifier_capacity: DEFAULT_NOTIFIER_CAPACITY,
            negotiation_timeout_ms: 15_000,
            answer_candidate_wait_ms: 100,
            orphan_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}
