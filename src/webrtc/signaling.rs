//! Signaling wire types
//!
//! Session descriptions and candidates are opaque to the relay: they are
//! validated for shape only and passed through to the engine untouched.

use serde::{Deserialize, Serialize};

use crate::relay::{Role, SessionId, StreamId};

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description (offer or answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Shape check for a remote offer; the SDP body itself stays opaque
    pub fn validate_offer(&self) -> Result<(), String> {
        if self.sdp_type != SdpType::Offer {
            return Err(format!(
                "expected session description of type offer, got {:?}",
                self.sdp_type
            ));
        }
        if self.sdp.trim().is_empty() {
            return Err("empty session description".to_string());
        }
        Ok(())
    }
}

/// ICE candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Offer submitted by a broadcaster or consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRequest {
    pub sdp: SessionDescription,
}

impl OfferRequest {
    /// Shape check before any engine interaction
    pub fn validate(&self) -> Result<(), String> {
        self.sdp.validate_offer()
    }
}

/// Answer returned to the offering peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub sdp: SessionDescription,
    /// Session ID for this connection
    pub session_id: SessionId,
    pub stream_id: StreamId,
    /// Candidates gathered while the answer was produced
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_candidates: Vec<IceCandidate>,
}

/// Trickle ICE submission over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    pub candidate: IceCandidate,
    /// Role of the submitting peer
    pub role: Role,
    /// Target relay session, when the client knows it
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Alternative to the path segment
    #[serde(default)]
    pub stream_id: Option<String>,
}

/// Generic acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Freshly generated stream id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateStreamIdResponse {
    pub stream_id: StreamId,
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session never recovers
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_request_shape() {
        let req: OfferRequest =
            serde_json::from_str(r#"{"sdp":{"type":"offer","sdp":"v=0\r\n"}}"#).unwrap();
        assert!(req.validate().is_ok());

        let req: OfferRequest =
            serde_json::from_str(r#"{"sdp":{"type":"answer","sdp":"v=0\r\n"}}"#).unwrap();
        assert!(req.validate().is_err());

        let req: OfferRequest = serde_json::from_str(r#"{"sdp":{"type":"offer","sdp":"  "}}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_candidate_browser_format() {
        let json = r#"{"candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let c: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert!(c.username_fragment.is_none());
    }

    #[test]
    fn test_ice_candidate_request() {
        let json = r#"{"candidate":{"candidate":"c1"},"role":"consumer"}"#;
        let req: IceCandidateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.role, Role::Consumer);
        assert!(req.session_id.is_none());

        let bad = r#"{"candidate":{"candidate":"c1"},"role":"viewer"}"#;
        assert!(serde_json::from_str::<IceCandidateRequest>(bad).is_err());
    }

    #[test]
    fn test_answer_response_camel_case() {
        let resp = AnswerResponse {
            sdp: SessionDescription::answer("v=0"),
            session_id: "s1".to_string(),
            stream_id: StreamId::parse("abc").unwrap(),
            ice_candidates: vec![],
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["sdp"]["type"], "answer");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["streamId"], "abc");
        assert!(json.get("iceCandidates").is_none());
    }
}
