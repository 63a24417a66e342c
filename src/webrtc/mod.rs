//! WebRTC engine boundary
//!
//! The relay talks to media engines only through the traits in [`engine`].
//! [`peer::RtcEngine`] implements them on top of webrtc-rs:
//!
//! ```text
//! Broadcaster browser --offer--> RtcSession (recvonly)
//!                                   | on_track -> RTP channels (RtcMedia)
//!                                   v
//! Consumer browser <--RTP------- RtcSession (sendonly, TrackLocalStaticRTP)
//! ```
//!
//! SDP and candidate payloads stay opaque to the relay; [`signaling`] holds
//! the wire types that carry them.

pub mod config;
pub mod engine;
pub mod peer;
pub mod signaling;

pub use config::{IceServer, MdnsMode, TurnServer, WebRtcConfig};
pub use engine::{
    Engine, EngineError, EngineEvent, EngineSession, MediaHandle, NewSession, SessionSpec,
};
pub use peer::RtcEngine;
pub use signaling::{
    AckResponse, AnswerResponse, ConnectionState, GenerateStreamIdResponse, IceCandidate,
    IceCandidateRequest, OfferRequest, SdpType, SessionDescription,
};
