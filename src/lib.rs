//! Beacon Relay - one-to-many WebRTC signaling relay
//!
//! A broadcaster publishes a stream under a stream id; any number of
//! consumers negotiate against it. The relay keeps the stream registry,
//! buffers ICE candidates for late joiners and fans new candidates out to
//! the other side of each stream.

pub mod config;
pub mod error;
pub mod relay;
pub mod state;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
