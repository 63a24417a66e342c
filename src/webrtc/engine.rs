//! Engine collaborator contract
//!
//! The relay never negotiates media itself. It drives an external WebRTC
//! engine through these traits and consumes the engine's asynchronous
//! notifications (discovered local candidates, connection state, incoming
//! tracks) from an ordered channel returned at session creation.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::config::IceServer;
use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use crate::relay::{Role, SessionId};

/// Engine-level failures, tagged with the step that failed
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("failed to create session: {0}")]
    CreateSession(String),
    #[error("failed to set remote description: {0}")]
    RemoteDescription(String),
    #[error("failed to create answer: {0}")]
    CreateAnswer(String),
    #[error("failed to set local description: {0}")]
    LocalDescription(String),
    #[error("failed to attach media: {0}")]
    AttachMedia(String),
    #[error("failed to add ICE candidate: {0}")]
    AddCandidate(String),
    #[error("failed to close session: {0}")]
    Close(String),
    #[error("session has no published media")]
    NoMedia,
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),
}

/// Notification emitted by an engine session
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local network path was discovered
    LocalCandidate(IceCandidate),
    /// Peer connection state changed
    StateChanged(ConnectionState),
    /// A remote media track arrived
    Track { kind: String },
}

/// Opaque reference to engine-level published media
///
/// Only the engine that produced it knows the concrete type.
#[derive(Clone)]
pub struct MediaHandle(Arc<dyn Any + Send + Sync>);

impl MediaHandle {
    pub fn new<T: Any + Send + Sync>(media: Arc<T>) -> Self {
        Self(media)
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MediaHandle(..)")
    }
}

/// Parameters for a new engine session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: SessionId,
    pub role: Role,
    pub ice_servers: Vec<IceServer>,
}

/// A freshly created engine session and its event stream
pub struct NewSession {
    pub handle: Arc<dyn EngineSession>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Factory for engine sessions
#[async_trait]
pub trait Engine: Send + Sync {
    async fn create_session(&self, spec: &SessionSpec) -> Result<NewSession, EngineError>;
}

/// One engine-owned peer connection
///
/// The relay holds a non-owning reference; `close` asks the engine to tear
/// the connection down.
#[async_trait]
pub trait EngineSession: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Media published by a broadcaster session
    fn published_media(&self) -> Option<MediaHandle>;

    /// Add the tracks of published media to this session
    async fn attach_media(&self, media: &MediaHandle) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Whether the connection can take remote candidates right now
    fn accepts_candidates(&self) -> bool;

    async fn close(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tracks(u32);

    #[test]
    fn test_media_handle_downcast() {
        let handle = MediaHandle::new(Arc::new(Tracks(2)));
        assert_eq!(handle.downcast::<Tracks>().map(|t| t.0), Some(2));
        assert!(handle.downcast::<String>().is_none());

        let copy = handle.clone();
        assert_eq!(copy.downcast::<Tracks>().map(|t| t.0), Some(2));
    }
}
