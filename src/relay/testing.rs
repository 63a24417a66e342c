//! Scripted in-memory engine for tests
//!
//! Sessions answer every offer with a fixed SDP, record the candidates
//! applied to them and can be told to fail at a chosen step.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::types::{Role, SessionId};
use crate::webrtc::{
    ConnectionState, Engine, EngineError, EngineEvent, EngineSession, IceCandidate, MediaHandle,
    NewSession, SessionDescription, SessionSpec,
};

/// SDP body of every mock answer
pub const MOCK_ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=mock\r\n";

/// Step at which a mock session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStep {
    CreateSession,
    /// `create_session` never completes
    HangOnCreate,
    AttachMedia,
    RemoteDescription,
    CreateAnswer,
    LocalDescription,
    /// `create_answer` never completes
    HangOnAnswer,
}

/// Media published by a mock broadcaster session
#[derive(Debug)]
pub struct MockMedia {
    pub session_id: SessionId,
}

#[derive(Default)]
struct MockState {
    created: AtomicUsize,
    closed: AtomicUsize,
    fail_at: Mutex<Option<FailStep>>,
    gathered: Mutex<Vec<IceCandidate>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

/// Engine double counting every session it creates and closes
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following session fail at `step`
    pub fn fail_at(&self, step: Option<FailStep>) {
        *self.state.fail_at.lock() = step;
    }

    /// Candidates each session "discovers" once its local description is set
    pub fn gather(&self, candidates: Vec<IceCandidate>) {
        *self.state.gathered.lock() = candidates;
    }

    pub fn created_count(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Sessions created and not closed yet
    pub fn open_count(&self) -> usize {
        self.created_count() - self.closed_count()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<MockSession>> {
        self.state
            .sessions
            .lock()
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn create_session(&self, spec: &SessionSpec) -> Result<NewSession, EngineError> {
        let fail_at = *self.state.fail_at.lock();
        if fail_at == Some(FailStep::CreateSession) {
            return Err(EngineError::CreateSession("scripted failure".to_string()));
        }
        if fail_at == Some(FailStep::HangOnCreate) {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let media = match spec.role {
            Role::Broadcaster => Some(MediaHandle::new(Arc::new(MockMedia {
                session_id: spec.session_id.clone(),
            }))),
            Role::Consumer => None,
        };

        let session = Arc::new(MockSession {
            session_id: spec.session_id.clone(),
            role: spec.role,
            fail_at,
            events: tx,
            media,
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            attached: Mutex::new(None),
            state: self.state.clone(),
        });

        self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state.sessions.lock().push(session.clone());

        Ok(NewSession {
            handle: session,
            events: rx,
        })
    }
}

/// One scripted engine session
pub struct MockSession {
    pub session_id: SessionId,
    pub role: Role,
    fail_at: Option<FailStep>,
    events: mpsc::UnboundedSender<EngineEvent>,
    media: Option<MediaHandle>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    applied: Mutex<Vec<IceCandidate>>,
    attached: Mutex<Option<MediaHandle>>,
    state: Arc<MockState>,
}

impl MockSession {
    /// Pretend the engine discovered a local candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
    }

    /// Pretend the connection changed state
    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(EngineEvent::StateChanged(state));
    }

    /// Candidate strings applied to this session, in order
    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn attached_media(&self) -> Option<MediaHandle> {
        self.attached.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fails_at(&self, step: FailStep) -> bool {
        self.fail_at == Some(step)
    }
}

#[async_trait]
impl EngineSession for MockSession {
    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
        if self.fails_at(FailStep::RemoteDescription) {
            return Err(EngineError::RemoteDescription("scripted failure".to_string()));
        }
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.fails_at(FailStep::HangOnAnswer) {
            std::future::pending::<()>().await;
        }
        if self.fails_at(FailStep::CreateAnswer) {
            return Err(EngineError::CreateAnswer("scripted failure".to_string()));
        }
        Ok(SessionDescription::answer(MOCK_ANSWER_SDP))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
        if self.fails_at(FailStep::LocalDescription) {
            return Err(EngineError::LocalDescription("scripted failure".to_string()));
        }
        let gathered = self.state.gathered.lock().clone();
        for candidate in gathered {
            self.emit_candidate(candidate);
        }
        Ok(())
    }

    fn published_media(&self) -> Option<MediaHandle> {
        self.media.clone()
    }

    async fn attach_media(&self, media: &MediaHandle) -> Result<(), EngineError> {
        if self.fails_at(FailStep::AttachMedia) {
            return Err(EngineError::AttachMedia("scripted failure".to_string()));
        }
        if media.downcast::<MockMedia>().is_none() {
            return Err(EngineError::AttachMedia("foreign media".to_string()));
        }
        *self.attached.lock() = Some(media.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if !self.accepts_candidates() {
            return Err(EngineError::AddCandidate("remote description not set".to_string()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    fn accepts_candidates(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
