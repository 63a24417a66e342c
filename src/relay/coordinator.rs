//! Negotiation coordinator
//!
//! Drives broadcaster and consumer offer/answer exchanges against the engine
//! and keeps every live session wired to its stream's candidate traffic.
//!
//! Each negotiation runs in its own task, so a client that disconnects
//! mid-request cannot leave a half-built engine session behind: the task
//! finishes and tears down whatever it created on failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::notifier::{Interest, RelayEvent};
use super::registry::{StreamRegistry, StreamSummary};
use super::types::{CandidateRecord, Role, SessionId, StreamId, StreamState};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::webrtc::{
    AnswerResponse, Engine, EngineError, EngineEvent, EngineSession, IceCandidate, IceServer,
    MediaHandle, NewSession, SessionDescription, SessionSpec,
};

/// Runtime knobs of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Upper bound on one offer/answer exchange
    pub negotiation_timeout: Duration,
    /// How long to collect engine candidates before answering
    pub answer_candidate_wait: Duration,
    /// Idle time after which orphan stream slots are swept
    pub orphan_ttl: Duration,
    pub sweep_interval: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CoordinatorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            negotiation_timeout: Duration::from_millis(config.relay.negotiation_timeout_ms),
            answer_candidate_wait: Duration::from_millis(config.relay.answer_candidate_wait_ms),
            orphan_ttl: Duration::from_secs(config.relay.orphan_ttl_secs),
            sweep_interval: Duration::from_secs(config.relay.sweep_interval_secs.max(1)),
            ice_servers: config.webrtc.ice_servers(),
        }
    }
}

/// One relay-side peer connection
pub struct PeerSession {
    pub id: SessionId,
    pub role: Role,
    pub stream_id: StreamId,
    pub created_at: DateTime<Utc>,
    handle: Arc<dyn EngineSession>,
    /// Stops the session's event and fan-out tasks
    cancel: CancellationToken,
}

/// Session snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub role: Role,
    pub stream_id: StreamId,
    pub created_at: DateTime<Utc>,
}

/// Stream snapshot with its attached consumers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    #[serde(flatten)]
    pub summary: StreamSummary,
    pub consumers: usize,
    pub subscribers: usize,
}

/// Time budget shared by every engine step of one negotiation
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Run an engine step, failing with `Timeout` once the budget is spent
    async fn bound<T, F>(&self, step: F) -> std::result::Result<T, EngineError>
    where
        F: Future<Output = std::result::Result<T, EngineError>>,
    {
        match tokio::time::timeout_at(self.at, step).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.budget)),
        }
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Coordinates negotiations and session lifetimes
pub struct NegotiationCoordinator {
    registry: StreamRegistry,
    engine: Arc<dyn Engine>,
    sessions: RwLock<HashMap<SessionId, Arc<PeerSession>>>,
    settings: ArcSwap<CoordinatorSettings>,
}

impl NegotiationCoordinator {
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: StreamRegistry,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            sessions: RwLock::new(HashMap::new()),
            settings: ArcSwap::from_pointee(settings),
        })
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn settings(&self) -> Arc<CoordinatorSettings> {
        self.settings.load_full()
    }

    /// Apply new settings; running negotiations keep the old ones
    pub fn update_settings(&self, settings: CoordinatorSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Negotiate a broadcaster and publish its stream
    ///
    /// Fails with `AlreadyLive` when another session owns the stream id.
    pub async fn negotiate_broadcaster(
        self: &Arc<Self>,
        stream_id: StreamId,
        offer: SessionDescription,
    ) -> Result<AnswerResponse> {
        offer.validate_offer().map_err(AppError::MalformedRequest)?;

        let this = self.clone();
        tokio::spawn(async move { this.run_broadcaster(stream_id, offer).await })
            .await
            .map_err(|e| AppError::EngineFailure(format!("negotiation task aborted: {}", e)))?
    }

    /// Negotiate a consumer of a Live stream
    ///
    /// Fails with `NoSuchStream` before touching the engine when the stream is
    /// not Live.
    pub async fn negotiate_consumer(
        self: &Arc<Self>,
        stream_id: StreamId,
        offer: SessionDescription,
    ) -> Result<AnswerResponse> {
        offer.validate_offer().map_err(AppError::MalformedRequest)?;
        let record = self.registry.lookup(&stream_id)?;
        let media = record
            .media
            .ok_or_else(|| AppError::NoSuchStream(stream_id.to_string()))?;
        let broadcaster = record.broadcaster_session_id;

        let this = self.clone();
        tokio::spawn(async move { this.run_consumer(stream_id, broadcaster, media, offer).await })
            .await
            .map_err(|e| AppError::EngineFailure(format!("negotiation task aborted: {}", e)))?
    }

    async fn run_broadcaster(
        self: Arc<Self>,
        stream_id: StreamId,
        offer: SessionDescription,
    ) -> Result<AnswerResponse> {
        let deadline = Deadline::start(self.settings.load().negotiation_timeout);
        let session_id = uuid::Uuid::new_v4().to_string();
        self.registry.reserve(&stream_id, &session_id)?;

        let session = match self
            .open_session(&session_id, Role::Broadcaster, &stream_id, deadline)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.registry.end_stream(&stream_id, &session_id);
                return Err(e);
            }
        };

        let result = async {
            let answer = self.complete_negotiation(&session, offer, None, deadline).await?;
            let ice_candidates = self.gathered_candidates(&session, deadline).await;

            let media = session.handle.published_media().ok_or(EngineError::NoMedia)?;
            self.registry.publish(&stream_id, media, &session.id)?;

            Ok::<_, AppError>(AnswerResponse {
                sdp: answer,
                session_id: session.id.clone(),
                stream_id: stream_id.clone(),
                ice_candidates,
            })
        }
        .await;

        if let Err(e) = &result {
            warn!(stream = %stream_id, session_id = %session.id, "Broadcaster negotiation failed: {}", e);
            self.terminate_session(&session.id).await;
        }
        result
    }

    async fn run_consumer(
        self: Arc<Self>,
        stream_id: StreamId,
        broadcaster_session_id: SessionId,
        media: MediaHandle,
        offer: SessionDescription,
    ) -> Result<AnswerResponse> {
        let deadline = Deadline::start(self.settings.load().negotiation_timeout);
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = self
            .open_session(&session_id, Role::Consumer, &stream_id, deadline)
            .await?;

        let result = async {
            let answer = self
                .complete_negotiation(&session, offer, Some(media), deadline)
                .await?;
            let ice_candidates = self.gathered_candidates(&session, deadline).await;

            // The broadcaster may have left while we negotiated
            let still_live = self
                .registry
                .lookup(&stream_id)
                .map(|record| record.broadcaster_session_id == broadcaster_session_id)
                .unwrap_or(false);
            if !still_live {
                return Err(AppError::NoSuchStream(stream_id.to_string()));
            }

            Ok::<_, AppError>(AnswerResponse {
                sdp: answer,
                session_id: session.id.clone(),
                stream_id: stream_id.clone(),
                ice_candidates,
            })
        }
        .await;

        if let Err(e) = &result {
            warn!(stream = %stream_id, session_id = %session.id, "Consumer negotiation failed: {}", e);
            self.terminate_session(&session.id).await;
        }
        result
    }

    /// Create the engine session, register it and start its tasks
    async fn open_session(
        self: &Arc<Self>,
        session_id: &str,
        role: Role,
        stream_id: &StreamId,
        deadline: Deadline,
    ) -> Result<Arc<PeerSession>> {
        let spec = SessionSpec {
            session_id: session_id.to_string(),
            role,
            ice_servers: self.settings.load().ice_servers.clone(),
        };
        let NewSession { handle, events } =
            deadline.bound(self.engine.create_session(&spec)).await?;

        let session = Arc::new(PeerSession {
            id: session_id.to_string(),
            role,
            stream_id: stream_id.clone(),
            created_at: Utc::now(),
            handle,
            cancel: CancellationToken::new(),
        });
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());

        // Subscribe before any drain so no candidate falls between the two
        let fanout = self.registry.notifier().subscribe(stream_id);
        tokio::spawn(self.clone().run_engine_events(session.clone(), events));
        tokio::spawn(self.clone().run_fanout(session.clone(), fanout));

        info!(stream = %stream_id, session_id, role = %role, "Session opened");
        Ok(session)
    }

    /// Offer/answer steps within the negotiation deadline
    async fn complete_negotiation(
        &self,
        session: &PeerSession,
        offer: SessionDescription,
        media: Option<MediaHandle>,
        deadline: Deadline,
    ) -> Result<SessionDescription> {
        let handle = &session.handle;

        let steps = async {
            if let Some(media) = media {
                handle.attach_media(&media).await?;
            }
            handle.set_remote_description(offer).await?;
            self.apply_buffered(session).await;

            let answer = handle.create_answer().await?;
            handle.set_local_description(answer.clone()).await?;
            Ok::<_, EngineError>(answer)
        };

        Ok(deadline.bound(steps).await?)
    }

    /// Replay the stream's buffered candidates into a session
    async fn apply_buffered(&self, session: &PeerSession) {
        let interest = Interest::engine(session.role);
        let buffered = self
            .registry
            .candidates()
            .drain_matching(&session.stream_id, &interest);

        if !buffered.is_empty() {
            debug!(
                session_id = %session.id,
                count = buffered.len(),
                "Applying buffered candidates"
            );
        }
        for record in buffered {
            if let Err(e) = session.handle.add_ice_candidate(record.candidate).await {
                warn!(session_id = %session.id, "Buffered candidate rejected: {}", e);
            }
        }
    }

    /// Engine candidates gathered for the session so far
    ///
    /// The gathering wait never runs past the negotiation deadline.
    async fn gathered_candidates(&self, session: &PeerSession, deadline: Deadline) -> Vec<IceCandidate> {
        let wait = self.settings.load().answer_candidate_wait.min(deadline.remaining());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.registry
            .candidates()
            .drain_session(&session.stream_id, &session.id)
            .into_iter()
            .map(|r| r.candidate)
            .collect()
    }

    /// Trickle a client candidate to a known relay session
    ///
    /// Goes straight to the engine when the session accepts candidates,
    /// otherwise into the stream's buffer.
    pub async fn submit_candidate(&self, session_id: &str, candidate: IceCandidate) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| AppError::NoSuchSession(session_id.to_string()))?;

        if session.handle.accepts_candidates() {
            match session.handle.add_ice_candidate(candidate.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(session_id, "Candidate rejected by engine, buffering: {}", e),
            }
        }

        self.registry.candidates().append(CandidateRecord::remote(
            session.stream_id.clone(),
            session.role,
            candidate,
        ));
        Ok(())
    }

    /// Buffer a client candidate for a stream and fan it out
    pub fn relay_candidate(&self, stream_id: &StreamId, role: Role, candidate: IceCandidate) -> bool {
        self.registry
            .candidates()
            .append(CandidateRecord::remote(stream_id.clone(), role, candidate))
    }

    async fn run_engine_events(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = session.cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(EngineEvent::LocalCandidate(candidate)) => {
                    self.registry.candidates().append(CandidateRecord::local(
                        session.stream_id.clone(),
                        session.role,
                        candidate,
                        session.id.clone(),
                    ));
                }
                Some(EngineEvent::StateChanged(state)) => {
                    debug!(session_id = %session.id, %state, "Engine state changed");
                    if state.is_terminal() {
                        self.terminate_session(&session.id).await;
                        break;
                    }
                }
                Some(EngineEvent::Track { kind }) => {
                    debug!(session_id = %session.id, kind = %kind, "Engine track");
                }
                None => break,
            }
        }
    }

    async fn run_fanout(
        self: Arc<Self>,
        session: Arc<PeerSession>,
        mut rx: broadcast::Receiver<Arc<RelayEvent>>,
    ) {
        let interest = Interest::engine(session.role);

        loop {
            let received = tokio::select! {
                _ = session.cancel.cancelled() => break,
                received = rx.recv() => received,
            };

            match received {
                Ok(event) => match &*event {
                    RelayEvent::NewIceCandidate(record) if interest.accepts(record) => {
                        if !session.handle.accepts_candidates() {
                            // Picked up by the drain after the remote description lands
                            continue;
                        }
                        if let Err(e) = session.handle.add_ice_candidate(record.candidate.clone()).await {
                            debug!(session_id = %session.id, "Fan-out candidate rejected: {}", e);
                        }
                    }
                    RelayEvent::StreamEnded { .. } if session.role == Role::Consumer => {
                        info!(session_id = %session.id, stream = %session.stream_id, "Broadcast ended, closing consumer");
                        self.terminate_session(&session.id).await;
                        break;
                    }
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session.id, skipped, "Fan-out lagged, replaying buffer");
                    if session.handle.accepts_candidates() {
                        self.apply_buffered(&session).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Deregister a session, close its engine connection and end its stream
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub async fn terminate_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(session_id) else {
            return false;
        };

        session.cancel.cancel();
        if let Err(e) = session.handle.close().await {
            warn!(session_id, "Engine close failed: {}", e);
        }
        if session.role == Role::Broadcaster {
            self.registry.end_stream(&session.stream_id, &session.id);
        }

        info!(
            stream = %session.stream_id,
            session_id,
            role = %session.role,
            "Session terminated"
        );
        true
    }

    /// Application-initiated close of one session
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        if self.terminate_session(session_id).await {
            Ok(())
        } else {
            Err(AppError::NoSuchSession(session_id.to_string()))
        }
    }

    /// Terminate every session (shutdown)
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.terminate_session(&id).await {
                closed += 1;
            }
        }
        closed
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .map(|s| SessionInfo {
                session_id: s.id.clone(),
                role: s.role,
                stream_id: s.stream_id.clone(),
                created_at: s.created_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Live and pending streams with consumer and subscriber counts
    pub fn stream_status(&self) -> Vec<StreamStatus> {
        let summaries = self.registry.list_active();
        let sessions = self.sessions.read();

        summaries
            .into_iter()
            .map(|summary| {
                let consumers = sessions
                    .values()
                    .filter(|s| s.role == Role::Consumer && s.stream_id == summary.stream_id)
                    .count();
                let subscribers = self.registry.notifier().subscriber_count(&summary.stream_id);
                StreamStatus {
                    summary,
                    consumers,
                    subscribers,
                }
            })
            .collect()
    }

    pub fn live_stream_count(&self) -> usize {
        self.registry
            .list_active()
            .iter()
            .filter(|s| s.state == StreamState::Live)
            .count()
    }

    /// Reclaim idle stream slots and abandoned notifier channels
    pub fn sweep(&self) -> (usize, usize) {
        let ttl = self.settings.load().orphan_ttl;
        let slots = self.registry.sweep(ttl);
        let channels = self.registry.notifier().prune();
        if slots > 0 || channels > 0 {
            debug!(slots, channels, "Sweep reclaimed idle state");
        }
        (slots, channels)
    }

    /// Run `sweep` periodically until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = this.settings.load().sweep_interval;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        this.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::{FailStep, MockEngine, MockMedia, MOCK_ANSWER_SDP};
    use crate::webrtc::ConnectionState;

    fn sid(s: &str) -> StreamId {
        StreamId::parse(s).unwrap()
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\n")
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            negotiation_timeout: Duration::from_millis(200),
            answer_candidate_wait: Duration::from_millis(20),
            orphan_ttl: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
            ice_servers: vec![],
        }
    }

    fn setup() -> (Arc<MockEngine>, Arc<NegotiationCoordinator>) {
        let engine = Arc::new(MockEngine::new());
        let coordinator =
            NegotiationCoordinator::new(engine.clone(), StreamRegistry::new(64), settings());
        (engine, coordinator)
    }

    /// Let spawned session tasks run
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_broadcaster_publishes_stream() {
        let (engine, coordinator) = setup();

        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        assert_eq!(answer.sdp, SessionDescription::answer(MOCK_ANSWER_SDP));
        assert_eq!(answer.stream_id, sid("abc"));

        let record = coordinator.registry().lookup(&sid("abc")).unwrap();
        assert_eq!(record.broadcaster_session_id, answer.session_id);
        assert_eq!(engine.created_count(), 1);
        assert_eq!(coordinator.session_count(), 1);
    }

    #[tokio::test]
    async fn test_second_broadcaster_already_live() {
        let (engine, coordinator) = setup();
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        let err = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyLive(_)));
        // Rejected before any engine work
        assert_eq!(engine.created_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_without_stream_creates_no_session() {
        let (engine, coordinator) = setup();

        let err = coordinator
            .negotiate_consumer(sid("xyz"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoSuchStream(_)));
        assert_eq!(engine.created_count(), 0);
        assert_eq!(coordinator.session_count(), 0);
    }

    #[tokio::test]
    async fn test_consumer_attaches_published_media() {
        let (engine, coordinator) = setup();
        let broadcast = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        let answer = coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap();

        let consumer = engine.session(&answer.session_id).unwrap();
        let media = consumer.attached_media().unwrap();
        let media = media.downcast::<MockMedia>().unwrap();
        assert_eq!(media.session_id, broadcast.session_id);
    }

    #[tokio::test]
    async fn test_buffered_broadcaster_candidate_reaches_late_consumer() {
        let (engine, coordinator) = setup();
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        assert!(coordinator.relay_candidate(&sid("abc"), Role::Broadcaster, IceCandidate::new("b1")));

        let answer = coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap();
        let consumer = engine.session(&answer.session_id).unwrap();
        assert_eq!(consumer.applied(), vec!["b1"]);
    }

    #[tokio::test]
    async fn test_live_candidate_fans_out_to_consumer() {
        let (engine, coordinator) = setup();
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        let answer = coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap();

        coordinator.relay_candidate(&sid("abc"), Role::Broadcaster, IceCandidate::new("b1"));
        coordinator.relay_candidate(&sid("abc"), Role::Broadcaster, IceCandidate::new("b2"));
        // Same-role and other-stream traffic must not arrive
        coordinator.relay_candidate(&sid("abc"), Role::Consumer, IceCandidate::new("c1"));
        coordinator.relay_candidate(&sid("xyz"), Role::Broadcaster, IceCandidate::new("x1"));
        settle().await;

        let consumer = engine.session(&answer.session_id).unwrap();
        assert_eq!(consumer.applied(), vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn test_answer_carries_gathered_candidates() {
        let (engine, coordinator) = setup();
        engine.gather(vec![IceCandidate::new("host-1"), IceCandidate::new("srflx-1")]);

        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        let gathered: Vec<_> = answer.ice_candidates.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(gathered, vec!["host-1", "srflx-1"]);
    }

    #[tokio::test]
    async fn test_engine_failure_tears_down_and_releases() {
        let (engine, coordinator) = setup();
        engine.fail_at(Some(FailStep::CreateAnswer));

        let err = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(_)));
        assert_eq!(engine.open_count(), 0);
        assert_eq!(coordinator.session_count(), 0);
        assert!(coordinator.registry().list_active().is_empty());

        // The id is free again
        engine.fail_at(None);
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_session_failure_releases_reservation() {
        let (engine, coordinator) = setup();
        engine.fail_at(Some(FailStep::CreateSession));

        let err = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(_)));
        assert!(coordinator.registry().list_active().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_engine_failure_closes_session() {
        let (engine, coordinator) = setup();
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        engine.fail_at(Some(FailStep::AttachMedia));
        let err = coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(_)));
        assert_eq!(engine.open_count(), 1);
        assert_eq!(coordinator.session_count(), 1);
        // The broadcast is unaffected
        assert!(coordinator.registry().lookup(&sid("abc")).is_ok());
    }

    #[tokio::test]
    async fn test_negotiation_timeout_is_engine_failure() {
        let (engine, coordinator) = setup();
        engine.fail_at(Some(FailStep::HangOnAnswer));

        let err = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(ref m) if m.contains("timed out")));
        assert_eq!(engine.open_count(), 0);
    }

    #[tokio::test]
    async fn test_hung_session_creation_times_out() {
        let (engine, coordinator) = setup();
        engine.fail_at(Some(FailStep::HangOnCreate));

        let err = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(ref m) if m.contains("timed out")));
        assert_eq!(engine.created_count(), 0);
        assert_eq!(coordinator.session_count(), 0);
        // Reservation released
        assert!(coordinator.registry().list_active().is_empty());

        engine.fail_at(None);
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        engine.fail_at(Some(FailStep::HangOnCreate));
        let err = coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineFailure(_)));
        assert_eq!(coordinator.session_count(), 1);
    }

    #[tokio::test]
    async fn test_candidate_wait_is_capped_by_deadline() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = NegotiationCoordinator::new(
            engine.clone(),
            StreamRegistry::new(64),
            CoordinatorSettings {
                answer_candidate_wait: Duration::from_secs(30),
                ..settings()
            },
        );

        let started = std::time::Instant::now();
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_malformed_offer_rejected_before_engine() {
        let (engine, coordinator) = setup();

        let err = coordinator
            .negotiate_broadcaster(sid("abc"), SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedRequest(_)));
        assert_eq!(engine.created_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcaster_close_ends_stream_and_evicts() {
        let (engine, coordinator) = setup();
        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        coordinator.relay_candidate(&sid("abc"), Role::Broadcaster, IceCandidate::new("b1"));

        engine
            .session(&answer.session_id)
            .unwrap()
            .emit_state(ConnectionState::Closed);
        settle().await;

        assert!(coordinator.registry().lookup(&sid("abc")).is_err());
        assert!(coordinator.registry().candidates().is_empty(&sid("abc")));
        assert_eq!(coordinator.session_count(), 0);

        // A new broadcaster can take the id
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_end_closes_consumers() {
        let (engine, coordinator) = setup();
        let broadcast = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        let consumer = coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap();

        coordinator.close_session(&broadcast.session_id).await.unwrap();
        settle().await;

        assert!(engine.session(&consumer.session_id).unwrap().is_closed());
        assert_eq!(coordinator.session_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (engine, coordinator) = setup();
        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        assert!(coordinator.terminate_session(&answer.session_id).await);
        assert!(!coordinator.terminate_session(&answer.session_id).await);
        assert_eq!(engine.closed_count(), 1);
        assert!(matches!(
            coordinator.close_session(&answer.session_id).await,
            Err(AppError::NoSuchSession(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_candidate_goes_to_engine() {
        let (engine, coordinator) = setup();
        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        coordinator
            .submit_candidate(&answer.session_id, IceCandidate::new("direct"))
            .await
            .unwrap();
        assert_eq!(engine.session(&answer.session_id).unwrap().applied(), vec!["direct"]);
        assert!(coordinator.registry().candidates().is_empty(&sid("abc")));

        assert!(matches!(
            coordinator.submit_candidate("nope", IceCandidate::new("x")).await,
            Err(AppError::NoSuchSession(_))
        ));
    }

    #[tokio::test]
    async fn test_local_candidates_are_buffered() {
        let (engine, coordinator) = setup();
        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();

        engine
            .session(&answer.session_id)
            .unwrap()
            .emit_candidate(IceCandidate::new("late-host"));
        settle().await;

        let own = coordinator
            .registry()
            .candidates()
            .drain_session(&sid("abc"), &answer.session_id);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].role, Role::Broadcaster);
    }

    #[tokio::test]
    async fn test_close_all_and_status() {
        let (engine, coordinator) = setup();
        coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        coordinator
            .negotiate_consumer(sid("abc"), offer())
            .await
            .unwrap();
        coordinator
            .negotiate_broadcaster(sid("xyz"), offer())
            .await
            .unwrap();

        let status = coordinator.stream_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].summary.stream_id, sid("abc"));
        assert_eq!(status[0].consumers, 1);
        assert_eq!(coordinator.live_stream_count(), 2);
        assert_eq!(coordinator.list_sessions().len(), 3);

        coordinator.close_all().await;
        assert_eq!(coordinator.session_count(), 0);
        assert_eq!(engine.open_count(), 0);
        assert_eq!(coordinator.live_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_ended_streams() {
        let (_engine, coordinator) = setup();
        let answer = coordinator
            .negotiate_broadcaster(sid("abc"), offer())
            .await
            .unwrap();
        coordinator.terminate_session(&answer.session_id).await;
        settle().await;

        let (slots, _) = coordinator.sweep();
        assert_eq!(slots, 1);
        assert_eq!(coordinator.registry().slot_count(), 0);
    }
}
