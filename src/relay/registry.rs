//! Stream registry
//!
//! Maps a stream id to the current broadcaster's published state. Every
//! stream owns a slot guarded by its own mutex; the outer map is only locked
//! long enough to find or create a slot, so operations on different streams
//! never wait on each other.
//!
//! Policy is first-writer-wins: a Live (or reserved) stream id cannot be
//! taken over by another broadcaster session until the owner ends it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::buffer::{CandidateBuffer, CandidateLog};
use super::notifier::{FanoutNotifier, RelayEvent};
use super::types::{SessionId, StreamId, StreamRecord, StreamState};
use crate::webrtc::MediaHandle;

/// Error type for registry operations
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Another broadcaster session owns the stream id
    #[error("stream already live: {0}")]
    AlreadyLive(StreamId),
    /// No Live record for the stream id
    #[error("stream not found: {0}")]
    NotFound(StreamId),
    /// The session's reservation was released before it could publish
    #[error("reservation released: {0}")]
    Released(StreamId),
}

/// Per-stream state guarded by the slot mutex
pub(crate) struct StreamSlot {
    pub(crate) record: Option<StreamRecord>,
    pub(crate) candidates: CandidateLog,
    touched: Instant,
    /// Set when the sweeper removed the slot from the map
    detached: bool,
}

impl StreamSlot {
    fn new(capacity: usize) -> Self {
        Self {
            record: None,
            candidates: CandidateLog::new(capacity),
            touched: Instant::now(),
            detached: false,
        }
    }

    fn is_orphan(&self) -> bool {
        match &self.record {
            None => true,
            Some(record) => record.state == StreamState::Ended,
        }
    }
}

/// Snapshot of one stream for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: StreamId,
    pub state: StreamState,
    pub broadcaster_session_id: SessionId,
    pub buffered_candidates: usize,
    pub updated_at: DateTime<Utc>,
}

/// Central registry for all streams
pub struct StreamRegistry {
    slots: RwLock<HashMap<StreamId, Arc<Mutex<StreamSlot>>>>,
    notifier: Arc<FanoutNotifier>,
    candidate_capacity: usize,
}

impl StreamRegistry {
    /// Create a registry with its own notifier
    pub fn new(candidate_capacity: usize) -> Self {
        Self::with_notifier(candidate_capacity, Arc::new(FanoutNotifier::default()))
    }

    pub fn with_notifier(candidate_capacity: usize, notifier: Arc<FanoutNotifier>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            notifier,
            candidate_capacity,
        }
    }

    pub fn notifier(&self) -> &Arc<FanoutNotifier> {
        &self.notifier
    }

    /// Candidate buffer sharing this registry's per-stream locks
    pub fn candidates(&self) -> CandidateBuffer<'_> {
        CandidateBuffer::new(self)
    }

    /// Claim a stream id for a broadcaster negotiation in progress
    ///
    /// Fails if a different session already holds the id (Pending or Live).
    /// An Ended tombstone is replaced.
    pub fn reserve(&self, stream_id: &StreamId, session_id: &str) -> Result<(), RegistryError> {
        self.with_slot(stream_id, true, |slot| {
            match &slot.record {
                Some(record) if record.state == StreamState::Live => {
                    return Err(RegistryError::AlreadyLive(stream_id.clone()));
                }
                Some(record)
                    if record.state == StreamState::Pending
                        && record.broadcaster_session_id != session_id =>
                {
                    return Err(RegistryError::AlreadyLive(stream_id.clone()));
                }
                _ => {}
            }

            slot.record = Some(StreamRecord {
                stream_id: stream_id.clone(),
                media: None,
                broadcaster_session_id: session_id.to_string(),
                state: StreamState::Pending,
                updated_at: Utc::now(),
            });
            debug!(stream = %stream_id, session_id, "Stream id reserved");
            Ok(())
        })
        .unwrap_or_else(|| Err(RegistryError::AlreadyLive(stream_id.clone())))
    }

    /// Register a Live record for the broadcaster session
    ///
    /// Fails with `AlreadyLive` if a Live record exists, or if another session
    /// holds the reservation. A session whose stream already ended cannot
    /// publish again (`Released`).
    pub fn publish(
        &self,
        stream_id: &StreamId,
        media: MediaHandle,
        session_id: &str,
    ) -> Result<StreamRecord, RegistryError> {
        let notifier = self.notifier.clone();

        self.with_slot(stream_id, true, |slot| {
            if let Some(existing) = &slot.record {
                if existing.state == StreamState::Ended
                    && existing.broadcaster_session_id == session_id
                {
                    return Err(RegistryError::Released(stream_id.clone()));
                }
                let held_by_other = existing.state == StreamState::Pending
                    && existing.broadcaster_session_id != session_id;
                if existing.state == StreamState::Live || held_by_other {
                    warn!(
                        stream = %stream_id,
                        session_id,
                        owner = %existing.broadcaster_session_id,
                        "Publish rejected, stream already owned"
                    );
                    return Err(RegistryError::AlreadyLive(stream_id.clone()));
                }
            }

            let record = StreamRecord {
                stream_id: stream_id.clone(),
                media: Some(media),
                broadcaster_session_id: session_id.to_string(),
                state: StreamState::Live,
                updated_at: Utc::now(),
            };
            slot.record = Some(record.clone());

            info!(
                stream = %stream_id,
                session_id,
                buffered = slot.candidates.len(),
                "Stream published"
            );
            notifier.publish(
                stream_id,
                RelayEvent::StreamLive {
                    stream_id: stream_id.clone(),
                },
            );
            Ok(record)
        })
        .unwrap_or_else(|| Err(RegistryError::AlreadyLive(stream_id.clone())))
    }

    /// Find the Live record for a stream
    pub fn lookup(&self, stream_id: &StreamId) -> Result<StreamRecord, RegistryError> {
        self.with_slot(stream_id, false, |slot| {
            slot.record.as_ref().filter(|r| r.is_live()).cloned()
        })
        .flatten()
        .ok_or_else(|| RegistryError::NotFound(stream_id.clone()))
    }

    /// End the stream owned by `session_id`
    ///
    /// Only the recorded broadcaster session can end the stream; a stale or
    /// duplicate session is ignored. Ending also evicts the stream's buffered
    /// candidates. Idempotent: returns `true` only for the call that actually
    /// transitioned the record.
    pub fn end_stream(&self, stream_id: &StreamId, session_id: &str) -> bool {
        let notifier = self.notifier.clone();

        self.with_slot(stream_id, false, |slot| {
            let record = match slot.record.as_mut() {
                Some(record) => record,
                None => return false,
            };

            if record.broadcaster_session_id != session_id {
                debug!(
                    stream = %stream_id,
                    owner = %record.broadcaster_session_id,
                    session_id,
                    "End ignored, session does not own stream"
                );
                return false;
            }

            let was_live = match record.state {
                StreamState::Ended => return false,
                StreamState::Live => true,
                StreamState::Pending => false,
            };

            record.state = StreamState::Ended;
            record.media = None;
            record.updated_at = Utc::now();
            let evicted = slot.candidates.clear();

            info!(stream = %stream_id, session_id, evicted, was_live, "Stream ended");
            if was_live {
                notifier.publish(
                    stream_id,
                    RelayEvent::StreamEnded {
                        stream_id: stream_id.clone(),
                    },
                );
            }
            true
        })
        .unwrap_or(false)
    }

    /// Summaries of all Pending and Live streams
    pub fn list_active(&self) -> Vec<StreamSummary> {
        let slots: Vec<Arc<Mutex<StreamSlot>>> = self.slots.read().values().cloned().collect();

        let mut summaries: Vec<StreamSummary> = slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                let record = slot.record.as_ref()?;
                if slot.detached || record.state == StreamState::Ended {
                    return None;
                }
                Some(StreamSummary {
                    stream_id: record.stream_id.clone(),
                    state: record.state,
                    broadcaster_session_id: record.broadcaster_session_id.clone(),
                    buffered_candidates: slot.candidates.len(),
                    updated_at: record.updated_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        summaries
    }

    /// Remove Ended tombstones and candidate-only slots idle longer than `ttl`
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();

        slots.retain(|stream_id, slot| {
            // A slot busy right now is not idle
            let Some(mut slot) = slot.try_lock() else {
                return true;
            };
            if slot.is_orphan() && slot.touched.elapsed() >= ttl {
                slot.detached = true;
                debug!(stream = %stream_id, "Swept idle stream slot");
                false
            } else {
                true
            }
        });

        before - slots.len()
    }

    /// Number of slots currently tracked
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Run `f` under the stream's lock
    ///
    /// With `create == false` an unknown stream yields `None`. A slot detached
    /// by the sweeper between lookup and lock is retried against the map.
    pub(crate) fn with_slot<R, F>(&self, stream_id: &StreamId, create: bool, f: F) -> Option<R>
    where
        F: FnOnce(&mut StreamSlot) -> R,
    {
        loop {
            let slot = self.slot(stream_id, create)?;
            let mut guard = slot.lock();
            if guard.detached {
                continue;
            }
            guard.touched = Instant::now();
            return Some(f(&mut guard));
        }
    }

    fn slot(&self, stream_id: &StreamId, create: bool) -> Option<Arc<Mutex<StreamSlot>>> {
        if let Some(slot) = self.slots.read().get(stream_id) {
            return Some(slot.clone());
        }
        if !create {
            return None;
        }
        let mut slots = self.slots.write();
        Some(
            slots
                .entry(stream_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(StreamSlot::new(self.candidate_capacity))))
                .clone(),
        )
    }
}
