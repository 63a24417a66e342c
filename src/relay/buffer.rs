//! Candidate buffer
//!
//! Append-only, per-stream log of connectivity candidates that arrived before
//! the opposite side was ready to consume them. Drains never remove entries,
//! so every late joiner sees the full history in arrival order; only
//! eviction (stream end) clears a stream's log.
//!
//! The log lives inside the registry's per-stream slot, which makes append
//! and eviction linearizable with `Publish`/`EndStream` on the same stream.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use super::notifier::{Interest, RelayEvent};
use super::registry::StreamRegistry;
use super::types::{CandidateRecord, Role, StreamId, StreamState};

/// Default number of candidates kept per stream
pub const DEFAULT_CANDIDATE_CAPACITY: usize = 256;

/// Bounded FIFO of candidates for one stream
#[derive(Debug)]
pub(crate) struct CandidateLog {
    entries: VecDeque<CandidateRecord>,
    capacity: usize,
}

impl CandidateLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append, dropping the oldest entry once full
    pub(crate) fn push(&mut self, record: CandidateRecord) -> Option<CandidateRecord> {
        let dropped = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(record);
        dropped
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &CandidateRecord> {
        self.entries.iter()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Candidate buffer view over the registry's stream slots
pub struct CandidateBuffer<'a> {
    registry: &'a StreamRegistry,
}

impl<'a> CandidateBuffer<'a> {
    pub(crate) fn new(registry: &'a StreamRegistry) -> Self {
        Self { registry }
    }

    /// Append a candidate and fan it out to the stream's subscribers
    ///
    /// Publishing happens inside the stream's critical section, so subscribers
    /// see candidates in exactly the order they were buffered. Returns `false`
    /// when the stream has ended and the candidate was discarded.
    pub fn append(&self, record: CandidateRecord) -> bool {
        let stream_id = record.stream_id.clone();
        let notifier = self.registry.notifier().clone();

        self.registry
            .with_slot(&stream_id, true, |slot| {
                if matches!(slot.record.as_ref().map(|r| r.state), Some(StreamState::Ended)) {
                    debug!(
                        stream = %stream_id,
                        role = %record.role,
                        "Dropping candidate for ended stream"
                    );
                    return false;
                }

                if let Some(dropped) = slot.candidates.push(record.clone()) {
                    warn!(
                        stream = %stream_id,
                        dropped_role = %dropped.role,
                        "Candidate buffer full, dropped oldest entry"
                    );
                }
                trace!(stream = %stream_id, role = %record.role, buffered = slot.candidates.len(), "Candidate buffered");

                notifier.publish(&stream_id, RelayEvent::NewIceCandidate(record));
                true
            })
            .unwrap_or(false)
    }

    /// All candidates originated by the opposite role, in arrival order
    pub fn drain_for(&self, stream_id: &StreamId, requesting_role: Role) -> Vec<CandidateRecord> {
        let origin = requesting_role.opposite();
        self.collect(stream_id, |r| r.role == origin)
    }

    /// Candidates a given subscriber interest would have received, in arrival order
    pub fn drain_matching(&self, stream_id: &StreamId, interest: &Interest) -> Vec<CandidateRecord> {
        self.collect(stream_id, |r| interest.accepts(r))
    }

    /// Candidates discovered by one relay engine session, in arrival order
    pub fn drain_session(&self, stream_id: &StreamId, session_id: &str) -> Vec<CandidateRecord> {
        self.collect(stream_id, |r| r.origin_session.as_deref() == Some(session_id))
    }

    /// Delete all buffered candidates for a stream
    pub fn evict(&self, stream_id: &StreamId) -> usize {
        self.registry
            .with_slot(stream_id, false, |slot| slot.candidates.clear())
            .unwrap_or(0)
    }

    /// Number of buffered candidates for a stream
    pub fn len(&self, stream_id: &StreamId) -> usize {
        self.registry
            .with_slot(stream_id, false, |slot| slot.candidates.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream_id: &StreamId) -> bool {
        self.len(stream_id) == 0
    }

    fn collect<F>(&self, stream_id: &StreamId, filter: F) -> Vec<CandidateRecord>
    where
        F: Fn(&CandidateRecord) -> bool,
    {
        self.registry
            .with_slot(stream_id, false, |slot| {
                slot.candidates.iter().filter(|r| filter(r)).cloned().collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::StreamRegistry;
    use crate::relay::RelayEvent;
    use crate::webrtc::IceCandidate;

    fn sid(s: &str) -> StreamId {
        StreamId::parse(s).unwrap()
    }

    fn remote(stream: &str, role: Role, c: &str) -> CandidateRecord {
        CandidateRecord::remote(sid(stream), role, IceCandidate::new(c))
    }

    fn candidates(records: &[CandidateRecord]) -> Vec<String> {
        records.iter().map(|r| r.candidate.candidate.clone()).collect()
    }

    #[test]
    fn test_drain_returns_opposite_role_in_order() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        let buffer = registry.candidates();

        buffer.append(remote("abc", Role::Broadcaster, "b1"));
        buffer.append(remote("abc", Role::Consumer, "c1"));
        buffer.append(remote("abc", Role::Broadcaster, "b2"));
        buffer.append(remote("abc", Role::Broadcaster, "b3"));

        let drained = buffer.drain_for(&sid("abc"), Role::Consumer);
        assert_eq!(candidates(&drained), vec!["b1", "b2", "b3"]);

        let drained = buffer.drain_for(&sid("abc"), Role::Broadcaster);
        assert_eq!(candidates(&drained), vec!["c1"]);
    }

    #[test]
    fn test_repeated_drains_see_full_history() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        let buffer = registry.candidates();

        for i in 0..5 {
            buffer.append(remote("abc", Role::Broadcaster, &format!("b{i}")));
        }

        let first = buffer.drain_for(&sid("abc"), Role::Consumer);
        let second = buffer.drain_for(&sid("abc"), Role::Consumer);
        assert_eq!(first.len(), 5);
        assert_eq!(candidates(&first), candidates(&second));
        assert_eq!(buffer.len(&sid("abc")), 5);
    }

    #[test]
    fn test_streams_are_isolated() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        let buffer = registry.candidates();

        buffer.append(remote("abc", Role::Broadcaster, "b-abc"));
        buffer.append(remote("xyz", Role::Broadcaster, "b-xyz"));

        assert_eq!(
            candidates(&buffer.drain_for(&sid("abc"), Role::Consumer)),
            vec!["b-abc"]
        );
        assert_eq!(
            candidates(&buffer.drain_for(&sid("xyz"), Role::Consumer)),
            vec!["b-xyz"]
        );
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let registry = StreamRegistry::new(3);
        let buffer = registry.candidates();

        for i in 0..5 {
            buffer.append(remote("abc", Role::Broadcaster, &format!("b{i}")));
        }

        let drained = buffer.drain_for(&sid("abc"), Role::Consumer);
        assert_eq!(candidates(&drained), vec!["b2", "b3", "b4"]);
    }

    #[test]
    fn test_evict_clears_stream() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        let buffer = registry.candidates();

        buffer.append(remote("abc", Role::Broadcaster, "b1"));
        buffer.append(remote("abc", Role::Consumer, "c1"));

        assert_eq!(buffer.evict(&sid("abc")), 2);
        assert!(buffer.is_empty(&sid("abc")));
        assert!(buffer.drain_for(&sid("abc"), Role::Consumer).is_empty());
        assert_eq!(buffer.evict(&sid("unknown")), 0);
    }

    #[test]
    fn test_drain_unknown_stream_is_empty() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        assert!(registry
            .candidates()
            .drain_for(&sid("nothing"), Role::Consumer)
            .is_empty());
    }

    #[tokio::test]
    async fn test_append_fans_out() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        let mut rx = registry.notifier().subscribe(&sid("abc"));

        assert!(registry.candidates().append(remote("abc", Role::Broadcaster, "b1")));

        match &*rx.recv().await.unwrap() {
            RelayEvent::NewIceCandidate(r) => assert_eq!(r.candidate.candidate, "b1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_drain_matching_respects_interest() {
        let registry = StreamRegistry::new(DEFAULT_CANDIDATE_CAPACITY);
        let buffer = registry.candidates();

        buffer.append(remote("abc", Role::Broadcaster, "client"));
        buffer.append(CandidateRecord::local(
            sid("abc"),
            Role::Broadcaster,
            IceCandidate::new("engine"),
            "sess-b",
        ));

        let engine = buffer.drain_matching(&sid("abc"), &Interest::engine(Role::Consumer));
        assert_eq!(candidates(&engine), vec!["client"]);

        let client = buffer.drain_matching(&sid("abc"), &Interest::client(Role::Consumer, None));
        assert_eq!(candidates(&client), vec!["client", "engine"]);

        let own = buffer.drain_session(&sid("abc"), "sess-b");
        assert_eq!(candidates(&own), vec!["engine"]);
        assert!(buffer.drain_session(&sid("abc"), "sess-x").is_empty());
    }
}
