//! Fan-out notifier
//!
//! Per-stream publish/subscribe channel that pushes newly appended candidates
//! and stream lifecycle changes to every interested party of the same stream.
//!
//! Each stream gets its own `tokio::sync::broadcast` channel, so a subscriber
//! can never observe another stream's traffic. Delivery is best-effort: a
//! subscriber that falls behind receives `Lagged` and is expected to recover
//! from the candidate buffer. The buffer, not this channel, is the source of
//! truth for replay.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::types::{CandidateRecord, Role, SessionId, StreamId};

/// Default per-stream channel capacity (ring buffer size)
pub const DEFAULT_NOTIFIER_CAPACITY: usize = 256;

/// Event pushed to the subscribers of one stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// A candidate was appended to the stream's buffer
    NewIceCandidate(CandidateRecord),
    /// A broadcaster published the stream
    StreamLive {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
    },
    /// The broadcaster session ended
    StreamEnded {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
    },
}

/// Which candidates a subscriber wants to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    /// Role of the subscriber; candidates of the opposite role are delivered
    pub role: Role,
    /// Also deliver candidates discovered by this relay session
    pub session_id: Option<SessionId>,
    /// Skip candidates discovered by relay engine sessions
    pub remote_only: bool,
}

impl Interest {
    /// Interest of a relay engine session: client-submitted, opposite-role candidates
    pub fn engine(role: Role) -> Self {
        Self {
            role,
            session_id: None,
            remote_only: true,
        }
    }

    /// Interest of a push-channel client
    pub fn client(role: Role, session_id: Option<SessionId>) -> Self {
        Self {
            role,
            session_id,
            remote_only: false,
        }
    }

    pub fn accepts(&self, record: &CandidateRecord) -> bool {
        if let (Some(own), Some(origin)) = (&self.session_id, &record.origin_session) {
            if own == origin {
                return true;
            }
        }
        record.role == self.role.opposite() && (!self.remote_only || record.is_remote())
    }
}

/// Per-stream broadcast channels
pub struct FanoutNotifier {
    channels: Mutex<HashMap<StreamId, broadcast::Sender<Arc<RelayEvent>>>>,
    capacity: usize,
}

impl FanoutNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a stream's events
    ///
    /// The channel is created on first subscription, so subscribing before the
    /// stream exists is allowed (a consumer client may wait for `stream-live`).
    pub fn subscribe(&self, stream_id: &StreamId) -> broadcast::Receiver<Arc<RelayEvent>> {
        let mut channels = self.channels.lock();
        channels
            .entry(stream_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to every current subscriber of the stream
    ///
    /// Returns the number of subscribers reached. No subscribers is not an
    /// error; the event is dropped.
    pub fn publish(&self, stream_id: &StreamId, event: RelayEvent) -> usize {
        let channels = self.channels.lock();
        match channels.get(stream_id) {
            Some(tx) => {
                let reached = tx.send(Arc::new(event)).unwrap_or(0);
                trace!(stream = %stream_id, reached, "Relay event published");
                reached
            }
            None => 0,
        }
    }

    /// Number of live subscribers for a stream
    pub fn subscriber_count(&self, stream_id: &StreamId) -> usize {
        self.channels
            .lock()
            .get(stream_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to; returns how many were removed
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let removed = before - channels.len();
        if removed > 0 {
            debug!(removed, "Pruned idle notifier channels");
        }
        removed
    }
}

impl Default for FanoutNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFIER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::IceCandidate;

    fn sid(s: &str) -> StreamId {
        StreamId::parse(s).unwrap()
    }

    fn candidate_event(stream: &str, role: Role, c: &str) -> RelayEvent {
        RelayEvent::NewIceCandidate(CandidateRecord::remote(
            sid(stream),
            role,
            IceCandidate::new(c),
        ))
    }

    #[tokio::test]
    async fn test_publish_reaches_same_stream_only() {
        let notifier = FanoutNotifier::default();
        let mut abc = notifier.subscribe(&sid("abc"));
        let mut xyz = notifier.subscribe(&sid("xyz"));

        assert_eq!(
            notifier.publish(&sid("abc"), candidate_event("abc", Role::Broadcaster, "c1")),
            1
        );

        let event = abc.recv().await.unwrap();
        assert!(matches!(&*event, RelayEvent::NewIceCandidate(r) if r.stream_id == sid("abc")));
        assert!(xyz.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_preserves_publish_order() {
        let notifier = FanoutNotifier::default();
        let mut rx = notifier.subscribe(&sid("abc"));

        for i in 0..10 {
            notifier.publish(
                &sid("abc"),
                candidate_event("abc", Role::Broadcaster, &format!("c{i}")),
            );
        }

        for i in 0..10 {
            match &*rx.recv().await.unwrap() {
                RelayEvent::NewIceCandidate(r) => assert_eq!(r.candidate.candidate, format!("c{i}")),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_no_subscribers() {
        let notifier = FanoutNotifier::default();
        assert_eq!(notifier.subscriber_count(&sid("abc")), 0);
        assert_eq!(
            notifier.publish(&sid("abc"), RelayEvent::StreamLive { stream_id: sid("abc") }),
            0
        );
    }

    #[test]
    fn test_prune_drops_abandoned_channels() {
        let notifier = FanoutNotifier::default();
        let rx = notifier.subscribe(&sid("abc"));
        let _keep = notifier.subscribe(&sid("xyz"));
        drop(rx);

        assert_eq!(notifier.prune(), 1);
        assert_eq!(notifier.subscriber_count(&sid("xyz")), 1);
    }

    #[test]
    fn test_interest_filtering() {
        let remote_b = CandidateRecord::remote(sid("s"), Role::Broadcaster, IceCandidate::new("a"));
        let local_b = CandidateRecord::local(sid("s"), Role::Broadcaster, IceCandidate::new("b"), "sess-1");
        let remote_c = CandidateRecord::remote(sid("s"), Role::Consumer, IceCandidate::new("c"));

        let engine = Interest::engine(Role::Consumer);
        assert!(engine.accepts(&remote_b));
        assert!(!engine.accepts(&local_b));
        assert!(!engine.accepts(&remote_c));

        let client = Interest::client(Role::Consumer, None);
        assert!(client.accepts(&remote_b));
        assert!(client.accepts(&local_b));
        assert!(!client.accepts(&remote_c));

        let own = Interest::client(Role::Broadcaster, Some("sess-1".to_string()));
        assert!(own.accepts(&local_b));
        assert!(own.accepts(&remote_c));
        assert!(!own.accepts(&remote_b));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(candidate_event("abc", Role::Broadcaster, "c1")).unwrap();
        assert_eq!(json["type"], "new-ice-candidate");
        assert_eq!(json["payload"]["streamId"], "abc");
        assert_eq!(json["payload"]["role"], "broadcaster");
        assert_eq!(json["payload"]["candidate"]["candidate"], "c1");

        let json = serde_json::to_value(RelayEvent::StreamEnded { stream_id: sid("abc") }).unwrap();
        assert_eq!(json["type"], "stream-ended");
        assert_eq!(json["payload"]["streamId"], "abc");
    }
}
