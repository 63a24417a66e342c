//! Signaling relay core
//!
//! - [`registry`]: stream id to broadcaster state, first writer wins
//! - [`buffer`]: per-stream candidate log replayed to late joiners
//! - [`notifier`]: per-stream push of new candidates and lifecycle changes
//! - [`coordinator`]: offer/answer orchestration and session lifetimes
//!
//! All per-stream state lives in one slot per stream id, guarded by its own
//! lock. Engine calls never run while a slot is locked.

pub mod buffer;
pub mod coordinator;
pub mod notifier;
pub mod registry;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
pub mod types;

pub use buffer::{CandidateBuffer, DEFAULT_CANDIDATE_CAPACITY};
pub use coordinator::{
    CoordinatorSettings, NegotiationCoordinator, PeerSession, SessionInfo, StreamStatus,
};
pub use notifier::{FanoutNotifier, Interest, RelayEvent, DEFAULT_NOTIFIER_CAPACITY};
pub use registry::{RegistryError, StreamRegistry, StreamSummary};
pub use types::{
    CandidateRecord, InvalidStreamId, Role, SessionId, StreamId, StreamRecord, StreamState,
    MAX_STREAM_ID_LEN,
};
