use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigStore, StreamMode};
use crate::error::{AppError, Result};
use crate::relay::{NegotiationCoordinator, StreamId};

/// Application-wide state shared across handlers
///
/// All signaling goes through `coordinator`; the stream registry, candidate
/// buffer and notifier are reached via `coordinator.registry()`.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Negotiation coordinator owning the relay state
    pub coordinator: Arc<NegotiationCoordinator>,
    /// Cancelled once on shutdown; long-lived connections watch it
    pub shutdown: CancellationToken,
    started_at: std::time::Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        coordinator: Arc<NegotiationCoordinator>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
            shutdown,
            started_at: std::time::Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Resolve the stream a request addresses
    ///
    /// In single mode an omitted id means the configured default stream; in
    /// multi mode every request must name one.
    pub fn resolve_stream(&self, raw: Option<&str>) -> Result<StreamId> {
        let config = self.config.get();
        resolve_stream_id(&config, raw)
    }
}

pub(crate) fn resolve_stream_id(config: &AppConfig, raw: Option<&str>) -> Result<StreamId> {
    let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => match config.relay.mode {
            StreamMode::Single => config.relay.default_stream_id.as_str(),
            StreamMode::Multi => {
                return Err(AppError::MalformedRequest(
                    "stream id is required in multi-stream mode".to_string(),
                ))
            }
        },
    };

    StreamId::parse(raw).map_err(|e| AppError::MalformedRequest(e.to_string()))
}
