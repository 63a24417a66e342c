//! WebSocket push channel
//!
//! Endpoint `/ws`:
//! - `subscribe` attaches the connection to one stream as a given role and
//!   replays the buffered candidates that role should see
//! - relay events of that stream (`new-ice-candidate`, `stream-live`,
//!   `stream-ended`) are pushed as they happen
//! - `ice-candidate` submits a candidate like `POST /ice-candidate`
//! - heartbeat ping every 30 seconds

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::StreamMode;
use crate::error::{AppError, Result};
use crate::relay::{Interest, RelayEvent, Role, SessionId, StreamId};
use crate::state::AppState;
use crate::webrtc::IceCandidate;

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
enum ClientMessage {
    /// Follow one stream as `role`
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        stream_id: Option<String>,
        role: Role,
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    /// Stop following the current stream
    Unsubscribe,

    /// Submit a candidate
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default)]
        stream_id: Option<String>,
        #[serde(default)]
        role: Option<Role>,
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    /// Ping (keep-alive)
    Ping,
}

/// Server-to-client control message
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Subscribed {
        stream_id: StreamId,
        role: Role,
        replayed: usize,
    },
    Pong,
    Error { message: String },
}

/// Active stream subscription of one connection
struct Subscription {
    stream_id: StreamId,
    interest: Interest,
    rx: broadcast::Receiver<Arc<RelayEvent>>,
}

/// What woke the connection loop
enum Wake {
    Client(Option<std::result::Result<Message, axum::Error>>),
    Event(std::result::Result<Arc<RelayEvent>, broadcast::error::RecvError>),
    Heartbeat,
    Shutdown,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription: Option<Subscription> = None;

    info!("WebSocket client connected");

    // Heartbeat interval (30 seconds)
    let mut heartbeat_interval = tokio::time::interval(tokio::time::Duration::from_secs(30));

    loop {
        let wake = tokio::select! {
            msg = receiver.next() => Wake::Client(msg),
            event = next_event(&mut subscription) => Wake::Event(event),
            _ = heartbeat_interval.tick() => Wake::Heartbeat,
            _ = state.shutdown.cancelled() => Wake::Shutdown,
        };

        let outgoing = match wake {
            Wake::Client(Some(Ok(Message::Text(text)))) => {
                match handle_client_message(&state, &text, &mut subscription).await {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("Failed to handle client message: {}", e);
                        vec![control(&ServerMessage::Error {
                            message: e.to_string(),
                        })]
                    }
                }
            }
            Wake::Client(Some(Ok(Message::Close(_)))) | Wake::Client(None) => {
                info!("WebSocket client disconnected");
                break;
            }
            Wake::Client(Some(Err(e))) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
            // Ping/pong frames are answered by the transport
            Wake::Client(Some(Ok(_))) => continue,
            Wake::Event(Ok(event)) => match &subscription {
                Some(sub) if should_send_event(&event, &sub.interest) => {
                    vec![serialize_event(&event)]
                }
                _ => continue,
            },
            Wake::Event(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!("WebSocket client lagged by {} events", n);
                lag_recovery(&state, subscription.as_ref(), n)
            }
            Wake::Event(Err(broadcast::error::RecvError::Closed)) => {
                subscription = None;
                continue;
            }
            Wake::Heartbeat => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
                continue;
            }
            Wake::Shutdown => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        };

        let mut failed = false;
        for frame in outgoing {
            if sender.send(Message::Text(frame)).await.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            // Delivery to a departed subscriber is not an error
            debug!("Failed to send to client, disconnecting");
            break;
        }
    }

    info!("WebSocket handler exiting");
}

/// Next event of the current subscription; pends forever without one
async fn next_event(
    subscription: &mut Option<Subscription>,
) -> std::result::Result<Arc<RelayEvent>, broadcast::error::RecvError> {
    match subscription {
        Some(sub) => sub.rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle message from client, returning frames to send back
async fn handle_client_message(
    state: &Arc<AppState>,
    text: &str,
    subscription: &mut Option<Subscription>,
) -> Result<Vec<String>> {
    let msg: ClientMessage = serde_json::from_str(text)
        .map_err(|e| AppError::MalformedRequest(format!("invalid message: {}", e)))?;

    match msg {
        ClientMessage::Subscribe {
            stream_id,
            role,
            session_id,
        } => {
            let stream_id = state.resolve_stream(stream_id.as_deref())?;
            let registry = state.coordinator.registry();

            // Subscribe before replaying so nothing falls in between
            let sub = Subscription {
                rx: registry.notifier().subscribe(&stream_id),
                interest: Interest::client(role, session_id),
                stream_id: stream_id.clone(),
            };

            let mut frames: Vec<String> = replay(state, &sub).iter().map(serialize_event).collect();
            let replayed = frames.len();
            if registry.lookup(&stream_id).is_ok() {
                frames.push(serialize_event(&RelayEvent::StreamLive {
                    stream_id: stream_id.clone(),
                }));
            }
            frames.insert(
                0,
                control(&ServerMessage::Subscribed {
                    stream_id: stream_id.clone(),
                    role,
                    replayed,
                }),
            );

            info!(stream = %stream_id, role = %role, replayed, "Client subscribed");
            *subscription = Some(sub);
            Ok(frames)
        }
        ClientMessage::Unsubscribe => {
            if let Some(sub) = subscription.take() {
                info!(stream = %sub.stream_id, "Client unsubscribed");
            }
            Ok(vec![])
        }
        ClientMessage::IceCandidate {
            candidate,
            stream_id,
            role,
            session_id,
        } => {
            if let Some(session_id) = session_id.as_deref() {
                if state.coordinator.session(session_id).is_some() {
                    state
                        .coordinator
                        .submit_candidate(session_id, candidate)
                        .await?;
                    return Ok(vec![]);
                }
                // Nowhere else to deliver it
                if stream_id.is_none()
                    && subscription.is_none()
                    && state.config.get().relay.mode == StreamMode::Multi
                {
                    return Err(AppError::NoSuchSession(session_id.to_string()));
                }
            }

            let current = subscription.as_ref();
            let stream_id = match (stream_id.as_deref(), current) {
                (Some(raw), _) => state.resolve_stream(Some(raw))?,
                (None, Some(sub)) => sub.stream_id.clone(),
                (None, None) => state.resolve_stream(None)?,
            };
            let role = role
                .or_else(|| current.map(|sub| sub.interest.role))
                .ok_or_else(|| AppError::MalformedRequest("candidate role is required".to_string()))?;

            state.coordinator.relay_candidate(&stream_id, role, candidate);
            Ok(vec![])
        }
        ClientMessage::Ping => {
            debug!("Received ping from client");
            Ok(vec![control(&ServerMessage::Pong)])
        }
    }
}

/// Frames sent after the subscriber missed `skipped` events
///
/// The buffer holds everything still relevant, so the whole matching backlog
/// is sent again.
fn lag_recovery(state: &AppState, subscription: Option<&Subscription>, skipped: u64) -> Vec<String> {
    let mut frames = vec![control(&ServerMessage::Error {
        message: format!("Lagged by {} events", skipped),
    })];
    if let Some(sub) = subscription {
        frames.extend(replay(state, sub).iter().map(serialize_event));
    }
    frames
}

/// Buffered candidates the subscription should have seen
fn replay(state: &AppState, sub: &Subscription) -> Vec<RelayEvent> {
    state
        .coordinator
        .registry()
        .candidates()
        .drain_matching(&sub.stream_id, &sub.interest)
        .into_iter()
        .map(RelayEvent::NewIceCandidate)
        .collect()
}

/// Check if an event should be sent to a subscriber
fn should_send_event(event: &RelayEvent, interest: &Interest) -> bool {
    match event {
        RelayEvent::NewIceCandidate(record) => interest.accepts(record),
        RelayEvent::StreamLive { .. } | RelayEvent::StreamEnded { .. } => true,
    }
}

/// Serialize event to JSON string
fn serialize_event(event: &RelayEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| error_frame(&e))
}

fn control(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| error_frame(&e))
}

fn error_frame(e: &serde_json::Error) -> String {
    format!(
        r#"{{"type":"error","payload":{{"message":"serialization failed: {}"}}}}"#,
        e.to_string().replace('"', "'")
    )
}
