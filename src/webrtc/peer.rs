//! webrtc-rs engine
//!
//! Each relay session owns one `RTCPeerConnection`. A broadcaster session
//! publishes its incoming tracks through per-kind RTP channels; a consumer
//! session attaches local tracks that forward packets from those channels.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::config::{default_mdns_host_name, MdnsMode};
use super::engine::{
    Engine, EngineError, EngineEvent, EngineSession, MediaHandle, NewSession, SessionSpec,
};
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::relay::Role;

/// RTP packets buffered per published track
const RTP_CHANNEL_CAPACITY: usize = 512;

/// Keyframe request interval towards the broadcaster
const PLI_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

/// Engine backed by webrtc-rs peer connections
pub struct RtcEngine {
    mdns_mode: MdnsMode,
}

impl RtcEngine {
    pub fn new(mdns_mode: MdnsMode) -> Self {
        Self { mdns_mode }
    }
}

#[async_trait]
impl Engine for RtcEngine {
    async fn create_session(&self, spec: &SessionSpec) -> Result<NewSession, EngineError> {
        // Create media engine
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::CreateSession(format!("register codecs: {}", e)))?;

        // Create interceptor registry
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::CreateSession(format!("register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        let mode: MulticastDnsMode = self.mdns_mode.into();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(default_mdns_host_name(&spec.session_id));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = spec
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| EngineError::CreateSession(e.to_string()))?;
        let pc = Arc::new(pc);

        let media = match spec.role {
            Role::Broadcaster => Some(Arc::new(RtcMedia::new(Arc::downgrade(&pc)))),
            Role::Consumer => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = RtcSession {
            session_id: spec.session_id.clone(),
            pc,
            media,
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_answer: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        session.setup_event_handlers(events_tx);

        debug!(
            session_id = %spec.session_id,
            role = %spec.role,
            mdns = self.mdns_mode.label(),
            "Engine session created"
        );

        Ok(NewSession {
            handle: Arc::new(session),
            events: events_rx,
        })
    }
}

/// One published track: negotiated codec plus an RTP fan-out channel
struct PublishedTrack {
    codec: Mutex<Option<RTCRtpCodecCapability>>,
    tx: broadcast::Sender<Packet>,
}

impl PublishedTrack {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(RTP_CHANNEL_CAPACITY);
        Self {
            codec: Mutex::new(None),
            tx,
        }
    }
}

/// Media published by a broadcaster session
pub struct RtcMedia {
    video: PublishedTrack,
    audio: PublishedTrack,
    video_ssrc: AtomicU32,
    publisher: Weak<RTCPeerConnection>,
}

impl RtcMedia {
    fn new(publisher: Weak<RTCPeerConnection>) -> Self {
        Self {
            video: PublishedTrack::new(),
            audio: PublishedTrack::new(),
            video_ssrc: AtomicU32::new(0),
            publisher,
        }
    }

    fn track(&self, kind: RTPCodecType) -> &PublishedTrack {
        if kind == RTPCodecType::Video {
            &self.video
        } else {
            &self.audio
        }
    }

    /// Codec to advertise to consumers, falling back to the defaults
    fn codec_for(&self, kind: RTPCodecType) -> RTCRtpCodecCapability {
        let fallback = if kind == RTPCodecType::Video {
            MIME_TYPE_VP8
        } else {
            MIME_TYPE_OPUS
        };
        self.track(kind).codec.lock().clone().unwrap_or_else(|| RTCRtpCodecCapability {
            mime_type: fallback.to_string(),
            ..Default::default()
        })
    }

    async fn request_keyframe(&self) -> bool {
        let ssrc = self.video_ssrc.load(Ordering::Relaxed);
        let Some(pc) = self.publisher.upgrade() else {
            return false;
        };
        if ssrc == 0 {
            return true;
        }
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
            debug!("PLI send failed: {}", e);
        }
        true
    }
}

/// Peer connection wrapper implementing the engine session contract
pub struct RtcSession {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    media: Option<Arc<RtcMedia>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    last_answer: Mutex<Option<RTCSessionDescription>>,
    /// Stops RTP forwarding and keyframe tasks
    cancel: CancellationToken,
}

impl RtcSession {
    fn setup_event_handlers(&self, events: mpsc::UnboundedSender<EngineEvent>) {
        let session_id = self.session_id.clone();
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = state_events.clone();
                let session_id = session_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!("Peer {} connection state: {}", session_id, new_state);
                    let _ = events.send(EngineEvent::StateChanged(new_state));
                })
            }));

        let candidate_events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = candidate_events.clone();

                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate: {}", init.candidate);
                            let _ = events.send(EngineEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let Some(media) = self.media.clone() else {
            return;
        };
        let cancel = self.cancel.clone();
        let session_id = self.session_id.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let media = media.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            let session_id = session_id.clone();

            Box::pin(async move {
                let kind = track.kind();
                info!(
                    session_id = %session_id,
                    kind = %kind,
                    ssrc = track.ssrc(),
                    "Broadcaster track received"
                );

                *media.track(kind).codec.lock() = Some(track.codec().capability.clone());
                if kind == RTPCodecType::Video {
                    media.video_ssrc.store(track.ssrc(), Ordering::Relaxed);
                    spawn_keyframe_requests(media.clone(), cancel.clone());
                }
                let _ = events.send(EngineEvent::Track {
                    kind: kind.to_string(),
                });

                let tx = media.track(kind).tx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = track.read_rtp() => match result {
                                Ok((pkt, _)) => {
                                    let _ = tx.send(pkt);
                                }
                                Err(e) => {
                                    debug!("RTP read ended ({}): {}", kind, e);
                                    break;
                                }
                            }
                        }
                    }
                });
            })
        }));
    }

    async fn attach_track(&self, media: &RtcMedia, kind: RTPCodecType) -> Result<(), EngineError> {
        let label = if kind == RTPCodecType::Video { "video" } else { "audio" };
        let track = Arc::new(TrackLocalStaticRTP::new(
            media.codec_for(kind),
            label.to_string(),
            "beacon-relay".to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::AttachMedia(format!("add {} track: {}", label, e)))?;

        // Drain RTCP so interceptors keep running
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = sender.read(&mut buf) => if result.is_err() { break },
                }
            }
        });

        let mut rx = media.track(kind).tx.subscribe();
        let cancel = self.cancel.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(pkt) => {
                            if let Err(e) = track.write_rtp(&pkt).await {
                                debug!("{} {} write_rtp ended: {}", session_id, label, e);
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{} {} forwarder lagged, skipped {} packets", session_id, label, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(())
    }
}

fn spawn_keyframe_requests(media: Arc<RtcMedia>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PLI_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !media.request_keyframe().await {
                        break;
                    }
                }
            }
        }
    });
}

#[async_trait]
impl EngineSession for RtcSession {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let sdp = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(EngineError::RemoteDescription(
                    "rollback is not supported".to_string(),
                ))
            }
        }
        .map_err(|e| EngineError::RemoteDescription(format!("invalid SDP: {}", e)))?;

        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| EngineError::RemoteDescription(e.to_string()))?;

        self.remote_set.store(true, Ordering::Release);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::CreateAnswer(e.to_string()))?;

        let desc = SessionDescription::answer(answer.sdp.clone());
        *self.last_answer.lock() = Some(answer);
        Ok(desc)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let cached = self
            .last_answer
            .lock()
            .take()
            .filter(|answer| answer.sdp == desc.sdp);

        let local = match cached {
            Some(answer) => answer,
            None => RTCSessionDescription::answer(desc.sdp)
                .map_err(|e| EngineError::LocalDescription(format!("invalid SDP: {}", e)))?,
        };

        self.pc
            .set_local_description(local)
            .await
            .map_err(|e| EngineError::LocalDescription(e.to_string()))
    }

    fn published_media(&self) -> Option<MediaHandle> {
        self.media.clone().map(MediaHandle::new)
    }

    async fn attach_media(&self, media: &MediaHandle) -> Result<(), EngineError> {
        let media = media
            .downcast::<RtcMedia>()
            .ok_or_else(|| EngineError::AttachMedia("media from a different engine".to_string()))?;

        self.attach_track(&media, RTPCodecType::Video).await?;
        self.attach_track(&media, RTPCodecType::Audio).await?;

        // Give the new viewer a keyframe quickly
        media.request_keyframe().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::AddCandidate(e.to_string()))
    }

    fn accepts_candidates(&self) -> bool {
        self.remote_set.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        self.pc
            .close()
            .await
            .map_err(|e| EngineError::Close(e.to_string()))
    }
}
