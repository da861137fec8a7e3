//! Per-browser-peer WebRTC Session (§4.6) and the SessionManager that routes
//! signalling messages to the right one. Subscribe/forward/teardown read
//! from a `Pipeline` subscription rather than a local encoder channel.

pub mod peer;

use crate::control;
use crate::error::CoreError;
use crate::source::Source;
use peer::{pts_delta_to_duration, IceServerConfig, PeerConfig, WebRTCPeer};
use scrcpy_protocol::{ControlEvent, SignalingMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound signalling sink for one browser connection: the external
/// transport (§6, out of scope for this crate) owns the receiving half and
/// relays whatever arrives here over that connection's WebSocket.
pub type SignalOutboundSender = mpsc::Sender<SignalingMessage>;

/// One browser connection: its peer connection, Pipeline subscriptions, and
/// forwarding tasks. Dropping a Session's `shutdown` sender stops its tasks.
pub struct Session {
    pub id: Uuid,
    peer: Arc<WebRTCPeer>,
    source: Arc<Source>,
    shutdown_tx: watch::Sender<bool>,
    subscriber_id: RwLock<Option<u64>>,
}

impl Session {
    /// Creates the peer connection and wires RTCP keyframe requests, the
    /// control DataChannel, and outbound ICE candidates (trickled to
    /// `outbound_tx` as the local agent discovers them), but does not yet
    /// subscribe to the Pipeline — that happens in `negotiate` once the SDP
    /// answer is produced (§4.6 step 3: "on negotiation-complete,
    /// subscribe").
    pub async fn create(
        id: Uuid,
        source: Arc<Source>,
        ice_servers: Vec<IceServerConfig>,
        outbound_tx: SignalOutboundSender,
    ) -> Result<Arc<Self>, CoreError> {
        let mode = source.mode().await;
        let peer_config = PeerConfig {
            ice_servers,
            audio_family: mode.audio_codec_family(),
        };
        let peer = Arc::new(WebRTCPeer::new(id, &peer_config).await?);

        let keyframe_source = Arc::clone(&source);
        peer.start_rtcp_reader(move || {
            let source = Arc::clone(&keyframe_source);
            tokio::spawn(async move {
                if let Err(e) = source.request_keyframe().await {
                    warn!(error = %e, "failed to request keyframe after PLI/FIR");
                }
            });
        });

        let control_source = Arc::clone(&source);
        peer.on_control_message(move |text| {
            let source = Arc::clone(&control_source);
            tokio::spawn(async move {
                match serde_json::from_str::<ControlEvent>(&text) {
                    Ok(event) => {
                        if let Err(e) = control::dispatch(&source, &event).await {
                            warn!(error = %e, "control dispatch failed");
                        }
                    }
                    Err(e) => debug!(error = %e, raw = %text, "unrecognized control event"),
                }
            });
        });

        peer.on_ice_candidate(move |candidate, sdp_mid, sdp_mline_index| {
            let outbound_tx = outbound_tx.clone();
            tokio::spawn(async move {
                let msg = SignalingMessage::Candidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    session_id: id,
                };
                if outbound_tx.send(msg).await.is_err() {
                    debug!(session_id = %id, "outbound signalling sink closed, dropping ICE candidate");
                }
            });
        });

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id,
            peer,
            source,
            shutdown_tx,
            subscriber_id: RwLock::new(None),
        }))
    }

    /// Handles the SDP offer, starts the Pipeline subscription/forwarding
    /// tasks, and returns the answer SDP to send back over signalling.
    pub async fn negotiate(self: &Arc<Self>, sdp: &str) -> Result<String, CoreError> {
        let answer = self.peer.handle_offer(sdp).await?;
        self.start_forwarding().await;
        Ok(answer)
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), CoreError> {
        self.peer.add_ice_candidate(candidate, sdp_mid, sdp_mline_index).await
    }

    /// Subscribes to the Pipeline, primes the new subscriber with cached
    /// SPS/PPS, requests a fresh keyframe, and spawns one forwarding task per
    /// stream (§4.6 step 3-4).
    async fn start_forwarding(self: &Arc<Self>) {
        let pipeline = self.source.pipeline();
        let subscriber_id = self.source.next_subscriber_id();
        *self.subscriber_id.write().await = Some(subscriber_id);

        if let Some((sps, pps)) = pipeline.get_sps_pps().await {
            let mut primer = sps;
            primer.extend_from_slice(&pps);
            if let Err(e) = self.peer.write_video_sample(primer, std::time::Duration::ZERO).await {
                warn!(error = %e, "failed to write primed SPS/PPS sample");
            }
        }
        if let Err(e) = self.source.request_keyframe().await {
            warn!(error = %e, "failed to request initial keyframe");
        }

        let mut video_rx = pipeline.subscribe_video(subscriber_id, self.source.video_buffer_size()).await;
        let video_peer = Arc::clone(&self.peer);
        let mut video_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut last_pts: Option<u64> = None;
            loop {
                tokio::select! {
                    _ = video_shutdown.changed() => break,
                    sample = video_rx.recv() => {
                        let Some(sample) = sample else { break };
                        let delta = last_pts.map(|p| sample.pts.saturating_sub(p)).unwrap_or(0);
                        last_pts = Some(sample.pts);
                        if let Err(e) = video_peer.write_video_sample(sample.data, pts_delta_to_duration(delta)).await {
                            warn!(error = %e, "failed to write video sample");
                            break;
                        }
                    }
                }
            }
        });

        let mut audio_rx = pipeline.subscribe_audio(subscriber_id, self.source.audio_buffer_size()).await;
        let audio_peer = Arc::clone(&self.peer);
        let mut audio_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut last_pts: Option<u64> = None;
            loop {
                tokio::select! {
                    _ = audio_shutdown.changed() => break,
                    sample = audio_rx.recv() => {
                        let Some(sample) = sample else { break };
                        let delta = last_pts.map(|p| sample.pts.saturating_sub(p)).unwrap_or(0);
                        last_pts = Some(sample.pts);
                        if let Err(e) = audio_peer.write_audio_sample(sample.data, pts_delta_to_duration(delta)).await {
                            warn!(error = %e, "failed to write audio sample");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Unsubscribes from the Pipeline, stops forwarding tasks, closes the
    /// DataChannel and peer connection (§4.6 step 6). Safe to call more than
    /// once; only the first call has any effect.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(id) = self.subscriber_id.write().await.take() {
            let pipeline = self.source.pipeline();
            pipeline.unsubscribe_video(id).await;
            pipeline.unsubscribe_audio(id).await;
        }
        if let Err(e) = self.peer.close().await {
            warn!(error = %e, "failed to close peer connection");
        }
        info!(session_id = %self.id, "session closed");
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }
}

/// Tracks active Sessions and routes inbound signalling to the right one
/// (§4.6 step 1).
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    ice_servers: Vec<IceServerConfig>,
}

impl SessionManager {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ice_servers,
        }
    }

    /// Dispatches one signalling message, returning the immediate reply (if
    /// any) to send back over the outer WebSocket. `outbound_tx` is the
    /// sink for messages the Session emits asynchronously after the reply —
    /// trickled ICE candidates, chiefly — and is only consulted when `msg`
    /// creates a new Session (an `Offer`).
    pub async fn handle_signal(
        &self,
        msg: SignalingMessage,
        source_for_offer: impl FnOnce() -> Option<Arc<Source>>,
        outbound_tx: SignalOutboundSender,
    ) -> Option<SignalingMessage> {
        match msg {
            SignalingMessage::Offer { sdp, session_id } => {
                let Some(source) = source_for_offer() else {
                    return Some(SignalingMessage::Error {
                        code: "no_such_device".to_string(),
                        message: "requested device has no running source".to_string(),
                        session_id,
                    });
                };
                match Session::create(session_id, source, self.ice_servers.clone(), outbound_tx).await {
                    Ok(session) => match session.negotiate(&sdp).await {
                        Ok(answer) => {
                            self.sessions.write().await.insert(session_id, session);
                            Some(SignalingMessage::Answer { sdp: answer, session_id })
                        }
                        Err(e) => Some(SignalingMessage::Error {
                            code: "negotiation_failed".to_string(),
                            message: e.to_string(),
                            session_id,
                        }),
                    },
                    Err(e) => Some(SignalingMessage::Error {
                        code: "session_create_failed".to_string(),
                        message: e.to_string(),
                        session_id,
                    }),
                }
            }
            SignalingMessage::Candidate { candidate, sdp_mid, sdp_mline_index, session_id } => {
                let session = self.sessions.read().await.get(&session_id).cloned();
                if let Some(session) = session {
                    if let Err(e) = session
                        .add_ice_candidate(&candidate, sdp_mid.as_deref(), sdp_mline_index)
                        .await
                    {
                        return Some(SignalingMessage::Error {
                            code: "ice_candidate_failed".to_string(),
                            message: e.to_string(),
                            session_id,
                        });
                    }
                }
                None
            }
            SignalingMessage::Bye { session_id } => {
                self.remove(session_id).await;
                None
            }
            SignalingMessage::Answer { session_id, .. } => {
                debug!(%session_id, "unexpected answer from browser, ignoring");
                None
            }
            SignalingMessage::Error { session_id, message, .. } => {
                warn!(%session_id, %message, "received error from browser, tearing down session");
                self.remove(session_id).await;
                None
            }
        }
    }

    pub async fn remove(&self, session_id: Uuid) {
        let removed = self.sessions.write().await.remove(&session_id);
        if let Some(session) = removed {
            session.close().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
