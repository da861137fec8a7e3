//! WebRTC peer connection wrapper for one browser (§4.6 step 2): codec
//! registration, RTCP PLI/FIR keyframe-request wiring, and a single peer
//! connection per Session. `TrackLocalStaticSample::write_sample`
//! packetizes H.264 into FU-A/STAP-A and Opus one-frame-per-RTP internally,
//! so the Session only supplies sample bytes and a duration.

use crate::error::CoreError;
use scrcpy_protocol::AudioCodecFamily;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A custom (non-RFC-registered) mime string for bridged AAC audio; no
/// widely deployed browser negotiates this, but the Source's `mp4`/`muxed`
/// modes are modeled as if a peer could (§4.6 names "Opus or AAC" audio
/// uniformly) — see the open-question note in DESIGN.md.
const MIME_TYPE_AAC: &str = "audio/MP4A-LATM";

#[derive(Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub audio_family: AudioCodecFamily,
}

pub struct WebRTCPeer {
    session_id: Uuid,
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_sender: Arc<RTCRtpSender>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl WebRTCPeer {
    pub async fn new(session_id: Uuid, config: &PeerConfig) -> Result<Self, CoreError> {
        let mut media_engine = MediaEngine::default();

        let h264_feedback = vec![
            RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
            RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
            RTCPFeedback { typ: "transport-cc".into(), parameter: "".into() },
        ];
        let h264_fmtp = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90_000,
                        channels: 0,
                        sdp_fmtp_line: h264_fmtp.to_string(),
                        rtcp_feedback: h264_feedback,
                    },
                    payload_type: 125,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| CoreError::ConfigError(format!("failed to register H.264 codec: {e}")))?;

        let (audio_mime, audio_clock_rate, audio_channels, audio_fmtp, audio_payload_type) =
            match config.audio_family {
                AudioCodecFamily::Opus => (MIME_TYPE_OPUS, 48_000u32, 2u16, "minptime=10;useinbandfec=1", 111),
                AudioCodecFamily::Aac => (MIME_TYPE_AAC, 44_100u32, 2u16, "", 110),
            };

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: audio_mime.to_string(),
                        clock_rate: audio_clock_rate,
                        channels: audio_channels,
                        sdp_fmtp_line: audio_fmtp.to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: audio_payload_type,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| CoreError::ConfigError(format!("failed to register audio codec: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CoreError::ConfigError(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = if config.ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }]
        } else {
            config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect()
        };

        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| CoreError::ConfigError(format!("failed to create peer connection: {e}")))?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                sdp_fmtp_line: h264_fmtp.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "scrcpy-connect".to_string(),
        ));

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: audio_mime.to_string(),
                clock_rate: audio_clock_rate,
                channels: audio_channels,
                ..Default::default()
            },
            "audio".to_string(),
            "scrcpy-connect".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CoreError::ConfigError(format!("failed to add video track: {e}")))?;

        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CoreError::ConfigError(format!("failed to add audio track: {e}")))?;

        let data_channel = Arc::new(Mutex::new(None));

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("peer connection disconnected"),
                _ => info!(?state, "peer connection state changed"),
            }
            Box::pin(async {})
        }));

        Ok(Self {
            session_id,
            peer_connection,
            video_track,
            audio_track,
            video_sender,
            data_channel,
        })
    }

    /// RTCP PLI/FIR from the browser should trigger a device keyframe request.
    pub fn start_rtcp_reader(&self, on_keyframe_request: impl Fn() + Send + Sync + 'static) {
        let sender = Arc::clone(&self.video_sender);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        on_keyframe_request();
                    }
                }
            }
        });
    }

    pub async fn handle_offer(&self, sdp: &str) -> Result<String, CoreError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| CoreError::SignallingError { session_id: self.session_id, message: e.to_string() })?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| CoreError::SignallingError { session_id: self.session_id, message: e.to_string() })?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| CoreError::SignallingError { session_id: self.session_id, message: e.to_string() })?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CoreError::SignallingError { session_id: self.session_id, message: e.to_string() })?;

        Ok(answer.sdp)
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), CoreError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| CoreError::SignallingError { session_id: self.session_id, message: e.to_string() })
    }

    /// `pts` is in microseconds; converted to a wall-clock `Duration` for the
    /// sample writer, which derives RTP timestamps from it internally.
    pub async fn write_video_sample(&self, data: Vec<u8>, duration: Duration) -> Result<(), CoreError> {
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(data),
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| CoreError::StreamAborted { stream_id: 0, message: e.to_string() })
    }

    pub async fn write_audio_sample(&self, data: Vec<u8>, duration: Duration) -> Result<(), CoreError> {
        self.audio_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(data),
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| CoreError::StreamAborted { stream_id: 1, message: e.to_string() })
    }

    pub fn on_ice_candidate(&self, callback: impl Fn(String, Option<String>, Option<u16>) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let cb = Arc::clone(&callback);
                        cb(json.candidate, json.sdp_mid, json.sdp_mline_index);
                    }
                    Err(e) => warn!(error = %e, "failed to serialize ICE candidate"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Wires the `control` DataChannel (§4.6 step 5): received text frames
    /// are handed to `callback` as raw JSON strings for the caller to parse
    /// into `ControlEvent`.
    pub fn on_control_message(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        let dc_storage = Arc::clone(&self.data_channel);

        self.peer_connection.on_data_channel(Box::new(move |dc| {
            let callback = Arc::clone(&callback);
            let dc_storage = Arc::clone(&dc_storage);
            Box::pin(async move {
                if dc.label() != "control" {
                    return;
                }
                info!("control data channel opened");
                {
                    let mut storage = dc_storage.lock().await;
                    *storage = Some(Arc::clone(&dc));
                }
                let cb = Arc::clone(&callback);
                dc.on_message(Box::new(move |msg| {
                    let cb = Arc::clone(&cb);
                    Box::pin(async move {
                        match String::from_utf8(msg.data.to_vec()) {
                            Ok(text) => cb(text),
                            Err(e) => debug!(error = %e, "non-utf8 control message"),
                        }
                    })
                }));
            })
        }));
    }

    pub async fn send_control_text(&self, msg: &str) -> Result<(), CoreError> {
        let dc = self.data_channel.lock().await;
        if let Some(ref dc) = *dc {
            dc.send_text(msg.to_string())
                .await
                .map_err(|e| CoreError::ConfigError(format!("data channel send failed: {e}")))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Connected
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub async fn close(&self) -> Result<(), CoreError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| CoreError::ConfigError(format!("failed to close peer connection: {e}")))?;
        Ok(())
    }
}

/// Translate `pts` microseconds into a packetizer `Duration`; callers supply
/// the delta between consecutive samples of the same stream, not an
/// absolute timestamp (the sample writer accumulates RTP timestamps from
/// successive `duration` values).
pub fn pts_delta_to_duration(delta_micros: u64) -> Duration {
    Duration::from_micros(delta_micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_delta_converts_microseconds_to_duration() {
        assert_eq!(pts_delta_to_duration(33_333), Duration::from_micros(33_333));
    }
}
