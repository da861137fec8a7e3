//! Per-device scrcpy Source (§4.3): owns the three device sockets, drives
//! the ADB bridge lifecycle, and normalizes video/audio/control traffic
//! into Pipeline publications. Reader-task layout and shutdown-via-watch-
//! channel follow a multi-task `tokio::select!` supervision style; the
//! three independent socket readers mirror the separate video/audio
//! reader tasks of a reference scrcpy network client.

use crate::adb::{AdbBridge, ServerProcess, SpawnOptions};
use crate::error::{AdbError, CoreError};
use crate::pipeline::Pipeline;
use scrcpy_protocol::{
    AudioCodec, ControlMessage, StreamingMode, CONTROL_TYPE_RESET_VIDEO, decode_audio_frame,
    decode_device_meta, decode_video_frame, encode_control_message,
};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct SourceSockets {
    video: TcpStream,
    audio: TcpStream,
    control: TcpStream,
}

/// Owns one scrcpy session against one device (§3 `Source`).
pub struct Source {
    pub serial: String,
    mode: RwLock<StreamingMode>,
    pipeline: Arc<Pipeline>,
    state: RwLock<SourceState>,
    dimensions: RwLock<(u32, u32)>,
    audio_codec: RwLock<Option<AudioCodec>>,
    control_tx: Mutex<Option<mpsc::Sender<ControlMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    bridge: Mutex<Option<Arc<AdbBridge>>>,
    server_process: Mutex<Option<ServerProcess>>,
    subscriber_counter: AtomicU64,
    next_scid: AtomicU32,
    video_buffer_size: usize,
    audio_buffer_size: usize,
}

impl Source {
    pub fn new(serial: impl Into<String>, mode: StreamingMode, pipeline: Arc<Pipeline>, video_buffer_size: usize, audio_buffer_size: usize) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            serial: serial.into(),
            mode: RwLock::new(mode),
            pipeline,
            state: RwLock::new(SourceState::Idle),
            dimensions: RwLock::new((0, 0)),
            audio_codec: RwLock::new(None),
            control_tx: Mutex::new(None),
            shutdown_tx,
            bridge: Mutex::new(None),
            server_process: Mutex::new(None),
            subscriber_counter: AtomicU64::new(0),
            next_scid: AtomicU32::new(1),
            video_buffer_size,
            audio_buffer_size,
        })
    }

    pub async fn state(&self) -> SourceState {
        *self.state.read().await
    }

    pub async fn mode(&self) -> StreamingMode {
        *self.mode.read().await
    }

    /// Update the mode tag in place without restarting the Source
    /// (Registry same-audio-family path, §4.5).
    pub async fn set_mode(&self, mode: StreamingMode) {
        *self.mode.write().await = mode;
    }

    pub async fn dimensions(&self) -> (u32, u32) {
        *self.dimensions.read().await
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn video_buffer_size(&self) -> usize {
        self.video_buffer_size
    }

    pub fn audio_buffer_size(&self) -> usize {
        self.audio_buffer_size
    }

    pub fn next_subscriber_id(&self) -> u64 {
        self.subscriber_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Idempotent while already running: returns immediately if this Source
    /// has already reached `Running` (§4.3).
    pub async fn start(
        self: &Arc<Self>,
        bridge: Arc<AdbBridge>,
        local_ports: (u16, u16, u16),
    ) -> Result<(), CoreError> {
        {
            let state = self.state.read().await;
            if *state == SourceState::Running {
                return Ok(());
            }
        }
        *self.state.write().await = SourceState::Starting;
        info!(serial = %self.serial, "starting source");

        let scid = format!("{:08x}", self.next_scid.fetch_add(1, Ordering::Relaxed));
        let mode = self.mode().await;
        let (video_codec, audio_codec_name) = match mode.audio_codec_family() {
            scrcpy_protocol::AudioCodecFamily::Aac => ("h264", "aac"),
            scrcpy_protocol::AudioCodecFamily::Opus => ("h264", "opus"),
        };

        let (local_video, local_audio, local_control) = local_ports;
        let setup = async {
            bridge
                .forward(&self.serial, local_video, &format!("scrcpy_{scid}"))
                .map_err(|e| self.unreachable(e))?;
            bridge
                .forward(&self.serial, local_audio, &format!("scrcpy_{scid}"))
                .map_err(|e| self.unreachable(e))?;
            bridge
                .forward(&self.serial, local_control, &format!("scrcpy_{scid}"))
                .map_err(|e| self.unreachable(e))?;
            Ok::<(), CoreError>(())
        };
        setup.await?;

        let opts = SpawnOptions {
            scid: scid.clone(),
            video_codec: video_codec.to_string(),
            audio_codec: audio_codec_name.to_string(),
            max_size: 0,
            bit_rate: 8_000_000,
            send_device_meta: true,
        };
        let process = bridge
            .spawn_server(&self.serial, &opts)
            .map_err(|e| self.unreachable(e))?;
        *self.server_process.lock().await = Some(process);
        *self.bridge.lock().await = Some(Arc::clone(&bridge));

        let video = TcpStream::connect(("127.0.0.1", local_video))
            .await
            .map_err(|e| self.unreachable(AdbError::ExecutionFailed(e.to_string())))?;
        let audio = TcpStream::connect(("127.0.0.1", local_audio))
            .await
            .map_err(|e| self.unreachable(AdbError::ExecutionFailed(e.to_string())))?;
        let control = TcpStream::connect(("127.0.0.1", local_control))
            .await
            .map_err(|e| self.unreachable(AdbError::ExecutionFailed(e.to_string())))?;

        let mut sockets = SourceSockets { video, audio, control };

        let meta = read_device_meta(&mut sockets.video)
            .await
            .map_err(|e| self.decode_error(e))?;
        {
            let mut dims = self.dimensions.write().await;
            *dims = (meta.width, meta.height);
        }
        info!(serial = %self.serial, device = %meta.name, width = meta.width, height = meta.height, "device meta received");

        let (control_tx, control_rx) = mpsc::channel::<ControlMessage>(64);
        *self.control_tx.lock().await = Some(control_tx);

        let (control_read_half, control_write_half) = sockets.control.into_split();
        let (video_stream, audio_stream) = (sockets.video, sockets.audio);

        spawn_control_writer(control_write_half, control_rx, self.shutdown_tx.subscribe());
        spawn_control_reader(control_read_half, self.shutdown_tx.subscribe(), self.serial.clone());
        spawn_video_reader(Arc::clone(self), video_stream, self.shutdown_tx.subscribe());
        spawn_audio_reader(Arc::clone(self), audio_stream, self.shutdown_tx.subscribe());

        *self.state.write().await = SourceState::Running;
        info!(serial = %self.serial, "source running");
        Ok(())
    }

    fn unreachable(&self, source: AdbError) -> CoreError {
        CoreError::DeviceUnreachable {
            serial: self.serial.clone(),
            source,
        }
    }

    fn decode_error(&self, source: scrcpy_protocol::CodecError) -> CoreError {
        CoreError::ProtocolDecodeError {
            serial: self.serial.clone(),
            source,
        }
    }

    /// Cancels all readers, closes sockets, terminates the device-side
    /// process, transitions to `Stopped`. Safe to call multiple times.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state == SourceState::Stopped || *state == SourceState::Stopping {
                return;
            }
            *state = SourceState::Stopping;
        }
        info!(serial = %self.serial, "stopping source");
        let _ = self.shutdown_tx.send(true);
        *self.control_tx.lock().await = None;

        if let Some(process) = self.server_process.lock().await.take() {
            match self.bridge.lock().await.take() {
                Some(bridge) => bridge.shutdown(process),
                None => drop(process),
            }
        }

        *self.state.write().await = SourceState::Stopped;
        info!(serial = %self.serial, "source stopped");
    }

    /// Serialized send to the device control socket (§4.3).
    pub async fn send_control(&self, msg: ControlMessage) -> Result<(), CoreError> {
        let guard = self.control_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| CoreError::ConfigError("source is not running".to_string())),
            None => Err(CoreError::ConfigError("source is not running".to_string())),
        }
    }

    /// Convenience: ask the device for a fresh keyframe (§4.3, used when a
    /// new subscriber joins mid-stream).
    pub async fn request_keyframe(&self) -> Result<(), CoreError> {
        self.send_control(ControlMessage {
            msg_type: CONTROL_TYPE_RESET_VIDEO,
            payload: Vec::new(),
        })
        .await
    }
}

async fn read_device_meta(stream: &mut TcpStream) -> Result<scrcpy_protocol::DeviceMeta, scrcpy_protocol::CodecError> {
    let mut buf = vec![0u8; scrcpy_protocol::DEVICE_META_PRELUDE_SIZE];
    stream.read_exact(&mut buf).await?;
    decode_device_meta(&mut Cursor::new(buf))
}

fn spawn_control_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<ControlMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let bytes = encode_control_message(&msg);
                    if let Err(e) = write_half.write_all(&bytes).await {
                        error!(error = %e, "control write failed");
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_control_reader(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
    serial: String,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => debug!(serial = %serial, bytes = n, "device control response (unparsed)"),
                        Err(e) => {
                            warn!(serial = %serial, error = %e, "control read error");
                            break;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_video_reader(source: Arc<Source>, mut stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            let header_result = tokio::select! {
                _ = shutdown.changed() => return,
                r = read_frame_bytes(&mut stream) => r,
            };

            let raw = match header_result {
                Ok(raw) => raw,
                Err(e) => {
                    error!(serial = %source.serial, error = %e, "video reader terminated");
                    source.stop().await;
                    return;
                }
            };

            let sample = match decode_video_frame(&mut Cursor::new(raw)) {
                Ok(s) => s,
                Err(e) => {
                    error!(serial = %source.serial, error = %e, "malformed video frame");
                    source.stop().await;
                    return;
                }
            };

            if sample.config {
                if let Some((sps, pps)) = split_sps_pps(&sample.data) {
                    source.pipeline.cache_sps_pps(sps, pps).await;
                }
            }
            source.pipeline.publish_video(sample).await;
        }
    });
}

fn spawn_audio_reader(source: Arc<Source>, mut stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let codec = tokio::select! {
            _ = shutdown.changed() => return,
            r = read_audio_codec_tag_async(&mut stream) => match r {
                Ok(c) => c,
                Err(e) => {
                    error!(serial = %source.serial, error = %e, "failed to read audio codec tag");
                    source.stop().await;
                    return;
                }
            },
        };
        *source.audio_codec.write().await = Some(codec);

        loop {
            let raw_result = tokio::select! {
                _ = shutdown.changed() => return,
                r = read_frame_bytes(&mut stream) => r,
            };

            let raw = match raw_result {
                Ok(raw) => raw,
                Err(e) => {
                    error!(serial = %source.serial, error = %e, "audio reader terminated");
                    source.stop().await;
                    return;
                }
            };

            match decode_audio_frame(&mut Cursor::new(raw), codec) {
                Ok(sample) => source.pipeline.publish_audio(sample).await,
                Err(e) => {
                    error!(serial = %source.serial, error = %e, "malformed audio frame");
                    source.stop().await;
                    return;
                }
            }
        }
    });
}

async fn read_audio_codec_tag_async(stream: &mut TcpStream) -> Result<AudioCodec, scrcpy_protocol::CodecError> {
    let mut tag = [0u8; 4];
    stream.read_exact(&mut tag).await?;
    AudioCodec::from_tag(&tag)
}

/// Read one 12-byte header + its payload from the socket, returning the raw
/// concatenated bytes for the synchronous codec decoder to parse.
async fn read_frame_bytes(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; scrcpy_protocol::VIDEO_AUDIO_HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;

    let mut raw = Vec::with_capacity(header.len() + payload.len());
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&payload);
    Ok(raw)
}

/// Split a config NAL buffer into its SPS and PPS Annex-B units for caching.
fn split_sps_pps(data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let nals = scrcpy_protocol::extract_nals(data);
    let mut sps = None;
    let mut pps = None;
    for nal in nals {
        match nal.first().map(|b| b & 0x1F) {
            Some(7) => sps = Some(annex_b_wrap(nal)),
            Some(8) => pps = Some(annex_b_wrap(nal)),
            _ => {}
        }
    }
    match (sps, pps) {
        (Some(s), Some(p)) => Some((s, p)),
        _ => None,
    }
}

fn annex_b_wrap(nal: &[u8]) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 1];
    out.extend_from_slice(nal);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_source_starts_idle() {
        let pipeline = Arc::new(Pipeline::new());
        let source = Source::new("emu-5554", StreamingMode::Webrtc, pipeline, 30, 60);
        assert_eq!(source.state().await, SourceState::Idle);
        assert_eq!(source.mode().await, StreamingMode::Webrtc);
    }

    #[tokio::test]
    async fn send_control_before_start_is_config_error() {
        let pipeline = Arc::new(Pipeline::new());
        let source = Source::new("emu-5554", StreamingMode::Webrtc, pipeline, 30, 60);
        let msg = ControlMessage { msg_type: 0, payload: vec![] };
        assert!(matches!(source.send_control(msg).await, Err(CoreError::ConfigError(_))));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_safe_no_op() {
        let pipeline = Arc::new(Pipeline::new());
        let source = Source::new("emu-5554", StreamingMode::Webrtc, pipeline, 30, 60);
        source.stop().await;
        source.stop().await;
        assert_eq!(source.state().await, SourceState::Stopped);
    }

    #[test]
    fn split_sps_pps_finds_both_units() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0xAA];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xBB]);
        let (sps, pps) = split_sps_pps(&data).unwrap();
        assert_eq!(sps, vec![0, 0, 0, 1, 0x67, 0xAA]);
        assert_eq!(pps, vec![0, 0, 0, 1, 0x68, 0xBB]);
    }
}
