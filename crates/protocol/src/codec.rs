//! Framed wire formats for the scrcpy device protocol.
//!
//! Video/audio frame header (12 bytes, big-endian):
//! ```text
//! [0..8]  pts: u64 — top bit = config flag, 2nd-top bit = keyframe flag,
//!                    remaining 62 bits = microsecond timestamp
//! [8..12] length: u32 — size of the payload that follows
//! [12..]  payload (H.264 Annex B for video; codec-specific for audio)
//! ```
//!
//! Device-meta prelude (video socket, once, before the first frame):
//! ```text
//! [0..64]  device name, NUL-padded ASCII
//! [64..68] codec id, 4-byte ASCII tag ("h264", "h265", ...)
//! [68..72] width: u32
//! [72..76] height: u32
//! ```
//!
//! Control message frame (device-bound): `type (1) || payload`.

use std::io::{self, Read, Write};

pub const VIDEO_AUDIO_HEADER_SIZE: usize = 12;
pub const DEVICE_META_NAME_SIZE: usize = 64;
pub const DEVICE_META_PRELUDE_SIZE: usize = DEVICE_META_NAME_SIZE + 4 + 4 + 4;

const PTS_CONFIG_BIT: u64 = 1 << 63;
const PTS_KEYFRAME_BIT: u64 = 1 << 62;
const PTS_VALUE_MASK: u64 = !(PTS_CONFIG_BIT | PTS_KEYFRAME_BIT);

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("short read: needed {needed} bytes, got {got}")]
    ErrShortRead { needed: usize, got: usize },
    #[error("bad header: {0}")]
    ErrBadHeader(String),
    #[error("unknown audio codec tag: {0:?}")]
    ErrUnknownCodec([u8; 4]),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// H.264 Sequence/Picture Parameter Set or IDR classification, payload in Annex B.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSample {
    pub data: Vec<u8>,
    /// Microseconds, device clock.
    pub pts: u64,
    pub keyframe: bool,
    /// Marks this sample as an SPS/PPS parameter set rather than picture data.
    pub config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    Aac,
    Pcm,
    Raw,
}

impl AudioCodec {
    pub fn from_tag(tag: &[u8; 4]) -> Result<Self, CodecError> {
        match tag {
            b"opus" => Ok(Self::Opus),
            b"aac " => Ok(Self::Aac),
            b"raw " => Ok(Self::Raw),
            b"pcm " => Ok(Self::Pcm),
            other => Err(CodecError::ErrUnknownCodec(*other)),
        }
    }

    pub fn to_tag(self) -> [u8; 4] {
        match self {
            Self::Opus => *b"opus",
            Self::Aac => *b"aac ",
            Self::Pcm => *b"pcm ",
            Self::Raw => *b"raw ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSample {
    pub data: Vec<u8>,
    pub pts: u64,
    pub codec: AudioCodec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMeta {
    pub name: String,
    pub codec_id: [u8; 4],
    pub width: u32,
    pub height: u32,
}

fn read_exact_or_short(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), CodecError> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => {
                return Err(CodecError::ErrShortRead {
                    needed: buf.len(),
                    got: total,
                });
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(())
}

fn pack_pts(pts_us: u64, config: bool, keyframe: bool) -> Result<u64, CodecError> {
    if pts_us & PTS_VALUE_MASK != pts_us {
        return Err(CodecError::ErrBadHeader(format!(
            "pts {pts_us} exceeds 62-bit microsecond range"
        )));
    }
    let mut packed = pts_us;
    if config {
        packed |= PTS_CONFIG_BIT;
    }
    if keyframe {
        packed |= PTS_KEYFRAME_BIT;
    }
    Ok(packed)
}

fn unpack_pts(packed: u64) -> (u64, bool, bool) {
    (
        packed & PTS_VALUE_MASK,
        packed & PTS_CONFIG_BIT != 0,
        packed & PTS_KEYFRAME_BIT != 0,
    )
}

/// Read one video frame from a device socket.
pub fn decode_video_frame(reader: &mut impl Read) -> Result<VideoSample, CodecError> {
    let mut header = [0u8; VIDEO_AUDIO_HEADER_SIZE];
    read_exact_or_short(reader, &mut header)?;
    let packed_pts = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let (pts, config, keyframe) = unpack_pts(packed_pts);

    let mut data = vec![0u8; length];
    read_exact_or_short(reader, &mut data)?;

    Ok(VideoSample {
        data,
        pts,
        keyframe,
        config,
    })
}

/// Serialize a video sample back into the wire frame `DecodeVideoFrame` reads.
pub fn encode_video_frame(sample: &VideoSample) -> Result<Vec<u8>, CodecError> {
    let packed = pack_pts(sample.pts, sample.config, sample.keyframe)?;
    let mut buf = Vec::with_capacity(VIDEO_AUDIO_HEADER_SIZE + sample.data.len());
    buf.extend_from_slice(&packed.to_be_bytes());
    buf.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&sample.data);
    Ok(buf)
}

/// Read one audio frame; `codec` is the codec announced by the one-time tag (§4.1).
pub fn decode_audio_frame(
    reader: &mut impl Read,
    codec: AudioCodec,
) -> Result<AudioSample, CodecError> {
    let mut header = [0u8; VIDEO_AUDIO_HEADER_SIZE];
    read_exact_or_short(reader, &mut header)?;
    let packed_pts = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let (pts, _config, _keyframe) = unpack_pts(packed_pts);

    let mut data = vec![0u8; length];
    read_exact_or_short(reader, &mut data)?;

    Ok(AudioSample { data, pts, codec })
}

pub fn encode_audio_frame(sample: &AudioSample) -> Result<Vec<u8>, CodecError> {
    let packed = pack_pts(sample.pts, false, false)?;
    let mut buf = Vec::with_capacity(VIDEO_AUDIO_HEADER_SIZE + sample.data.len());
    buf.extend_from_slice(&packed.to_be_bytes());
    buf.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&sample.data);
    Ok(buf)
}

/// Read the one-time 4-byte audio codec announcement tag.
pub fn read_audio_codec_tag(reader: &mut impl Read) -> Result<AudioCodec, CodecError> {
    let mut tag = [0u8; 4];
    read_exact_or_short(reader, &mut tag)?;
    AudioCodec::from_tag(&tag)
}

pub fn write_audio_codec_tag(writer: &mut impl Write, codec: AudioCodec) -> Result<(), CodecError> {
    writer.write_all(&codec.to_tag())?;
    Ok(())
}

/// Read the device-meta prelude sent once on the video socket.
pub fn decode_device_meta(reader: &mut impl Read) -> Result<DeviceMeta, CodecError> {
    let mut buf = [0u8; DEVICE_META_PRELUDE_SIZE];
    read_exact_or_short(reader, &mut buf)?;

    let name_bytes = &buf[0..DEVICE_META_NAME_SIZE];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..nul_pos]).into_owned();

    let codec_id: [u8; 4] = buf[64..68].try_into().unwrap();
    let width = u32::from_be_bytes(buf[68..72].try_into().unwrap());
    let height = u32::from_be_bytes(buf[72..76].try_into().unwrap());

    Ok(DeviceMeta {
        name,
        codec_id,
        width,
        height,
    })
}

pub fn encode_device_meta(meta: &DeviceMeta) -> Vec<u8> {
    let mut buf = vec![0u8; DEVICE_META_PRELUDE_SIZE];
    let name_bytes = meta.name.as_bytes();
    let copy_len = name_bytes.len().min(DEVICE_META_NAME_SIZE);
    buf[..copy_len].copy_from_slice(&name_bytes[..copy_len]);
    buf[64..68].copy_from_slice(&meta.codec_id);
    buf[68..72].copy_from_slice(&meta.width.to_be_bytes());
    buf[72..76].copy_from_slice(&meta.height.to_be_bytes());
    buf
}

/// A control message bound for the device's control socket (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

pub fn encode_control_message(msg: &ControlMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + msg.payload.len());
    buf.push(msg.msg_type);
    buf.extend_from_slice(&msg.payload);
    buf
}

/// Decode a control-socket frame read back from the device (acks, clipboard responses).
/// The device does not length-prefix its responses, so the caller supplies
/// how many payload bytes to read for the given `msg_type`.
pub fn decode_control_message(
    reader: &mut impl Read,
    payload_len: usize,
) -> Result<ControlMessage, CodecError> {
    let mut type_byte = [0u8; 1];
    read_exact_or_short(reader, &mut type_byte)?;
    let mut payload = vec![0u8; payload_len];
    read_exact_or_short(reader, &mut payload)?;
    Ok(ControlMessage {
        msg_type: type_byte[0],
        payload,
    })
}

pub const CONTROL_TYPE_INJECT_KEYCODE: u8 = 0;
pub const CONTROL_TYPE_INJECT_TEXT: u8 = 1;
pub const CONTROL_TYPE_INJECT_TOUCH_EVENT: u8 = 2;
pub const CONTROL_TYPE_INJECT_SCROLL_EVENT: u8 = 3;
pub const CONTROL_TYPE_BACK_OR_SCREEN_ON: u8 = 4;
pub const CONTROL_TYPE_EXPAND_NOTIFICATION_PANEL: u8 = 5;
pub const CONTROL_TYPE_COLLAPSE_PANELS: u8 = 6;
pub const CONTROL_TYPE_GET_CLIPBOARD: u8 = 7;
pub const CONTROL_TYPE_SET_CLIPBOARD: u8 = 8;
pub const CONTROL_TYPE_SET_SCREEN_POWER_MODE: u8 = 10;
pub const CONTROL_TYPE_ROTATE_DEVICE: u8 = 11;
/// Best-effort opcode; the exact value is pinned to the embedded scrcpy-server
/// jar version.
pub const CONTROL_TYPE_RESET_VIDEO: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Up,
    Move,
}

impl TouchAction {
    fn as_byte(self) -> u8 {
        match self {
            Self::Down => 0,
            Self::Up => 1,
            Self::Move => 2,
        }
    }
}

pub struct KeyEvent {
    pub action: KeyAction,
    pub keycode: u32,
}

pub struct TouchEvent {
    pub action: TouchAction,
    pub pointer_id: u64,
    pub x: i32,
    pub y: i32,
    pub pressure: u16,
    pub action_button: u32,
    pub buttons: u32,
}

pub struct ScrollEvent {
    pub x: i32,
    pub y: i32,
    pub h_scroll: i32,
    pub v_scroll: i32,
    pub buttons: u32,
}

pub fn encode_key_event(event: &KeyEvent) -> ControlMessage {
    let mut payload = Vec::with_capacity(9);
    payload.push(match event.action {
        KeyAction::Down => 0,
        KeyAction::Up => 1,
    });
    payload.extend_from_slice(&event.keycode.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // repeat count
    payload.extend_from_slice(&0u32.to_be_bytes()); // meta state
    ControlMessage {
        msg_type: CONTROL_TYPE_INJECT_KEYCODE,
        payload,
    }
}

/// `w`/`h` are the current screen dimensions the coordinates are scaled against.
pub fn encode_touch_event(event: &TouchEvent, w: u16, h: u16) -> ControlMessage {
    let mut payload = Vec::with_capacity(1 + 8 + 4 + 4 + 2 + 2 + 2 + 4 + 4);
    payload.push(event.action.as_byte());
    payload.extend_from_slice(&event.pointer_id.to_be_bytes());
    payload.extend_from_slice(&event.x.to_be_bytes());
    payload.extend_from_slice(&event.y.to_be_bytes());
    payload.extend_from_slice(&w.to_be_bytes());
    payload.extend_from_slice(&h.to_be_bytes());
    payload.extend_from_slice(&event.pressure.to_be_bytes());
    payload.extend_from_slice(&event.action_button.to_be_bytes());
    payload.extend_from_slice(&event.buttons.to_be_bytes());
    ControlMessage {
        msg_type: CONTROL_TYPE_INJECT_TOUCH_EVENT,
        payload,
    }
}

pub fn encode_scroll_event(event: &ScrollEvent, w: u16, h: u16) -> ControlMessage {
    let mut payload = Vec::with_capacity(4 + 4 + 2 + 2 + 4 + 4 + 4);
    payload.extend_from_slice(&event.x.to_be_bytes());
    payload.extend_from_slice(&event.y.to_be_bytes());
    payload.extend_from_slice(&w.to_be_bytes());
    payload.extend_from_slice(&h.to_be_bytes());
    payload.extend_from_slice(&event.h_scroll.to_be_bytes());
    payload.extend_from_slice(&event.v_scroll.to_be_bytes());
    payload.extend_from_slice(&event.buttons.to_be_bytes());
    ControlMessage {
        msg_type: CONTROL_TYPE_INJECT_SCROLL_EVENT,
        payload,
    }
}

/// Scan Annex-B H.264 for NAL unit boundaries (3- and 4-byte start codes).
pub fn extract_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push(i + 3);
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push(i + 4);
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|&next| next_start_code_begin(data, next))
            .unwrap_or(data.len());
        if start < end {
            nals.push(&data[start..end]);
        }
    }
    nals
}

fn next_start_code_begin(data: &[u8], start_of_payload: usize) -> usize {
    // start_of_payload points just past a start code; back up over it.
    if start_of_payload >= 4 && data[start_of_payload - 4..start_of_payload - 1] == [0, 0, 0] {
        start_of_payload - 4
    } else {
        start_of_payload - 3
    }
}

fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// True if any NAL unit in `data` is an SPS (7) or PPS (8).
pub fn contains_config_nal(data: &[u8]) -> bool {
    extract_nals(data)
        .iter()
        .any(|nal| matches!(nal_unit_type(nal), Some(7) | Some(8)))
}

/// True if any NAL unit in `data` is an IDR slice (5).
pub fn contains_idr_nal(data: &[u8]) -> bool {
    extract_nals(data).iter().any(|nal| nal_unit_type(nal) == Some(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn video_frame_roundtrip_picture() {
        let sample = VideoSample {
            data: vec![0x00, 0x00, 0x00, 0x01, 0x65, 0xAB],
            pts: 123_456,
            keyframe: true,
            config: false,
        };
        let encoded = encode_video_frame(&sample).unwrap();
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_video_frame(&mut cursor).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn video_frame_roundtrip_config() {
        let sample = VideoSample {
            data: vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42],
            pts: 0,
            keyframe: false,
            config: true,
        };
        let encoded = encode_video_frame(&sample).unwrap();
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_video_frame(&mut cursor).unwrap();
        assert_eq!(decoded, sample);
        assert!(decoded.config);
    }

    #[test]
    fn pts_out_of_range_is_bad_header() {
        let sample = VideoSample {
            data: vec![],
            pts: u64::MAX,
            keyframe: false,
            config: false,
        };
        assert!(matches!(
            encode_video_frame(&sample),
            Err(CodecError::ErrBadHeader(_))
        ));
    }

    #[test]
    fn audio_frame_roundtrip() {
        let sample = AudioSample {
            data: vec![1, 2, 3, 4],
            pts: 42,
            codec: AudioCodec::Opus,
        };
        let encoded = encode_audio_frame(&sample).unwrap();
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_audio_frame(&mut cursor, AudioCodec::Opus).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn audio_codec_tag_roundtrip() {
        for codec in [AudioCodec::Opus, AudioCodec::Aac, AudioCodec::Raw, AudioCodec::Pcm] {
            let mut buf = Vec::new();
            write_audio_codec_tag(&mut buf, codec).unwrap();
            let mut cursor = Cursor::new(buf);
            assert_eq!(read_audio_codec_tag(&mut cursor).unwrap(), codec);
        }
    }

    #[test]
    fn unknown_audio_codec_tag_errors() {
        let mut cursor = Cursor::new(b"xyz!".to_vec());
        match read_audio_codec_tag(&mut cursor) {
            Err(CodecError::ErrUnknownCodec(tag)) => assert_eq!(&tag, b"xyz!"),
            other => panic!("expected ErrUnknownCodec, got {other:?}"),
        }
    }

    #[test]
    fn short_read_on_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        match decode_video_frame(&mut cursor) {
            Err(CodecError::ErrShortRead { needed, got }) => {
                assert_eq!(needed, VIDEO_AUDIO_HEADER_SIZE);
                assert_eq!(got, 4);
            }
            other => panic!("expected ErrShortRead, got {other:?}"),
        }
    }

    #[test]
    fn device_meta_roundtrip() {
        let meta = DeviceMeta {
            name: "Pixel 7".to_string(),
            codec_id: *b"h264",
            width: 1080,
            height: 2400,
        };
        let encoded = encode_device_meta(&meta);
        assert_eq!(encoded.len(), DEVICE_META_PRELUDE_SIZE);
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_device_meta(&mut cursor).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn control_message_roundtrip() {
        let msg = ControlMessage {
            msg_type: CONTROL_TYPE_INJECT_KEYCODE,
            payload: vec![0, 0, 0, 0, 3, 0, 0, 0, 0],
        };
        let encoded = encode_control_message(&msg);
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_control_message(&mut cursor, msg.payload.len()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn touch_event_payload_layout() {
        let event = TouchEvent {
            action: TouchAction::Down,
            pointer_id: 1,
            x: 500,
            y: 1000,
            pressure: u16::MAX,
            action_button: 1,
            buttons: 1,
        };
        let msg = encode_touch_event(&event, 1080, 2400);
        assert_eq!(msg.msg_type, CONTROL_TYPE_INJECT_TOUCH_EVENT);
        assert_eq!(msg.payload.len(), 1 + 8 + 4 + 4 + 2 + 2 + 2 + 4 + 4);
        assert_eq!(msg.payload[0], 0); // down
        assert_eq!(&msg.payload[21..23], &1080u16.to_be_bytes());
        assert_eq!(&msg.payload[23..25], &2400u16.to_be_bytes());
    }

    #[test]
    fn extract_nals_handles_3_and_4_byte_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0xAA, 0xBB]; // 4-byte start + SPS
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCC]); // 3-byte start + PPS
        data.extend_from_slice(&[0, 0, 1, 0x65, 0xDD, 0xEE]); // 3-byte start + IDR
        let nals = extract_nals(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nal_unit_type(nals[0]), Some(7));
        assert_eq!(nal_unit_type(nals[1]), Some(8));
        assert_eq!(nal_unit_type(nals[2]), Some(5));
    }

    #[test]
    fn contains_config_and_idr_detection() {
        let mut sps_pps = vec![0, 0, 0, 1, 0x67];
        sps_pps.extend_from_slice(&[0, 0, 1, 0x68]);
        assert!(contains_config_nal(&sps_pps));
        assert!(!contains_idr_nal(&sps_pps));

        let idr = vec![0, 0, 0, 1, 0x65, 0xAB, 0xCD];
        assert!(contains_idr_nal(&idr));
        assert!(!contains_config_nal(&idr));
    }
}
