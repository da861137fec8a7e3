//! Wire frame for the ADB-Expose Multiplexer's single WebSocket (§4.8):
//! `streamID (4) || flags (1) || length (4) || payload`, all integers
//! big-endian. Encode/decode shape mirrors the protocol crate's frame codec
//! style: small pure functions over byte buffers, each independently tested.

use std::io;

pub const HEADER_SIZE: usize = 4 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Open,
    Data,
    WindowUpdate,
    Close,
    Error,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Open),
            1 => Some(Self::Data),
            2 => Some(Self::WindowUpdate),
            3 => Some(Self::Close),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Data => 1,
            Self::WindowUpdate => 2,
            Self::Close => 3,
            Self::Error => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum MuxWireError {
    #[error("frame too short: needed at least {HEADER_SIZE} bytes, got {0}")]
    TooShort(usize),
    #[error("unknown frame kind tag: {0}")]
    UnknownKind(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn encode_frame(frame: &MuxFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    buf.extend_from_slice(&frame.stream_id.to_be_bytes());
    buf.push(frame.kind.to_byte());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}

pub fn decode_frame(data: &[u8]) -> Result<MuxFrame, MuxWireError> {
    if data.len() < HEADER_SIZE {
        return Err(MuxWireError::TooShort(data.len()));
    }
    let stream_id = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let kind = FrameKind::from_byte(data[4]).ok_or(MuxWireError::UnknownKind(data[4]))?;
    let length = u32::from_be_bytes(data[5..9].try_into().unwrap()) as usize;
    if data.len() < HEADER_SIZE + length {
        return Err(MuxWireError::TooShort(data.len()));
    }
    let payload = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
    Ok(MuxFrame { stream_id, kind, payload })
}

/// A `WINDOW_UPDATE` payload carries a single 4-byte big-endian credit delta.
pub fn encode_window_update(stream_id: u32, credit_delta: u32) -> MuxFrame {
    MuxFrame {
        stream_id,
        kind: FrameKind::WindowUpdate,
        payload: credit_delta.to_be_bytes().to_vec(),
    }
}

pub fn decode_window_update(frame: &MuxFrame) -> Result<u32, MuxWireError> {
    if frame.payload.len() < 4 {
        return Err(MuxWireError::TooShort(frame.payload.len()));
    }
    Ok(u32::from_be_bytes(frame.payload[0..4].try_into().unwrap()))
}

/// An `OPEN` payload carries the 2-byte big-endian remote port to dial.
pub fn encode_open(stream_id: u32, remote_port: u16) -> MuxFrame {
    MuxFrame {
        stream_id,
        kind: FrameKind::Open,
        payload: remote_port.to_be_bytes().to_vec(),
    }
}

pub fn decode_open(frame: &MuxFrame) -> Result<u16, MuxWireError> {
    if frame.payload.len() < 2 {
        return Err(MuxWireError::TooShort(frame.payload.len()));
    }
    Ok(u16::from_be_bytes(frame.payload[0..2].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_roundtrip() {
        let frame = MuxFrame { stream_id: 7, kind: FrameKind::Data, payload: vec![1, 2, 3, 4] };
        let encoded = encode_frame(&frame);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = MuxFrame { stream_id: 1, kind: FrameKind::Close, payload: vec![] };
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn short_buffer_is_an_error() {
        let err = decode_frame(&[0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, MuxWireError::TooShort(_)));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut buf = vec![0, 0, 0, 1, 99];
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = decode_frame(&buf).unwrap_err();
        assert!(matches!(err, MuxWireError::UnknownKind(99)));
    }

    #[test]
    fn window_update_roundtrip() {
        let frame = encode_window_update(3, 65_536);
        assert_eq!(decode_window_update(&frame).unwrap(), 65_536);
    }

    #[test]
    fn open_roundtrip() {
        let frame = encode_open(5, 5037);
        assert_eq!(decode_open(&frame).unwrap(), 5037);
    }
}
