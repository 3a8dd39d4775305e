//! Viewer wire formats
//!
//! Binary socket frame: `type (1) | sequence (8, BE) | length (4, BE) | payload`.
//! Multipart part: boundary line, JPEG headers, payload, CRLF.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 13;
pub const MULTIPART_BOUNDARY: &str = "frame";

/// Binary frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Raw = 0,
    Annotated = 1,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameType::Raw),
            1 => Some(FrameType::Annotated),
            _ => None,
        }
    }
}

/// Encode one binary socket frame
pub fn encode_frame(kind: FrameType, sequence: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u64(sequence);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decoded binary frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameType,
    pub sequence: u64,
    pub length: u32,
}

/// Parse a binary frame header. None if truncated or the type is unknown.
pub fn decode_header(mut data: &[u8]) -> Option<FrameHeader> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let kind = FrameType::from_u8(data.get_u8())?;
    let sequence = data.get_u64();
    let length = data.get_u32();
    Some(FrameHeader {
        kind,
        sequence,
        length,
    })
}

/// `Content-Type` of the multipart response
pub fn multipart_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", MULTIPART_BOUNDARY)
}

/// One multipart part carrying a JPEG
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MULTIPART_BOUNDARY,
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}
