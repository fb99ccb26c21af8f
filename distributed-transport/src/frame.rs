//! Framed request/response wire format (spec section 6 "Wire frames").
//!
//! `magic(1) | version(1) | serviceType(2) | messageType(2) |
//! correlationId(8) | payloadLen(4) | payload(payloadLen)`, all integers
//! big-endian. A [`tokio_util::codec::Decoder`]/[`Encoder`] pair, the same
//! shape `common/kafka`'s length-delimited framing uses for its producer
//! wire format, generalized to carry the service/message routing key and
//! correlation id this protocol needs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

pub const MAGIC: u8 = 0xA1;
pub const VERSION: u8 = 1;

/// Header is fixed-size; only the payload varies.
const HEADER_LEN: usize = 1 + 1 + 2 + 2 + 8 + 4;

/// Refuses to allocate more than this for one frame's payload — a corrupt
/// length prefix must not let a peer force an unbounded allocation (spec
/// section 4.8: "a corrupt frame closes the connection").
const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service_type: u16,
    pub message_type: u16,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(service_type: u16, message_type: u16, correlation_id: u64, payload: Bytes) -> Self {
        Self {
            service_type,
            message_type,
            correlation_id,
            payload,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = src[0];
        let version = src[1];
        if magic != MAGIC {
            return Err(Error::CorruptFrame(format!("bad magic byte {magic:#x}")));
        }
        if version != VERSION {
            return Err(Error::CorruptFrame(format!("unsupported frame version {version}")));
        }

        let mut header = &src[2..HEADER_LEN];
        let service_type = header.get_u16();
        let message_type = header.get_u16();
        let correlation_id = header.get_u64();
        let payload_len = header.get_u32();

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::CorruptFrame(format!(
                "payload length {payload_len} exceeds max {MAX_PAYLOAD_LEN}"
            )));
        }

        let total_len = HEADER_LEN + payload_len as usize;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(total_len);
        frame_bytes.advance(HEADER_LEN);
        let payload = frame_bytes.freeze();

        Ok(Some(Frame {
            service_type,
            message_type,
            correlation_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(Error::CorruptFrame(format!(
                "payload length {} exceeds max {MAX_PAYLOAD_LEN}",
                item.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u8(MAGIC);
        dst.put_u8(VERSION);
        dst.put_u16(item.service_type);
        dst.put_u16(item.message_type);
        dst.put_u64(item.correlation_id);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_empty_payload() {
        roundtrip(Frame::new(1, 1, 42, Bytes::new()));
    }

    #[test]
    fn roundtrips_with_payload() {
        roundtrip(Frame::new(3, 7, 9999, Bytes::from_static(b"{\"hello\":true}")));
    }

    #[test]
    fn returns_none_on_truncated_header() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[MAGIC, VERSION, 0, 1][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn returns_none_on_truncated_payload() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(1, 1, 1, Bytes::from_static(b"hello")), &mut buf)
            .unwrap();
        buf.truncate(buf.len() - 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0xFF, VERSION, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::CorruptFrame(_))));
    }

    #[test]
    fn rejects_oversized_payload_len() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u16(1);
        buf.put_u16(1);
        buf.put_u64(1);
        buf.put_u32(u32::MAX);
        assert!(matches!(codec.decode(&mut buf), Err(Error::CorruptFrame(_))));
    }
}
