//! Wire protocol implementation for wsrelay.
//!
//! Relay messages are binary and big-endian: a 2-byte tag followed by
//! tag-specific fields. Each WebSocket message carries exactly one frame,
//! so decoding works on whole message buffers rather than a byte stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame tag constants.
const TAG_CONNECT_SUCCESS_SID: u16 = 0x0001;
const TAG_RECONNECT_ACK: u16 = 0x0002;
const TAG_DATA: u16 = 0x0004;
const TAG_ACK: u16 = 0x0007;

/// Maximum payload bytes in a single DATA frame.
pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;

/// DATA frame header size (tag + payload length).
pub const DATA_HEADER_LEN: usize = 6;

/// Total size of an ACK or RECONNECT_ACK message (tag + u64).
pub const ACK_MESSAGE_LEN: usize = 10;

/// Smallest message the protocol can produce (DATA or SID with a
/// one-byte body).
pub const MIN_MESSAGE_SIZE: usize = DATA_HEADER_LEN + 1;

/// Largest message the protocol can produce (DATA at full payload).
pub const MAX_MESSAGE_SIZE: usize = DATA_HEADER_LEN + MAX_DATA_PAYLOAD;

/// Frame error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame tag: {0:#06x}")]
    UnknownTag(u16),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Result type for frame operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Wire protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session ID assignment, sent by the relay on a fresh connection.
    ConnectSuccessSid { sid: String },
    /// Reconnect accepted; carries how many bytes the relay has received.
    ReconnectAck { ack: u64 },
    /// Stream payload. Position is implicit in cumulative byte counts.
    Data { data: Bytes },
    /// Cumulative acknowledgement of received bytes.
    Ack { ack: u64 },
}

impl Frame {
    /// Encode this frame to a byte buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::ConnectSuccessSid { sid } => {
                buf.put_u16(TAG_CONNECT_SUCCESS_SID);
                buf.put_u32(sid.len() as u32);
                buf.put_slice(sid.as_bytes());
            }
            Frame::ReconnectAck { ack } => {
                buf.put_u16(TAG_RECONNECT_ACK);
                buf.put_u64(*ack);
            }
            Frame::Data { data } => {
                debug_assert!(!data.is_empty() && data.len() <= MAX_DATA_PAYLOAD);
                buf.put_u16(TAG_DATA);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Frame::Ack { ack } => {
                buf.put_u16(TAG_ACK);
                buf.put_u64(*ack);
            }
        }
    }

    /// Decode a frame from a complete message buffer.
    ///
    /// The buffer must contain exactly one frame; trailing bytes are a
    /// protocol violation.
    pub fn decode(buf: &[u8]) -> FrameResult<Frame> {
        if buf.len() < 2 {
            return Err(FrameError::Malformed("message shorter than tag"));
        }

        let tag = u16::from_be_bytes([buf[0], buf[1]]);
        let body = &buf[2..];

        match tag {
            TAG_CONNECT_SUCCESS_SID => {
                let (len, rest) = read_length(body)?;
                if len == 0 {
                    return Err(FrameError::Malformed("empty session ID"));
                }
                if len > MAX_DATA_PAYLOAD {
                    return Err(FrameError::Malformed("session ID exceeds array limit"));
                }
                if rest.len() != len {
                    return Err(FrameError::Malformed("session ID length mismatch"));
                }
                let sid = std::str::from_utf8(rest)
                    .map_err(|_| FrameError::Malformed("session ID is not valid UTF-8"))?
                    .to_string();
                Ok(Frame::ConnectSuccessSid { sid })
            }
            TAG_RECONNECT_ACK => {
                let ack = read_u64(body)?;
                Ok(Frame::ReconnectAck { ack })
            }
            TAG_DATA => {
                let (len, rest) = read_length(body)?;
                if len == 0 {
                    return Err(FrameError::Malformed("zero-length DATA payload"));
                }
                if len > MAX_DATA_PAYLOAD {
                    return Err(FrameError::Malformed("DATA payload exceeds array limit"));
                }
                if rest.len() < len {
                    return Err(FrameError::Malformed("truncated DATA payload"));
                }
                if rest.len() > len {
                    return Err(FrameError::Malformed("trailing bytes after DATA payload"));
                }
                Ok(Frame::Data {
                    data: Bytes::copy_from_slice(rest),
                })
            }
            TAG_ACK => {
                let ack = read_u64(body)?;
                Ok(Frame::Ack { ack })
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    /// Returns a human-readable name for this frame type.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::ConnectSuccessSid { .. } => "CONNECT_SUCCESS_SID",
            Frame::ReconnectAck { .. } => "RECONNECT_SUCCESS_ACK",
            Frame::Data { .. } => "DATA",
            Frame::Ack { .. } => "ACK",
        }
    }
}

/// Reads a 4-byte big-endian length field, returning it and the remainder.
fn read_length(buf: &[u8]) -> FrameResult<(usize, &[u8])> {
    if buf.len() < 4 {
        return Err(FrameError::Malformed("truncated length field"));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Ok((len, &buf[4..]))
}

/// Reads an 8-byte big-endian counter occupying the whole remainder.
fn read_u64(buf: &[u8]) -> FrameResult<u64> {
    if buf.len() != 8 {
        return Err(FrameError::Malformed("ack field must be exactly 8 bytes"));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(buf);
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sid_roundtrip() {
        let frame = Frame::ConnectSuccessSid {
            sid: "abcd-1234".to_string(),
        };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_sid_wire_layout() {
        let frame = Frame::ConnectSuccessSid {
            sid: "ab".to_string(),
        };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        assert_eq!(&buf[..], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, b'a', b'b']);
    }

    #[test]
    fn test_frame_reconnect_ack_roundtrip() {
        let frame = Frame::ReconnectAck { ack: 0 };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), ACK_MESSAGE_LEN);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_data_roundtrip() {
        let frame = Frame::Data {
            data: Bytes::from_static(b"hello world"),
        };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_LEN + 11);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_data_max_payload() {
        let frame = Frame::Data {
            data: Bytes::from(vec![0x5a; MAX_DATA_PAYLOAD]),
        };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), MAX_MESSAGE_SIZE);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_data_min_payload() {
        let frame = Frame::Data {
            data: Bytes::from_static(b"x"),
        };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), MIN_MESSAGE_SIZE);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_ack_roundtrip() {
        let frame = Frame::Ack { ack: 0xDEAD_BEEF_0123 };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), ACK_MESSAGE_LEN);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_ack_wire_layout() {
        let frame = Frame::Ack { ack: 1 };

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        assert_eq!(
            &buf[..],
            &[0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_decode_empty_buffer() {
        assert_eq!(
            Frame::decode(&[]),
            Err(FrameError::Malformed("message shorter than tag"))
        );
    }

    #[test]
    fn test_decode_unknown_tag() {
        let buf: &[u8] = &[0x00, 0x42, 0x00, 0x00];
        assert_eq!(Frame::decode(buf), Err(FrameError::UnknownTag(0x0042)));
    }

    #[test]
    fn test_decode_data_truncated_length() {
        let buf: &[u8] = &[0x00, 0x04, 0x00, 0x00];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("truncated length field"))
        );
    }

    #[test]
    fn test_decode_data_truncated_payload() {
        // Declares 4 payload bytes but carries only 2.
        let buf: &[u8] = &[0x00, 0x04, 0x00, 0x00, 0x00, 0x04, 0xAA, 0xBB];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("truncated DATA payload"))
        );
    }

    #[test]
    fn test_decode_data_zero_length() {
        let buf: &[u8] = &[0x00, 0x04, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("zero-length DATA payload"))
        );
    }

    #[test]
    fn test_decode_data_oversized_declared_length() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0004);
        buf.put_u32((MAX_DATA_PAYLOAD + 1) as u32);
        buf.put_slice(&vec![0u8; MAX_DATA_PAYLOAD + 1]);

        assert_eq!(
            Frame::decode(&buf),
            Err(FrameError::Malformed("DATA payload exceeds array limit"))
        );
    }

    #[test]
    fn test_decode_data_trailing_bytes() {
        // Declares 1 payload byte but carries 2.
        let buf: &[u8] = &[0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("trailing bytes after DATA payload"))
        );
    }

    #[test]
    fn test_decode_ack_wrong_size() {
        let buf: &[u8] = &[0x00, 0x07, 0x00, 0x00, 0x01];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("ack field must be exactly 8 bytes"))
        );

        let buf: &[u8] = &[
            0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
        ];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("ack field must be exactly 8 bytes"))
        );
    }

    #[test]
    fn test_decode_sid_invalid_utf8() {
        let buf: &[u8] = &[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0xFF, 0xFE];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("session ID is not valid UTF-8"))
        );
    }

    #[test]
    fn test_decode_sid_empty() {
        let buf: &[u8] = &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            Frame::decode(buf),
            Err(FrameError::Malformed("empty session ID"))
        );
    }

    #[test]
    fn test_frame_names() {
        assert_eq!(
            Frame::ConnectSuccessSid { sid: "x".into() }.name(),
            "CONNECT_SUCCESS_SID"
        );
        assert_eq!(Frame::ReconnectAck { ack: 0 }.name(), "RECONNECT_SUCCESS_ACK");
        assert_eq!(
            Frame::Data {
                data: Bytes::from_static(b"x")
            }
            .name(),
            "DATA"
        );
        assert_eq!(Frame::Ack { ack: 0 }.name(), "ACK");
    }
}
