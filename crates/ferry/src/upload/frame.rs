//! Binary data frame layout: `u64 LE offset | length (u16 or u32 LE) | payload`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FerryError;

/// Size of the running-offset field at the start of every frame.
pub const OFFSET_FIELD_LEN: usize = 8;

/// Width of the payload length field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LengthWidth {
    /// Two bytes; payloads are limited to 32767 bytes for compatibility with
    /// receivers reading the field as a signed 16-bit integer.
    #[default]
    U16,
    U32,
}

impl LengthWidth {
    pub const fn field_len(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    pub const fn max_payload(self) -> usize {
        match self {
            Self::U16 => i16::MAX as usize,
            Self::U32 => u32::MAX as usize,
        }
    }
}

/// Encoder for one negotiated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    width: LengthWidth,
    max_payload: usize,
}

impl FrameCodec {
    /// Build a codec for a negotiated `buffer_size` (header included).
    pub fn new(width: LengthWidth, buffer_size: usize) -> Result<Self, FerryError> {
        let header_len = OFFSET_FIELD_LEN + width.field_len();
        if buffer_size <= header_len {
            return Err(FerryError::protocol(
                "negotiation",
                format!("buffer size {buffer_size} cannot hold a {header_len}-byte frame header"),
            ));
        }
        Ok(Self {
            width,
            max_payload: (buffer_size - header_len).min(width.max_payload()),
        })
    }

    pub fn header_len(&self) -> usize {
        OFFSET_FIELD_LEN + self.width.field_len()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode one frame. Oversized payloads are refused without producing output.
    pub fn encode(&self, offset: u64, payload: &[u8]) -> Result<Bytes, FerryError> {
        if payload.len() > self.max_payload {
            return Err(FerryError::FrameTooLarge {
                len: payload.len(),
                limit: self.max_payload,
            });
        }
        let mut frame = BytesMut::with_capacity(self.header_len() + payload.len());
        frame.put_u64_le(offset);
        match self.width {
            LengthWidth::U16 => frame.put_u16_le(payload.len() as u16),
            LengthWidth::U32 => frame.put_u32_le(payload.len() as u32),
        }
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Split a received frame into its offset and payload.
    pub fn decode<'a>(&self, frame: &'a [u8]) -> Result<(u64, &'a [u8]), FerryError> {
        let header_len = self.header_len();
        if frame.len() < header_len {
            return Err(FerryError::protocol(
                "frame decode",
                format!("frame of {} bytes is shorter than its header", frame.len()),
            ));
        }
        let (offset_bytes, rest) = frame.split_at(OFFSET_FIELD_LEN);
        let mut offset = [0u8; OFFSET_FIELD_LEN];
        offset.copy_from_slice(offset_bytes);
        let (len, payload) = match self.width {
            LengthWidth::U16 => (usize::from(u16::from_le_bytes([rest[0], rest[1]])), &rest[2..]),
            LengthWidth::U32 => (
                u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize,
                &rest[4..],
            ),
        };
        if len != payload.len() {
            return Err(FerryError::protocol(
                "frame decode",
                format!("length field says {len} bytes, frame carries {}", payload.len()),
            ));
        }
        Ok((u64::from_le_bytes(offset), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_frame_layout_is_little_endian() {
        let codec = FrameCodec::new(LengthWidth::U16, 8192).unwrap();
        let frame = codec.encode(0x0102, b"abc").unwrap();
        assert_eq!(
            &frame[..],
            &[0x02, 0x01, 0, 0, 0, 0, 0, 0, 3, 0, b'a', b'b', b'c']
        );
        assert_eq!(codec.decode(&frame).unwrap(), (0x0102, &b"abc"[..]));
    }

    #[test]
    fn max_payload_is_buffer_minus_header_capped_by_width() {
        let codec = FrameCodec::new(LengthWidth::U16, 8192).unwrap();
        assert_eq!(codec.header_len(), 10);
        assert_eq!(codec.max_payload(), 8182);

        let codec = FrameCodec::new(LengthWidth::U16, 1 << 20).unwrap();
        assert_eq!(codec.max_payload(), 32767);

        let codec = FrameCodec::new(LengthWidth::U32, 1 << 20).unwrap();
        assert_eq!(codec.header_len(), 12);
        assert_eq!(codec.max_payload(), (1 << 20) - 12);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let codec = FrameCodec::new(LengthWidth::U16, 64).unwrap();
        let payload = vec![0u8; 55];
        match codec.encode(0, &payload) {
            Err(FerryError::FrameTooLarge { len, limit }) => {
                assert_eq!(len, 55);
                assert_eq!(limit, 54);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(codec.encode(0, &payload[..54]).is_ok());
    }

    #[test]
    fn buffer_without_room_for_payload_is_a_protocol_error() {
        let err = FrameCodec::new(LengthWidth::U16, 10).unwrap_err();
        assert!(matches!(err, FerryError::Protocol { .. }));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let codec = FrameCodec::new(LengthWidth::U32, 128).unwrap();
        let mut frame = codec.encode(7, b"hello").unwrap().to_vec();
        frame.pop();
        assert!(codec.decode(&frame).is_err());
    }
}
