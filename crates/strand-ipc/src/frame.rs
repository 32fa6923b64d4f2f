//! Pipe message framing.
//!
//! Every message on a worker pipe is a 10-byte little-endian header — message
//! id, sender id, body length — followed by `len` body bytes streamed in
//! `PIPE_BUF`-sized chunks.

/// Size of the on-the-wire frame header.
pub const FRAME_HEADER_LEN: usize = 10;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message id, selects the handler on the receiving worker.
    pub id: u8,
    /// Worker id of the sender.
    pub src: u8,
    /// Body length in bytes.
    pub len: u64,
}

impl FrameHeader {
    pub fn new(id: u8, src: u8, len: u64) -> Self {
        FrameHeader { id, src, len }
    }

    /// Encode into the 10-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.id;
        buf[1] = self.src;
        buf[2..].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode from the 10-byte wire form.
    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        FrameHeader {
            id: buf[0],
            src: buf[1],
            len: u64::from_le_bytes(buf[2..].try_into().expect("header slice is 8 bytes")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let hdr = FrameHeader::new(0x41, 3, 0x0102_0304);
        let buf = hdr.encode();
        assert_eq!(buf[0], 0x41);
        assert_eq!(buf[1], 3);
        // Little-endian length.
        assert_eq!(&buf[2..], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_roundtrip() {
        let hdr = FrameHeader::new(200, 1, u64::from(u32::MAX) + 17);
        assert_eq!(FrameHeader::decode(&hdr.encode()), hdr);
    }

    #[test]
    fn test_zero_length_body() {
        let hdr = FrameHeader::new(64, 2, 0);
        let decoded = FrameHeader::decode(&hdr.encode());
        assert_eq!(decoded.len, 0);
    }
}
