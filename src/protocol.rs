//! protocol.rs
//!
//! Framing for the heat-pump controller bus (RS-485, multi-master,
//! arbitrated by a panel-granted token):
//!
//!   [ BEGIN, LEN_L, LEN_H, DST_L, DST_H, SRC_L, SRC_H, CMD, <PAYLOAD...>, CRC_H, CRC_L, END ]
//!
//! Where:
//! - BEGIN: 1 byte start marker 0x68 (for resync)
//! - LEN: little-endian u16 = total frame size minus 6, i.e. the byte count
//!        from SRC_H through END inclusive
//! - DST/SRC: little-endian u16 device addresses
//! - CMD: 1 byte command code
//! - PAYLOAD: 0..~1 KiB
//! - CRC: CRC-16 over LEN_L through the end of PAYLOAD, appended big-endian
//!        as CRC_H then CRC_L (opposite byte order to the addresses)
//! - END: 1 byte end marker 0x16
//!
//! Notes:
//! - The stream decoder resyncs by scanning for BEGIN and, when a candidate
//!   frame fails validation, advancing a single byte past that BEGIN.
//! - Parsing is pure; a malformed candidate is never an error, just "no
//!   frame here".
//! - The CRC is the controller firmware's own recurrence, reproduced
//!   bit-exactly below. It is not one of the stock CRC-16 parameter sets.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame start marker.
pub const BEGIN_FRAME: u8 = 0x68;
/// Frame end marker.
pub const END_FRAME: u8 = 0x16;
/// Smallest possible frame: empty payload.
pub const FRAME_MIN_LEN: usize = 11;
/// Anything longer than this is framing garbage, not a frame.
pub const FRAME_MAX_LEN: usize = 1024;

/// Our own bus address, stamped as SRC into every outbound frame.
pub const SRC_ADDRESS: u16 = 131;
/// The master display panel.
pub const PANEL_ADDRESS: u16 = 100;
/// Frames to this destination are addressed to everyone, us included.
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;
/// Controller addresses seen in the field; index 0 is the default.
pub const DEST_ADDRESSES: [u16; 3] = [1, 2, 237];

/// Command codes. Responses set the high bit of the request code.
pub mod command {
    pub const GET_SETTINGS: u8 = 0x00;
    pub const GET_SETTINGS_RESPONSE: u8 = 0x80;
    /// Parameter metadata without range data (panel address space).
    pub const GET_PARAMS_STRUCT: u8 = 0x01;
    pub const GET_PARAMS_STRUCT_RESPONSE: u8 = 0x81;
    /// Parameter metadata with min/max range block (controller space).
    pub const GET_PARAMS_STRUCT_WITH_RANGE: u8 = 0x02;
    pub const GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE: u8 = 0x82;
    /// Bulk value read.
    pub const GET_PARAMS: u8 = 0x40;
    pub const GET_PARAMS_RESPONSE: u8 = 0xC0;
    /// Authorized single-value write.
    pub const MODIFY_PARAM: u8 = 0x29;
    pub const MODIFY_PARAM_RESPONSE: u8 = 0xA9;
    /// Panel probe ("who is on the bus?") and our reply to it.
    pub const IDENTIFY: u8 = 0x30;
    pub const IDENTIFY_RESPONSE: u8 = 0xB0;
    /// Token grant / token return / alarm reads, multiplexed by a
    /// little-endian u16 function code in the first two payload bytes.
    pub const SERVICE: u8 = 0x3D;
    pub const SERVICE_RESPONSE: u8 = 0xBD;
    /// Terminal replies: "nothing at that index" and "request refused".
    pub const NO_DATA: u8 = 0x7F;
    pub const ERROR: u8 = 0xFF;
}

/// SERVICE function code carried in a token grant from the panel.
pub const GET_TOKEN_FUNC: u16 = 0x0001;
/// Fixed SERVICE payload that hands the token back to the panel.
pub const GIVE_BACK_TOKEN_DATA: &[u8] = &[0x01, 0x00, 0x01, 0x00];
/// SERVICE payload prefix for an alarm slot read; a one-byte slot index
/// is appended per request.
pub const ALARM_REQUEST_PREFIX: &[u8] = &[0x02, 0x00];
/// Identity blob sent in reply to an IDENTIFY probe. Opaque to us; the
/// panel uses it to register the device type on the bus.
pub const IDENTIFY_RESPONSE_DATA: &[u8] =
    &[0x01, 0x00, 0x20, 0x03, 0x00, 0x00, 0x83, 0x00, 0x00, 0x00];

/// Authorization header prepended to every MODIFY_PARAM payload:
/// "USER-000" NUL "4096" NUL.
pub const MODIFY_AUTH_HEADER: &[u8] = &[
    0x55, 0x53, 0x45, 0x52, 0x2d, 0x30, 0x30, 0x30, 0x00, 0x34, 0x30, 0x39, 0x36, 0x00,
];

// -----------------------------
// CRC-16
// -----------------------------

/// Controller-bus CRC-16. Starts from zero; for each byte `b`:
/// `s = b ^ (crc >> 8)`, `t = s ^ (s >> 4)`, then
/// `crc = (crc << 8) ^ t ^ (t << 5) ^ (t << 12)`, truncated to 16 bits.
pub fn calculate_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let s = byte ^ (crc >> 8) as u8;
        let t = s ^ (s >> 4);
        crc = (crc << 8) ^ (t as u16) ^ ((t as u16) << 5) ^ ((t as u16) << 12);
    }
    crc
}

/// Recompute and compare.
pub fn verify_crc16(data: &[u8], expected: u16) -> bool {
    calculate_crc16(data) == expected
}

// -----------------------------
// Frame
// -----------------------------

/// One on-wire unit. Built by a sender or parsed from bytes, consumed by
/// the request/response correlator, never stored past the transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub destination: u16,
    pub source: u16,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// New outbound frame. SRC is always our own address.
    pub fn new(destination: u16, command: u8, payload: Vec<u8>) -> Self {
        Self {
            destination,
            source: SRC_ADDRESS,
            command,
            payload,
        }
    }

    /// Serialize for transmission, computing LEN and CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = FRAME_MIN_LEN + self.payload.len();
        let length = (total - 6) as u16;

        let mut out = Vec::with_capacity(total);
        out.push(BEGIN_FRAME);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&self.destination.to_le_bytes());
        out.extend_from_slice(&self.source.to_le_bytes());
        out.push(self.command);
        out.extend_from_slice(&self.payload);

        // CRC covers LEN_L through the last payload byte, written high byte
        // first.
        let crc = calculate_crc16(&out[1..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out.push(END_FRAME);
        out
    }

    /// Parse a complete frame. Returns `None` on any structural or CRC
    /// problem; parsing has no side effects.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_MIN_LEN {
            return None;
        }
        if data[0] != BEGIN_FRAME || data[data.len() - 1] != END_FRAME {
            return None;
        }

        let declared = u16::from_le_bytes([data[1], data[2]]) as usize;
        if declared + 6 != data.len() {
            return None;
        }

        let crc_end = data.len() - 3;
        let expected = u16::from_be_bytes([data[crc_end], data[crc_end + 1]]);
        if !verify_crc16(&data[1..crc_end], expected) {
            return None;
        }

        Some(Self {
            destination: u16::from_le_bytes([data[3], data[4]]),
            source: u16::from_le_bytes([data[5], data[6]]),
            command: data[7],
            payload: data[8..crc_end].to_vec(),
        })
    }

    /// Whether the frame is addressed to us (directly or broadcast).
    pub fn is_for_us(&self) -> bool {
        self.destination == SRC_ADDRESS || self.destination == BROADCAST_ADDRESS
    }
}

// -----------------------------
// Stream codec
// -----------------------------

/// Stream decoder for bus frames.
///
/// Byte chunks off the wire are arbitrary, so the decoder hunts for BEGIN,
/// discards garbage in front of it, waits for a complete candidate and
/// validates it. A candidate that fails (bogus length, wrong END, CRC
/// mismatch) costs exactly one byte of progress: everything past that
/// BEGIN gets rescanned, so a frame that starts inside the garbage is not
/// lost.
#[derive(Debug, Default)]
pub struct FrameCodec {
    invalid: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates rejected since construction; resync diagnostics only.
    pub fn invalid_count(&self) -> u64 {
        self.invalid
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            let Some(begin) = src.iter().position(|&b| b == BEGIN_FRAME) else {
                // No marker anywhere: everything buffered is noise.
                src.clear();
                return Ok(None);
            };
            if begin > 0 {
                tracing::trace!(discarded = begin, "skipping bytes before frame marker");
                src.advance(begin);
            }

            if src.len() < 3 {
                return Ok(None);
            }

            let declared = u16::from_le_bytes([src[1], src[2]]) as usize;
            let total = declared + 6;
            if total < FRAME_MIN_LEN || total > FRAME_MAX_LEN {
                self.invalid += 1;
                src.advance(1);
                continue;
            }

            if src.len() < total {
                // Wait for the rest of the candidate.
                return Ok(None);
            }

            if src[total - 1] != END_FRAME {
                self.invalid += 1;
                src.advance(1);
                continue;
            }

            match Frame::from_bytes(&src[..total]) {
                Some(frame) => {
                    src.advance(total);
                    return Ok(Some(frame));
                }
                None => {
                    tracing::trace!("frame candidate failed CRC/validation");
                    self.invalid += 1;
                    src.advance(1);
                }
            }
        }
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.to_bytes());
        Ok(())
    }
}

// -----------------------------
// Request payload builders
// -----------------------------

/// GET_PARAMS / GET_PARAMS_STRUCT request body: count, then the starting
/// wire index little-endian.
pub fn build_params_request(start_index: u16, count: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.push(count);
    out.extend_from_slice(&start_index.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_deterministic_vector() {
        let data = [0x04, 0x00, 0x01, 0x00, 0x83, 0x00, 0x40];
        let a = calculate_crc16(&data);
        let b = calculate_crc16(&data);
        assert_eq!(a, b);
        assert!(verify_crc16(&data, a));
    }

    #[test]
    fn crc_empty_is_zero() {
        assert_eq!(calculate_crc16(&[]), 0);
    }

    #[test]
    fn crc_sensitive_to_any_single_bit() {
        let data = [0x04, 0x00, 0x01, 0x00, 0x83, 0x00, 0x40];
        let base = calculate_crc16(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(
                    calculate_crc16(&flipped),
                    base,
                    "flip at byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn frame_roundtrip_basic_read_request() {
        let frame = Frame::new(1, command::GET_PARAMS, vec![0x01, 0x00, 0x00]);
        let bytes = frame.to_bytes();

        assert_eq!(bytes[0], BEGIN_FRAME);
        assert_eq!(*bytes.last().unwrap(), END_FRAME);
        // LEN is little-endian and equals total size minus 6.
        let declared = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        assert_eq!(declared + 6, bytes.len());
        // Destination 1, little-endian.
        assert_eq!(&bytes[3..5], &[0x01, 0x00]);
        // Our source address, little-endian.
        assert_eq!(&bytes[5..7], &SRC_ADDRESS.to_le_bytes());
        assert_eq!(bytes[7], 0x40);
        assert_eq!(&bytes[8..11], &[0x01, 0x00, 0x00]);
        // CRC is big-endian: high byte precedes low byte.
        let crc = calculate_crc16(&bytes[1..bytes.len() - 3]);
        assert_eq!(bytes[bytes.len() - 3], (crc >> 8) as u8);
        assert_eq!(bytes[bytes.len() - 2], (crc & 0xFF) as u8);

        assert_eq!(Frame::from_bytes(&bytes), Some(frame));
    }

    #[test]
    fn empty_payload_frame_is_minimum_length() {
        let frame = Frame::new(1, command::GET_SETTINGS, Vec::new());
        assert_eq!(frame.to_bytes().len(), FRAME_MIN_LEN);
    }

    #[test]
    fn parse_rejects_any_single_bit_flip() {
        let bytes = Frame::new(1, command::GET_PARAMS, vec![0x01, 0x00, 0x00]).to_bytes();
        // Flipping any bit between the outer markers must fail the parse.
        for byte in 1..bytes.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte] ^= 1 << bit;
                assert_eq!(
                    Frame::from_bytes(&corrupted),
                    None,
                    "corruption at byte {byte} bit {bit} accepted"
                );
            }
        }
    }

    #[test]
    fn parse_rejects_bad_markers_and_lengths() {
        let good = Frame::new(1, 0x40, vec![1, 2, 3]).to_bytes();

        assert_eq!(Frame::from_bytes(&good[..5]), None);

        let mut bad_begin = good.clone();
        bad_begin[0] = 0x00;
        assert_eq!(Frame::from_bytes(&bad_begin), None);

        let mut bad_end = good.clone();
        let last = bad_end.len() - 1;
        bad_end[last] = 0x00;
        assert_eq!(Frame::from_bytes(&bad_end), None);

        // Declared length inconsistent with actual size.
        let mut bad_len = good.clone();
        bad_len[1] ^= 0x01;
        assert_eq!(Frame::from_bytes(&bad_len), None);
    }

    #[test]
    fn decoder_resyncs_past_garbage() {
        let frame = Frame::new(1, command::GET_PARAMS_RESPONSE, vec![0xAA, 0xBB]);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x12, 0x68, 0x03]); // noise, including a stray BEGIN
        buf.extend_from_slice(&frame.to_bytes());

        let mut codec = FrameCodec::new();
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_handles_split_delivery() {
        let frame = Frame::new(PANEL_ADDRESS, command::SERVICE, vec![0x01, 0x00]);
        let bytes = frame.to_bytes();
        let (head, tail) = bytes.split_at(6);

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(tail);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn decoder_recovers_frame_after_corrupt_candidate() {
        let frame = Frame::new(1, command::GET_PARAMS_RESPONSE, vec![0x01]);
        let mut corrupted = Frame::new(1, command::GET_PARAMS_RESPONSE, vec![0x02]).to_bytes();
        corrupted[9] ^= 0xFF; // break the CRC of the first frame

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupted);
        buf.extend_from_slice(&frame.to_bytes());

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(codec.invalid_count() > 0);
    }

    #[test]
    fn oversized_declared_length_is_garbage() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[BEGIN_FRAME, 0xFF, 0x7F, 0x00, 0x00]);
        let mut codec = FrameCodec::new();
        // The bogus candidate costs one byte; the rest is rescanned and
        // eventually drained as noise.
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(codec.invalid_count() >= 1);
    }

    #[test]
    fn params_request_layout() {
        assert_eq!(build_params_request(0x0102, 100), vec![100, 0x02, 0x01]);
    }
}
