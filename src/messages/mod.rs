// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Wire codec for PIM version 2 dense-mode messages (RFC 3973).
//!
//! The common header is 4 bytes: 4-bit version, 4-bit type, 8-bit reserved,
//! 16-bit one's-complement checksum computed over the whole PIM payload with
//! the checksum field zeroed.
//!
//! ## Message types
//!
//! | Type | Value | Body |
//! |------|-------|------|
//! | Hello | 0 | option TLVs |
//! | Join/Prune | 3 | upstream neighbor + group entries |
//! | Assert | 5 | group, source, metric tuple |
//! | Graft | 6 | Join/Prune body, unicast to RPF neighbor |
//! | Graft-Ack | 7 | echoed Graft body |
//! | State Refresh | 9 | Assert fields + originator, TTL, P/N/O bits |
//!
//! Decode is total over truncated input: it returns a typed error and never
//! reads past the supplied buffer.

pub mod assert;
pub mod encoded;
pub mod hello;
pub mod join_prune;
pub mod state_refresh;

pub use assert::AssertMessage;
pub use hello::{HelloMessage, HelloOption};
pub use join_prune::{GroupEntry, JoinPruneMessage};
pub use state_refresh::StateRefreshMessage;

use bytes::BufMut;

use crate::DecodeError;

/// PIM protocol version carried in every header
pub const PIM_VERSION: u8 = 2;

/// Common header length in bytes
pub const HEADER_SIZE: usize = 4;

// Message type codes
pub const TYPE_HELLO: u8 = 0;
pub const TYPE_JOIN_PRUNE: u8 = 3;
pub const TYPE_ASSERT: u8 = 5;
pub const TYPE_GRAFT: u8 = 6;
pub const TYPE_GRAFT_ACK: u8 = 7;
pub const TYPE_STATE_REFRESH: u8 = 9;

/// A decoded PIM-DM message. Graft and GraftAck reuse the Join/Prune body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PimMessage {
    /// Neighbor discovery and option negotiation
    Hello(HelloMessage),
    /// Tree maintenance toward an upstream neighbor
    JoinPrune(JoinPruneMessage),
    /// Forwarder election on a shared link
    Assert(AssertMessage),
    /// Re-attach a pruned branch (unicast to the RPF neighbor)
    Graft(JoinPruneMessage),
    /// Acknowledgement of a Graft (echoed body)
    GraftAck(JoinPruneMessage),
    /// Periodic re-announcement of prune state
    StateRefresh(StateRefreshMessage),
}

impl PimMessage {
    /// Wire type code for this message
    pub fn message_type(&self) -> u8 {
        match self {
            PimMessage::Hello(_) => TYPE_HELLO,
            PimMessage::JoinPrune(_) => TYPE_JOIN_PRUNE,
            PimMessage::Assert(_) => TYPE_ASSERT,
            PimMessage::Graft(_) => TYPE_GRAFT,
            PimMessage::GraftAck(_) => TYPE_GRAFT_ACK,
            PimMessage::StateRefresh(_) => TYPE_STATE_REFRESH,
        }
    }

    /// Message type as a display string
    pub fn type_name(&self) -> &'static str {
        match self {
            PimMessage::Hello(_) => "Hello",
            PimMessage::JoinPrune(_) => "Join/Prune",
            PimMessage::Assert(_) => "Assert",
            PimMessage::Graft(_) => "Graft",
            PimMessage::GraftAck(_) => "Graft-Ack",
            PimMessage::StateRefresh(_) => "State-Refresh",
        }
    }

    /// Exact encoded length in bytes
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + match self {
                PimMessage::Hello(m) => m.body_size(),
                PimMessage::JoinPrune(m) | PimMessage::Graft(m) | PimMessage::GraftAck(m) => {
                    m.body_size()
                }
                PimMessage::Assert(m) => m.body_size(),
                PimMessage::StateRefresh(m) => m.body_size(),
            }
    }

    /// Encode to wire bytes, with the header checksum filled in
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.put_u8((PIM_VERSION << 4) | self.message_type());
        buf.put_u8(0); // Reserved
        buf.put_u16(0); // Checksum placeholder

        match self {
            PimMessage::Hello(m) => m.encode_body(&mut buf),
            PimMessage::JoinPrune(m) | PimMessage::Graft(m) | PimMessage::GraftAck(m) => {
                m.encode_body(&mut buf)
            }
            PimMessage::Assert(m) => m.encode_body(&mut buf),
            PimMessage::StateRefresh(m) => m.encode_body(&mut buf),
        }

        let checksum = checksum(&buf);
        buf[2] = (checksum >> 8) as u8;
        buf[3] = (checksum & 0xff) as u8;
        buf
    }

    /// Decode wire bytes. Verifies the version, checksum, and type before
    /// touching the body.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::TruncatedMessage {
                needed: HEADER_SIZE,
                remaining: data.len(),
            });
        }
        let version = data[0] >> 4;
        if version != PIM_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let message_type = data[0] & 0x0f;
        let found = u16::from_be_bytes([data[2], data[3]]);
        let computed = checksum_with_zeroed_field(data);
        if computed != found {
            return Err(DecodeError::ChecksumMismatch { computed, found });
        }

        let mut cursor = Cursor::new(&data[HEADER_SIZE..]);
        let message = match message_type {
            TYPE_HELLO => PimMessage::Hello(HelloMessage::decode_body(&mut cursor)?),
            TYPE_JOIN_PRUNE => PimMessage::JoinPrune(JoinPruneMessage::decode_body(&mut cursor)?),
            TYPE_ASSERT => PimMessage::Assert(AssertMessage::decode_body(&mut cursor)?),
            TYPE_GRAFT => PimMessage::Graft(JoinPruneMessage::decode_body(&mut cursor)?),
            TYPE_GRAFT_ACK => PimMessage::GraftAck(JoinPruneMessage::decode_body(&mut cursor)?),
            TYPE_STATE_REFRESH => {
                PimMessage::StateRefresh(StateRefreshMessage::decode_body(&mut cursor)?)
            }
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(message)
    }
}

/// IP-style 16-bit one's-complement checksum over the buffer
pub fn checksum(data: &[u8]) -> u16 {
    fold_sum(sum_words(data, None))
}

/// Checksum with the header checksum field (bytes 2..4) treated as zero
fn checksum_with_zeroed_field(data: &[u8]) -> u16 {
    fold_sum(sum_words(data, Some(2)))
}

fn sum_words(data: &[u8], skip_word_at: Option<usize>) -> u32 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < data.len() {
        if Some(i) == skip_word_at {
            i += 2;
            continue;
        }
        let word = if i + 1 < data.len() {
            u16::from_be_bytes([data[i], data[i + 1]])
        } else {
            (data[i] as u16) << 8
        };
        sum = sum.wrapping_add(word as u32);
        i += 2;
    }
    sum
}

fn fold_sum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Bounds-checked read cursor over a message body. Every read reports how
/// many bytes it wanted when the buffer runs out.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            Err(DecodeError::TruncatedMessage {
                needed: n,
                remaining: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_ipv4(&mut self) -> Result<std::net::Ipv4Addr, DecodeError> {
        self.need(4)?;
        let v = std::net::Ipv4Addr::new(
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        );
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_zero_buffer() {
        // All-zero buffer sums to zero, complement is 0xffff
        assert_eq!(checksum(&[0, 0, 0, 0]), 0xffff);
    }

    #[test]
    fn test_checksum_odd_length() {
        // Odd trailing byte is padded as the high octet
        let even = checksum(&[0x12, 0x34, 0xab, 0x00]);
        let odd = checksum(&[0x12, 0x34, 0xab]);
        assert_eq!(even, odd);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let err = PimMessage::decode(&[0x20, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedMessage { .. }));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut data = PimMessage::Hello(HelloMessage::default()).encode();
        data[0] = (1 << 4) | TYPE_HELLO;
        // Version check happens before checksum verification
        let err = PimMessage::decode(&data).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedVersion(1));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        // Type 12 with a correct checksum must fail with UnknownType
        let mut data = vec![(PIM_VERSION << 4) | 12, 0, 0, 0];
        let c = checksum(&data);
        data[2] = (c >> 8) as u8;
        data[3] = (c & 0xff) as u8;
        let err = PimMessage::decode(&data).unwrap_err();
        assert_eq!(err, DecodeError::UnknownType(12));
    }

    #[test]
    fn test_decode_rejects_corrupted_checksum() {
        let mut data = PimMessage::Hello(HelloMessage::default()).encode();
        data[3] ^= 0x01;
        let err = PimMessage::decode(&data).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_encode_size_matches_serialized_size() {
        let message = PimMessage::Hello(HelloMessage::build(
            105,
            Some((500, 2500)),
            0xdeadbeef,
            Some((1, 60)),
        ));
        assert_eq!(message.encode().len(), message.serialized_size());
    }
}
