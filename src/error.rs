// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Error taxonomy for the protocol engine.
//!
//! Anything derived from received bytes or unicast-RIB answers is reported
//! through these types. Malformed input is dropped by the caller with a log
//! entry; unmodeled protocol input becomes a recoverable
//! [`ProtocolError::InvariantViolation`] that leaves state unchanged instead
//! of aborting the process.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::InterfaceId;

/// Failure to decode a received PIM message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ended before the message did
    #[error("truncated message: needed {needed} more bytes, {remaining} available")]
    TruncatedMessage {
        /// Bytes the decoder tried to read
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Recomputed checksum disagrees with the header checksum
    #[error("checksum mismatch: computed {computed:#06x}, header carries {found:#06x}")]
    ChecksumMismatch {
        /// Checksum computed over the payload with the field zeroed
        computed: u16,
        /// Checksum found in the header
        found: u16,
    },

    /// Declared message type is not one of the six PIM-DM types
    #[error("unknown PIM message type {0}")]
    UnknownType(u8),

    /// PIM version field is not 2
    #[error("unsupported PIM version {0}")]
    UnsupportedVersion(u8),

    /// Encoded address block uses a family/encoding we do not speak
    #[error("unsupported address encoding: family {family}, encoding type {encoding}")]
    UnsupportedEncoding {
        /// Address family octet
        family: u8,
        /// Encoding type octet
        encoding: u8,
    },
}

/// Engine-level protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A received packet failed to decode
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An event arrived for a state combination outside the documented
    /// transition tables. Recoverable: log and leave state unchanged.
    #[error("protocol invariant violated: {0}")]
    InvariantViolation(String),

    /// The unicast RIB has no route toward the source; the operation is
    /// deferred and retried after GraftRetryPeriod.
    #[error("no unicast route toward {0}")]
    RpfUnresolved(Ipv4Addr),

    /// An event referenced an interface id the engine never issued
    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let e = DecodeError::ChecksumMismatch {
            computed: 0xbeef,
            found: 0xdead,
        };
        let s = format!("{}", e);
        assert!(s.contains("0xbeef"));
        assert!(s.contains("0xdead"));

        let t = DecodeError::TruncatedMessage {
            needed: 8,
            remaining: 3,
        };
        assert!(format!("{}", t).contains("8"));
    }

    #[test]
    fn test_protocol_error_from_decode() {
        let e: ProtocolError = DecodeError::UnknownType(12).into();
        assert!(matches!(
            e,
            ProtocolError::Decode(DecodeError::UnknownType(12))
        ));
    }
}
