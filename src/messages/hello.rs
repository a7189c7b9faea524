// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Hello message body: a sequence of option TLVs.

use bytes::BufMut;

use crate::DecodeError;

use super::Cursor;

/// Hold Time option type
pub const OPTION_HOLDTIME: u16 = 1;

/// LAN Prune Delay option type
pub const OPTION_LAN_PRUNE_DELAY: u16 = 2;

/// Generation ID option type
pub const OPTION_GENERATION_ID: u16 = 20;

/// State Refresh Capable option type
pub const OPTION_STATE_REFRESH_CAPABLE: u16 = 21;

/// Hold time that tears down the neighbor immediately (a goodbye)
pub const HOLDTIME_GOODBYE: u16 = 0;

/// Hold time meaning the neighbor never expires
pub const HOLDTIME_FOREVER: u16 = 0xffff;

/// A single Hello option. Unrecognized options are carried opaquely so they
/// survive re-encoding and can be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloOption {
    /// Seconds to keep the neighbor alive without another Hello
    HoldTime(u16),
    /// LAN prune delay negotiation; the T bit requests join suppression
    /// be disabled
    LanPruneDelay {
        t_bit: bool,
        propagation_delay_ms: u16,
        override_interval_ms: u16,
    },
    /// Random value regenerated on every restart
    GenerationId(u32),
    /// Version and interval of the State Refresh the sender originates
    StateRefreshCapable { version: u8, interval_secs: u8 },
    /// Option this implementation does not interpret
    Unknown { option_type: u16, data: Vec<u8> },
}

impl HelloOption {
    fn value_len(&self) -> usize {
        match self {
            HelloOption::HoldTime(_) => 2,
            HelloOption::LanPruneDelay { .. } => 4,
            HelloOption::GenerationId(_) => 4,
            HelloOption::StateRefreshCapable { .. } => 4,
            HelloOption::Unknown { data, .. } => data.len(),
        }
    }

    fn option_type(&self) -> u16 {
        match self {
            HelloOption::HoldTime(_) => OPTION_HOLDTIME,
            HelloOption::LanPruneDelay { .. } => OPTION_LAN_PRUNE_DELAY,
            HelloOption::GenerationId(_) => OPTION_GENERATION_ID,
            HelloOption::StateRefreshCapable { .. } => OPTION_STATE_REFRESH_CAPABLE,
            HelloOption::Unknown { option_type, .. } => *option_type,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16(self.option_type());
        buf.put_u16(self.value_len() as u16);
        match self {
            HelloOption::HoldTime(secs) => buf.put_u16(*secs),
            HelloOption::LanPruneDelay {
                t_bit,
                propagation_delay_ms,
                override_interval_ms,
            } => {
                let mut delay = propagation_delay_ms & 0x7fff;
                if *t_bit {
                    delay |= 0x8000;
                }
                buf.put_u16(delay);
                buf.put_u16(*override_interval_ms);
            }
            HelloOption::GenerationId(id) => buf.put_u32(*id),
            HelloOption::StateRefreshCapable {
                version,
                interval_secs,
            } => {
                buf.put_u8(*version);
                buf.put_u8(*interval_secs);
                buf.put_u16(0); // Reserved
            }
            HelloOption::Unknown { data, .. } => buf.put_slice(data),
        }
    }

    fn decode(option_type: u16, value: &[u8]) -> Self {
        // A known type with an unexpected length is kept opaque rather
        // than misparsed.
        match (option_type, value.len()) {
            (OPTION_HOLDTIME, 2) => {
                HelloOption::HoldTime(u16::from_be_bytes([value[0], value[1]]))
            }
            (OPTION_LAN_PRUNE_DELAY, 4) => {
                let raw = u16::from_be_bytes([value[0], value[1]]);
                HelloOption::LanPruneDelay {
                    t_bit: raw & 0x8000 != 0,
                    propagation_delay_ms: raw & 0x7fff,
                    override_interval_ms: u16::from_be_bytes([value[2], value[3]]),
                }
            }
            (OPTION_GENERATION_ID, 4) => HelloOption::GenerationId(u32::from_be_bytes([
                value[0], value[1], value[2], value[3],
            ])),
            (OPTION_STATE_REFRESH_CAPABLE, 4) => HelloOption::StateRefreshCapable {
                version: value[0],
                interval_secs: value[1],
            },
            _ => HelloOption::Unknown {
                option_type,
                data: value.to_vec(),
            },
        }
    }
}

/// Hello message body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelloMessage {
    pub options: Vec<HelloOption>,
}

impl HelloMessage {
    /// Build the Hello this router sends: hold time, optional LAN prune
    /// delay pair in milliseconds, generation ID, and optional State
    /// Refresh capability as (version, interval seconds).
    pub fn build(
        holdtime_secs: u16,
        lan_prune_delay_ms: Option<(u16, u16)>,
        generation_id: u32,
        state_refresh: Option<(u8, u8)>,
    ) -> Self {
        let mut options = vec![HelloOption::HoldTime(holdtime_secs)];
        if let Some((propagation_delay_ms, override_interval_ms)) = lan_prune_delay_ms {
            options.push(HelloOption::LanPruneDelay {
                t_bit: false,
                propagation_delay_ms,
                override_interval_ms,
            });
        }
        options.push(HelloOption::GenerationId(generation_id));
        if let Some((version, interval_secs)) = state_refresh {
            options.push(HelloOption::StateRefreshCapable {
                version,
                interval_secs,
            });
        }
        Self { options }
    }

    /// The Hello announcing departure: hold time zero and nothing else
    pub fn goodbye() -> Self {
        Self {
            options: vec![HelloOption::HoldTime(HOLDTIME_GOODBYE)],
        }
    }

    /// First Hold Time option, if present
    pub fn holdtime(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            HelloOption::HoldTime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// First Generation ID option, if present
    pub fn generation_id(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            HelloOption::GenerationId(id) => Some(*id),
            _ => None,
        })
    }

    /// First LAN Prune Delay option as (propagation delay ms, override
    /// interval ms), if present
    pub fn lan_prune_delay(&self) -> Option<(u16, u16)> {
        self.options.iter().find_map(|opt| match opt {
            HelloOption::LanPruneDelay {
                propagation_delay_ms,
                override_interval_ms,
                ..
            } => Some((*propagation_delay_ms, *override_interval_ms)),
            _ => None,
        })
    }

    /// First State Refresh Capable option as (version, interval seconds),
    /// if present
    pub fn state_refresh_capable(&self) -> Option<(u8, u8)> {
        self.options.iter().find_map(|opt| match opt {
            HelloOption::StateRefreshCapable {
                version,
                interval_secs,
            } => Some((*version, *interval_secs)),
            _ => None,
        })
    }

    pub(crate) fn body_size(&self) -> usize {
        self.options.iter().map(|opt| 4 + opt.value_len()).sum()
    }

    pub(crate) fn encode_body(&self, buf: &mut Vec<u8>) {
        for option in &self.options {
            option.encode(buf);
        }
    }

    pub(crate) fn decode_body(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let mut options = Vec::new();
        while cursor.remaining() > 0 {
            let option_type = cursor.read_u16()?;
            let length = cursor.read_u16()? as usize;
            let value = cursor.read_bytes(length)?;
            options.push(HelloOption::decode(option_type, value));
        }
        Ok(Self { options })
    }
}
