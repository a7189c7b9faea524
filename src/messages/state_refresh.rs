// SPDX-License-Identifier: Apache-2.0 OR MIT
//! State Refresh message body.

use std::net::Ipv4Addr;

use bytes::BufMut;

use crate::{DecodeError, SourceGroupPair};

use super::{encoded, Cursor};

/// State Refresh body: originated by the first-hop router on the source's
/// subnet and propagated hop by hop down the broadcast tree, refreshing
/// downstream prune state without waiting for data to flood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRefreshMessage {
    pub group: Ipv4Addr,
    pub group_mask_len: u8,
    pub source: Ipv4Addr,
    /// Address of the first-hop router that originated the refresh
    pub originator: Ipv4Addr,
    pub rpt_bit: bool,
    /// Route metric toward the source at the forwarding router
    pub metric_preference: u32,
    pub metric: u32,
    /// Mask length of the route toward the source
    pub mask_len: u8,
    /// Decremented at each hop; the message stops propagating at zero
    pub ttl: u8,
    /// Set when the forwarding router's upstream state is pruned
    pub prune_indicator: bool,
    /// Set to make downstream routers restart their prune timers now
    pub prune_now: bool,
    /// Set to solicit a re-election where assert state was lost
    pub assert_override: bool,
    /// Seconds between refreshes at the originator
    pub interval_secs: u8,
}

impl StateRefreshMessage {
    pub fn sg(&self) -> SourceGroupPair {
        SourceGroupPair {
            source: self.source,
            group: self.group,
        }
    }

    pub(crate) fn body_size(&self) -> usize {
        encoded::GROUP_SIZE + 2 * encoded::UNICAST_SIZE + 12
    }

    pub(crate) fn encode_body(&self, buf: &mut Vec<u8>) {
        encoded::put_group(buf, self.group, self.group_mask_len);
        encoded::put_unicast(buf, self.source);
        encoded::put_unicast(buf, self.originator);
        let mut preference = self.metric_preference & 0x7fff_ffff;
        if self.rpt_bit {
            preference |= 0x8000_0000;
        }
        buf.put_u32(preference);
        buf.put_u32(self.metric);
        buf.put_u8(self.mask_len);
        buf.put_u8(self.ttl);
        let mut flags = 0u8;
        if self.prune_indicator {
            flags |= 0x80;
        }
        if self.prune_now {
            flags |= 0x40;
        }
        if self.assert_override {
            flags |= 0x20;
        }
        buf.put_u8(flags);
        buf.put_u8(self.interval_secs);
    }

    pub(crate) fn decode_body(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let (group, group_mask_len) = encoded::read_group(cursor)?;
        let source = encoded::read_unicast(cursor)?;
        let originator = encoded::read_unicast(cursor)?;
        let raw_preference = cursor.read_u32()?;
        let metric = cursor.read_u32()?;
        let mask_len = cursor.read_u8()?;
        let ttl = cursor.read_u8()?;
        let flags = cursor.read_u8()?;
        let interval_secs = cursor.read_u8()?;
        Ok(Self {
            group,
            group_mask_len,
            source,
            originator,
            rpt_bit: raw_preference & 0x8000_0000 != 0,
            metric_preference: raw_preference & 0x7fff_ffff,
            metric,
            mask_len,
            ttl,
            prune_indicator: flags & 0x80 != 0,
            prune_now: flags & 0x40 != 0,
            assert_override: flags & 0x20 != 0,
            interval_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PimMessage;

    fn sample() -> StateRefreshMessage {
        StateRefreshMessage {
            group: Ipv4Addr::new(239, 1, 1, 1),
            group_mask_len: 32,
            source: Ipv4Addr::new(192, 0, 2, 1),
            originator: Ipv4Addr::new(10, 0, 0, 1),
            rpt_bit: false,
            metric_preference: 101,
            metric: 20,
            mask_len: 24,
            ttl: 16,
            prune_indicator: true,
            prune_now: false,
            assert_override: true,
            interval_secs: 60,
        }
    }

    #[test]
    fn test_state_refresh_roundtrip() {
        let message = sample();
        let data = PimMessage::StateRefresh(message.clone()).encode();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(
            PimMessage::decode(&data).unwrap(),
            PimMessage::StateRefresh(message)
        );
    }

    #[test]
    fn test_flag_bits() {
        let message = sample();
        let data = PimMessage::StateRefresh(message).encode();
        // Flags byte sits second from last: P set, N clear, O set
        let flags = data[data.len() - 2];
        assert_eq!(flags, 0x80 | 0x20);
    }
}
