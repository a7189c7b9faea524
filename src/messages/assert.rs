// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Assert message body.

use std::net::Ipv4Addr;

use bytes::BufMut;

use crate::{DecodeError, SourceGroupPair};

use super::{encoded, Cursor};

/// Assert body: the contested (S,G) and the sender's route metric toward
/// the source. The metric preference is 31 bits; the top bit is the RPT
/// bit, always clear in dense mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertMessage {
    pub group: Ipv4Addr,
    pub group_mask_len: u8,
    pub source: Ipv4Addr,
    pub rpt_bit: bool,
    pub metric_preference: u32,
    pub metric: u32,
}

impl AssertMessage {
    pub fn new(sg: SourceGroupPair, metric_preference: u32, metric: u32) -> Self {
        Self {
            group: sg.group,
            group_mask_len: 32,
            source: sg.source,
            rpt_bit: false,
            metric_preference,
            metric,
        }
    }

    pub fn sg(&self) -> SourceGroupPair {
        SourceGroupPair {
            source: self.source,
            group: self.group,
        }
    }

    pub(crate) fn body_size(&self) -> usize {
        encoded::GROUP_SIZE + encoded::UNICAST_SIZE + 8
    }

    pub(crate) fn encode_body(&self, buf: &mut Vec<u8>) {
        encoded::put_group(buf, self.group, self.group_mask_len);
        encoded::put_unicast(buf, self.source);
        let mut preference = self.metric_preference & 0x7fff_ffff;
        if self.rpt_bit {
            preference |= 0x8000_0000;
        }
        buf.put_u32(preference);
        buf.put_u32(self.metric);
    }

    pub(crate) fn decode_body(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let (group, group_mask_len) = encoded::read_group(cursor)?;
        let source = encoded::read_unicast(cursor)?;
        let raw_preference = cursor.read_u32()?;
        let metric = cursor.read_u32()?;
        Ok(Self {
            group,
            group_mask_len,
            source,
            rpt_bit: raw_preference & 0x8000_0000 != 0,
            metric_preference: raw_preference & 0x7fff_ffff,
            metric,
        })
    }
}
