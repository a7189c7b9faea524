// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Join/Prune message body, shared by Graft and Graft-Ack.

use std::net::Ipv4Addr;

use bytes::BufMut;

use crate::{DecodeError, SourceGroupPair};

use super::{encoded, Cursor};

/// One group entry: the joined and pruned source lists for a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub group: Ipv4Addr,
    pub group_mask_len: u8,
    pub joined: Vec<Ipv4Addr>,
    pub pruned: Vec<Ipv4Addr>,
}

impl GroupEntry {
    fn size(&self) -> usize {
        encoded::GROUP_SIZE + 4 + encoded::SOURCE_SIZE * (self.joined.len() + self.pruned.len())
    }
}

/// Join/Prune body: an upstream neighbor, a hold time, and per-group
/// source lists. Grafts and Graft-Acks carry the same layout with the
/// hold time ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPruneMessage {
    /// The neighbor this message is addressed to, even when multicast
    pub upstream_neighbor: Ipv4Addr,
    /// Seconds the receiver should hold the prune state
    pub holdtime_secs: u16,
    pub groups: Vec<GroupEntry>,
}

impl JoinPruneMessage {
    /// A single-source join
    pub fn join(upstream_neighbor: Ipv4Addr, sg: SourceGroupPair) -> Self {
        Self::single(upstream_neighbor, sg, 0, true)
    }

    /// A single-source prune with the given hold time
    pub fn prune(upstream_neighbor: Ipv4Addr, sg: SourceGroupPair, holdtime_secs: u16) -> Self {
        Self::single(upstream_neighbor, sg, holdtime_secs, false)
    }

    fn single(
        upstream_neighbor: Ipv4Addr,
        sg: SourceGroupPair,
        holdtime_secs: u16,
        join: bool,
    ) -> Self {
        let (joined, pruned) = if join {
            (vec![sg.source], Vec::new())
        } else {
            (Vec::new(), vec![sg.source])
        };
        Self {
            upstream_neighbor,
            holdtime_secs,
            groups: vec![GroupEntry {
                group: sg.group,
                group_mask_len: 32,
                joined,
                pruned,
            }],
        }
    }

    /// All (S,G) pairs on the joined side
    pub fn joins(&self) -> impl Iterator<Item = SourceGroupPair> + '_ {
        self.groups.iter().flat_map(|entry| {
            entry.joined.iter().map(move |source| SourceGroupPair {
                source: *source,
                group: entry.group,
            })
        })
    }

    /// All (S,G) pairs on the pruned side
    pub fn prunes(&self) -> impl Iterator<Item = SourceGroupPair> + '_ {
        self.groups.iter().flat_map(|entry| {
            entry.pruned.iter().map(move |source| SourceGroupPair {
                source: *source,
                group: entry.group,
            })
        })
    }

    pub(crate) fn body_size(&self) -> usize {
        encoded::UNICAST_SIZE + 4 + self.groups.iter().map(GroupEntry::size).sum::<usize>()
    }

    pub(crate) fn encode_body(&self, buf: &mut Vec<u8>) {
        encoded::put_unicast(buf, self.upstream_neighbor);
        buf.put_u8(0); // Reserved
        buf.put_u8(self.groups.len() as u8);
        buf.put_u16(self.holdtime_secs);
        for entry in &self.groups {
            encoded::put_group(buf, entry.group, entry.group_mask_len);
            buf.put_u16(entry.joined.len() as u16);
            buf.put_u16(entry.pruned.len() as u16);
            for source in &entry.joined {
                encoded::put_source(buf, *source, 32);
            }
            for source in &entry.pruned {
                encoded::put_source(buf, *source, 32);
            }
        }
    }

    pub(crate) fn decode_body(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let upstream_neighbor = encoded::read_unicast(cursor)?;
        cursor.read_u8()?; // Reserved
        let group_count = cursor.read_u8()? as usize;
        let holdtime_secs = cursor.read_u16()?;

        let mut groups = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            let (group, group_mask_len) = encoded::read_group(cursor)?;
            let joined_count = cursor.read_u16()? as usize;
            let pruned_count = cursor.read_u16()? as usize;
            let mut joined = Vec::with_capacity(joined_count);
            for _ in 0..joined_count {
                let (source, _) = encoded::read_source(cursor)?;
                joined.push(source);
            }
            let mut pruned = Vec::with_capacity(pruned_count);
            for _ in 0..pruned_count {
                let (source, _) = encoded::read_source(cursor)?;
                pruned.push(source);
            }
            groups.push(GroupEntry {
                group,
                group_mask_len,
                joined,
                pruned,
            });
        }
        Ok(Self {
            upstream_neighbor,
            holdtime_secs,
            groups,
        })
    }
}
