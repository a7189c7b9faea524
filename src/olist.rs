// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Outgoing-interface-list computation.
//!
//! The olist is a pure function of the neighbor table, downstream prune
//! state, local membership, lost-assert set, and administrative boundaries:
//!
//! ```text
//! immediate_olist(S,G) = ( pim_nbrs - prunes(S,G) )
//!                      U ( include(*,G) - exclude(S,G) )
//!                      U include(S,G)
//!                      - lost_assert(S,G) - boundary(G)
//! olist(S,G) = immediate_olist(S,G) - { RPF_interface(S) }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use crate::{InterfaceId, SourceGroupPair};

/// Local receiver membership, fed by manual registration rather than IGMP.
/// `include(*,G)` admits every source of a group; `exclude(S,G)` carves a
/// source out of a wildcard membership; `include(S,G)` admits one source.
#[derive(Debug, Default)]
pub struct LocalMembership {
    include_any: HashMap<Ipv4Addr, BTreeSet<InterfaceId>>,
    include: HashMap<SourceGroupPair, BTreeSet<InterfaceId>>,
    exclude: HashMap<SourceGroupPair, BTreeSet<InterfaceId>>,
}

impl LocalMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver on `interface`; `source == None` is (*,G)
    pub fn register(&mut self, source: Option<Ipv4Addr>, group: Ipv4Addr, interface: InterfaceId) {
        match source {
            None => {
                self.include_any.entry(group).or_default().insert(interface);
            }
            Some(source) => {
                self.include
                    .entry(SourceGroupPair::new(source, group))
                    .or_default()
                    .insert(interface);
            }
        }
    }

    /// Remove a previously registered receiver
    pub fn unregister(
        &mut self,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
        interface: InterfaceId,
    ) {
        match source {
            None => {
                if let Some(set) = self.include_any.get_mut(&group) {
                    set.remove(&interface);
                    if set.is_empty() {
                        self.include_any.remove(&group);
                    }
                }
            }
            Some(source) => {
                let sg = SourceGroupPair::new(source, group);
                if let Some(set) = self.include.get_mut(&sg) {
                    set.remove(&interface);
                    if set.is_empty() {
                        self.include.remove(&sg);
                    }
                }
            }
        }
    }

    /// Exclude one source from a wildcard membership on `interface`
    pub fn exclude(&mut self, sg: SourceGroupPair, interface: InterfaceId) {
        self.exclude.entry(sg).or_default().insert(interface);
    }

    /// Undo an exclusion
    pub fn unexclude(&mut self, sg: SourceGroupPair, interface: InterfaceId) {
        if let Some(set) = self.exclude.get_mut(&sg) {
            set.remove(&interface);
            if set.is_empty() {
                self.exclude.remove(&sg);
            }
        }
    }

    fn include_any_for(&self, group: Ipv4Addr) -> BTreeSet<InterfaceId> {
        self.include_any.get(&group).cloned().unwrap_or_default()
    }

    fn include_for(&self, sg: SourceGroupPair) -> BTreeSet<InterfaceId> {
        self.include.get(&sg).cloned().unwrap_or_default()
    }

    fn exclude_for(&self, sg: SourceGroupPair) -> BTreeSet<InterfaceId> {
        self.exclude.get(&sg).cloned().unwrap_or_default()
    }

    /// Whether any receiver (wildcard or source-specific) wants (S,G) on
    /// `interface`
    pub fn wants(&self, sg: SourceGroupPair, interface: InterfaceId) -> bool {
        if self.include_for(sg).contains(&interface) {
            return true;
        }
        self.include_any_for(sg.group).contains(&interface)
            && !self.exclude_for(sg).contains(&interface)
    }
}

/// Non-membership inputs to the olist computation, borrowed from the
/// engine's state tables for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct OlistInputs<'a> {
    /// Interfaces with at least one live PIM neighbor
    pub pim_nbrs: &'a BTreeSet<InterfaceId>,
    /// Interfaces currently Pruned downstream for this (S,G)
    pub prunes: &'a BTreeSet<InterfaceId>,
    /// Interfaces on which we lost an Assert for this (S,G)
    pub lost_assert: &'a BTreeSet<InterfaceId>,
    /// Administrative boundary interfaces for this group
    pub boundary: &'a BTreeSet<InterfaceId>,
}

/// The olist before RPF removal
pub fn immediate_olist(
    sg: SourceGroupPair,
    membership: &LocalMembership,
    inputs: OlistInputs<'_>,
) -> BTreeSet<InterfaceId> {
    let neighbor_part: BTreeSet<InterfaceId> =
        inputs.pim_nbrs.difference(inputs.prunes).copied().collect();
    let wildcard_part: BTreeSet<InterfaceId> = membership
        .include_any_for(sg.group)
        .difference(&membership.exclude_for(sg))
        .copied()
        .collect();

    let mut set = neighbor_part;
    set.extend(wildcard_part);
    set.extend(membership.include_for(sg));
    set.retain(|interface| {
        !inputs.lost_assert.contains(interface) && !inputs.boundary.contains(interface)
    });
    set
}

/// The forwarding set: the immediate olist minus the RPF interface
pub fn olist(
    sg: SourceGroupPair,
    membership: &LocalMembership,
    inputs: OlistInputs<'_>,
    rpf_interface: Option<InterfaceId>,
) -> BTreeSet<InterfaceId> {
    let mut set = immediate_olist(sg, membership, inputs);
    if let Some(rpf) = rpf_interface {
        set.remove(&rpf);
    }
    set
}
