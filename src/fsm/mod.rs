// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-(S,G) protocol state machines.
//!
//! Four cooperating machines drive the flood-and-prune tree:
//!
//! | Machine | Keyed by | States |
//! |---------|----------|--------|
//! | [`downstream::DownstreamPrune`] | (interface, S, G) | NoInfo, PrunePending, Pruned |
//! | [`upstream::UpstreamMachine`] | (S, G) | Forwarding, Pruned, AckPending |
//! | [`assert::AssertMachine`] | (interface, S, G) | NoInfo, Winner, Loser |
//! | [`origination::OriginationMachine`] | (S, G) | NotOriginator, Originator |
//!
//! Handlers mutate their machine and return the timers to arm or cancel
//! plus what to send; the engine owns packet construction and dispatch.

pub mod assert;
pub mod downstream;
pub mod origination;
pub mod upstream;

pub use assert::{AssertMachine, AssertOutcome, AssertState};
pub use downstream::{DownstreamPrune, PruneState};
pub use origination::{OriginationMachine, OriginationState};
pub use upstream::{GraftPruneState, UpstreamActions, UpstreamMachine, UpstreamSend};

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use crate::{InterfaceId, SourceGroupPair};

/// Assert election metric. The total order makes the *better* metric
/// compare greater: lower metric preference wins, ties broken by lower
/// route metric, remaining ties by higher originating address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssertMetric {
    /// Administrative distance of the unicast protocol (wire: 31 bits)
    pub preference: u32,
    /// Unicast route metric toward the source
    pub metric: u32,
    /// Address of the router advertising this metric (final tie-break)
    pub address: Ipv4Addr,
}

impl AssertMetric {
    pub fn new(preference: u32, metric: u32, address: Ipv4Addr) -> Self {
        Self {
            preference,
            metric,
            address,
        }
    }

    /// The metric advertised when the source is unreachable; loses to any
    /// real metric.
    pub fn infinite(address: Ipv4Addr) -> Self {
        Self {
            preference: u32::MAX,
            metric: u32::MAX,
            address,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.preference == u32::MAX && self.metric == u32::MAX
    }
}

impl Ord for AssertMetric {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .preference
            .cmp(&self.preference)
            .then(other.metric.cmp(&self.metric))
            .then(self.address.cmp(&other.address))
    }
}

impl PartialOrd for AssertMetric {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Owned store for all four machines, indexed by their natural keys.
/// Entries are created lazily on first reference and dropped when the
/// (S,G) is torn down.
#[derive(Debug, Default)]
pub struct SgStore {
    pub downstream: HashMap<(InterfaceId, SourceGroupPair), DownstreamPrune>,
    pub asserts: HashMap<(InterfaceId, SourceGroupPair), AssertMachine>,
    pub upstream: HashMap<SourceGroupPair, UpstreamMachine>,
    pub origination: HashMap<SourceGroupPair, OriginationMachine>,
}

impl SgStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downstream_entry(
        &mut self,
        interface: InterfaceId,
        sg: SourceGroupPair,
    ) -> &mut DownstreamPrune {
        self.downstream
            .entry((interface, sg))
            .or_insert_with(|| DownstreamPrune::new(interface, sg))
    }

    pub fn assert_entry(
        &mut self,
        interface: InterfaceId,
        sg: SourceGroupPair,
    ) -> &mut AssertMachine {
        self.asserts
            .entry((interface, sg))
            .or_insert_with(|| AssertMachine::new(interface, sg))
    }

    pub fn upstream_entry(&mut self, sg: SourceGroupPair) -> &mut UpstreamMachine {
        self.upstream
            .entry(sg)
            .or_insert_with(|| UpstreamMachine::new(sg))
    }

    pub fn origination_entry(&mut self, sg: SourceGroupPair) -> &mut OriginationMachine {
        self.origination
            .entry(sg)
            .or_insert_with(|| OriginationMachine::new(sg))
    }

    /// Interfaces currently Pruned downstream for (S,G)
    pub fn prunes_for(&self, sg: SourceGroupPair) -> BTreeSet<InterfaceId> {
        self.downstream
            .iter()
            .filter(|((_, entry_sg), machine)| {
                *entry_sg == sg && machine.state == PruneState::Pruned
            })
            .map(|((interface, _), _)| *interface)
            .collect()
    }

    /// Interfaces on which we are Assert Loser for (S,G)
    pub fn lost_assert_for(&self, sg: SourceGroupPair) -> BTreeSet<InterfaceId> {
        self.asserts
            .iter()
            .filter(|((_, entry_sg), machine)| {
                *entry_sg == sg && machine.state == AssertState::Loser
            })
            .map(|((interface, _), _)| *interface)
            .collect()
    }

    /// Drop every machine belonging to (S,G)
    pub fn remove_sg(&mut self, sg: SourceGroupPair) {
        self.downstream.retain(|(_, entry_sg), _| *entry_sg != sg);
        self.asserts.retain(|(_, entry_sg), _| *entry_sg != sg);
        self.upstream.remove(&sg);
        self.origination.remove(&sg);
    }
}
