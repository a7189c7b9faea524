// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Data-plane forwarding decision.
//!
//! Pure function of the RPF cache, the upstream prune state, and the
//! current olist. The engine applies the decision: copying the payload,
//! sending the rate-limited Prune on an RPF failure, and feeding the
//! Assert machine when data shows up on a downstream interface.

use std::collections::BTreeSet;

use crate::InterfaceId;

/// Why a packet was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No unicast route toward the source
    RpfUnresolved,
    /// Upstream machine is Pruned; we are off the tree
    UpstreamPruned,
    /// olist is empty
    NoOutgoingInterfaces,
}

/// Outcome of the RPF check plus olist lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Copy the packet onto these interfaces
    Forward(Vec<InterfaceId>),
    /// Drop silently
    Drop(DropReason),
    /// Arrived on a non-RPF interface: drop, and (rate-limited) prune the
    /// sender. The assert machine on the arrival interface also reacts.
    RpfFailure,
}

/// Decide what to do with a data packet for (S,G) arriving on `arrival`.
/// `olist` is the already-computed forwarding set (RPF interface removed).
pub fn decide(
    arrival: InterfaceId,
    rpf_interface: Option<InterfaceId>,
    upstream_pruned: bool,
    olist: &BTreeSet<InterfaceId>,
) -> ForwardDecision {
    let Some(rpf) = rpf_interface else {
        return ForwardDecision::Drop(DropReason::RpfUnresolved);
    };
    if arrival != rpf {
        return ForwardDecision::RpfFailure;
    }
    if upstream_pruned {
        return ForwardDecision::Drop(DropReason::UpstreamPruned);
    }
    if olist.is_empty() {
        return ForwardDecision::Drop(DropReason::NoOutgoingInterfaces);
    }
    ForwardDecision::Forward(olist.iter().copied().collect())
}
