// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM Dense Mode (RFC 3973) multicast routing engine.
//!
//! This crate implements the protocol engine for PIM-DM flood-and-prune
//! multicast routing: the wire codec for the six PIM-DM message types, the
//! per-(source, group) state machines (downstream Prune, upstream
//! Graft/Prune, Assert, Origination/State-Refresh), RPF resolution against a
//! pluggable unicast RIB, and the outgoing-interface-list computation that
//! drives every forwarding decision.
//!
//! ## Architecture
//!
//! The engine is single-threaded and event-driven. State machine handlers
//! are pure with respect to I/O: they consume an event plus an explicit
//! `now: Instant` and return the side effects they want performed (timer
//! requests, outgoing packets, data forwards). An async timer manager and a
//! `Transport` collaborator apply those effects.
//!
//! | Component | Module |
//! |-----------|--------|
//! | Message codec | [`messages`] |
//! | Neighbor & interface manager | [`neighbors`] |
//! | RPF resolver / multicast route cache | [`rib`] |
//! | olist set algebra + local membership | [`olist`] |
//! | Per-(S,G) state machines | [`fsm`] |
//! | Data-plane forwarding decision | [`forwarding`] |
//! | Event dispatch | [`engine`] |
//!
//! ## Key addresses
//!
//! | Address | Purpose |
//! |---------|---------|
//! | 224.0.0.13 | ALL-PIM-ROUTERS (all control messages except unicast Graft/GraftAck) |
//! | IP protocol 103 | PIM packets |

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod engine;
pub mod error;
pub mod forwarding;
pub mod fsm;
pub mod logging;
pub mod messages;
pub mod neighbors;
pub mod olist;
pub mod rib;
pub mod runtime;
pub mod timers;

pub use config::{PimDmConfig, PimInterfaceConfig};
pub use engine::{EngineActions, PimDmEngine, PimDmEvent};
pub use error::{DecodeError, ProtocolError};
pub use messages::PimMessage;

/// All PIM routers multicast address (224.0.0.13)
pub const ALL_PIM_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 13);

/// TTL used for link-local control messages (everything except unicast
/// Graft/GraftAck, which travel with a normal unicast TTL).
pub const CONTROL_TTL: u8 = 1;

/// TTL used for unicast Graft and GraftAck messages.
pub const UNICAST_TTL: u8 = 64;

/// Stable identifier for a PIM-enabled interface, issued by the engine when
/// the interface is brought up. All state tables are keyed by this id rather
/// than by interface name or raw index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(pub u32);

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// Flow identity: a (source, group) pair. Immutable value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceGroupPair {
    /// Unicast source address
    pub source: Ipv4Addr,
    /// Multicast group address
    pub group: Ipv4Addr,
}

impl SourceGroupPair {
    /// Create a new (S,G) pair
    pub fn new(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self { source, group }
    }
}

impl std::fmt::Display for SourceGroupPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.source, self.group)
    }
}

/// Immutable envelope for a received control packet. The envelope is passed
/// by value through the pipeline and never modified; sender/receiver hints
/// live here instead of in mutable per-packet metadata.
#[derive(Debug, Clone)]
pub struct PacketEnvelope {
    /// Interface the packet arrived on
    pub interface: InterfaceId,
    /// IP source address of the sender
    pub sender: Ipv4Addr,
    /// IP destination address (ALL-PIM-ROUTERS or our unicast address)
    pub destination: Ipv4Addr,
    /// Raw PIM payload (header + body)
    pub payload: Vec<u8>,
}

/// An outgoing control packet requested by the engine. `interface == None`
/// means the packet is unicast-routed by the transport (Graft/GraftAck).
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    /// Interface to transmit on, or `None` for unicast routing
    pub interface: Option<InterfaceId>,
    /// IP destination address
    pub destination: Ipv4Addr,
    /// IP TTL to use
    pub ttl: u8,
    /// The message to encode and send
    pub message: PimMessage,
}

impl OutgoingPacket {
    /// Link-local multicast control packet to ALL-PIM-ROUTERS on `interface`
    pub fn on_interface(interface: InterfaceId, message: PimMessage) -> Self {
        Self {
            interface: Some(interface),
            destination: ALL_PIM_ROUTERS,
            ttl: CONTROL_TTL,
            message,
        }
    }

    /// Link-local packet on `interface` with an explicit IP destination
    /// (rate-limited Prunes are addressed to the offending sender).
    pub fn on_interface_to(interface: InterfaceId, destination: Ipv4Addr, message: PimMessage) -> Self {
        Self {
            interface: Some(interface),
            destination,
            ttl: CONTROL_TTL,
            message,
        }
    }

    /// Unicast packet routed by the transport (Graft/GraftAck)
    pub fn unicast(destination: Ipv4Addr, message: PimMessage) -> Self {
        Self {
            interface: None,
            destination,
            ttl: UNICAST_TTL,
            message,
        }
    }
}

/// A data packet the engine decided to forward, with the interfaces to copy
/// it onto.
#[derive(Debug, Clone)]
pub struct DataForward {
    /// Flow identity
    pub sg: SourceGroupPair,
    /// Interfaces to transmit a copy on
    pub out_interfaces: Vec<InterfaceId>,
    /// Original packet payload
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_group_pair_display() {
        let sg = SourceGroupPair::new("10.0.0.1".parse().unwrap(), "239.1.1.1".parse().unwrap());
        assert_eq!(format!("{}", sg), "(10.0.0.1,239.1.1.1)");
    }

    #[test]
    fn test_interface_id_ordering() {
        assert!(InterfaceId(1) < InterfaceId(2));
        assert_eq!(format!("{}", InterfaceId(3)), "if3");
    }

    #[test]
    fn test_outgoing_packet_constructors() {
        let msg = PimMessage::Hello(messages::HelloMessage::default());
        let p = OutgoingPacket::on_interface(InterfaceId(0), msg.clone());
        assert_eq!(p.destination, ALL_PIM_ROUTERS);
        assert_eq!(p.ttl, CONTROL_TTL);
        assert_eq!(p.interface, Some(InterfaceId(0)));

        let u = OutgoingPacket::unicast("192.168.1.1".parse().unwrap(), msg);
        assert_eq!(u.interface, None);
        assert_eq!(u.ttl, UNICAST_TTL);
    }
}
