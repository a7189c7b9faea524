// SPDX-License-Identifier: Apache-2.0 OR MIT
//! RPF resolution against a pluggable unicast RIB, and the multicast
//! route cache.
//!
//! The cache is the single source of truth for the upstream interface and
//! next hop of every active source. Handlers read one resolved value at
//! entry; re-resolution happens only between handler invocations, in the
//! periodic RPF-check sweep.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::{InterfaceId, SourceGroupPair};

/// A unicast route toward some destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnicastRoute {
    /// Outbound interface
    pub interface: InterfaceId,
    /// Next-hop router address; our own address when directly connected
    pub next_hop: Ipv4Addr,
    /// Whether the destination is on a directly attached subnet
    pub directly_connected: bool,
}

/// Capability interface over the platform's unicast routing table. The
/// concrete routing protocol (static, OSPF, anything) implements this; the
/// engine never inspects the protocol itself.
pub trait UnicastRib {
    /// Route toward `destination`, or `None` when unreachable
    fn route_to(&self, destination: Ipv4Addr) -> Option<UnicastRoute>;

    /// Administrative distance of the protocol that owns the route out of
    /// `interface`; the first Assert comparison key
    fn metric_preference(&self, interface: InterfaceId) -> u32;

    /// Route metric toward `destination` out of `interface`; the second
    /// Assert comparison key
    fn route_metric(&self, interface: InterfaceId, destination: Ipv4Addr) -> u32;
}

/// Cached RPF answer for one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RpfEntry {
    pub interface: InterfaceId,
    pub next_hop: Ipv4Addr,
    pub directly_connected: bool,
}

/// How a re-resolution changed a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpfChange {
    Unchanged,
    /// The route moved; the old entry is attached so upstream timers bound
    /// to the previous (interface, next hop) pair can be cancelled
    Moved { old: Option<RpfEntry>, new: RpfEntry },
    /// The source became unreachable
    Lost { old: Option<RpfEntry> },
}

/// Multicast route cache: group -> source -> RPF entry
#[derive(Debug, Default)]
pub struct RoutingMulticastTable {
    groups: BTreeMap<Ipv4Addr, BTreeMap<Ipv4Addr, Option<RpfEntry>>>,
}

/// Serializable dump of the cache for diagnostics
#[derive(Debug, Serialize)]
pub struct MulticastEntry {
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
    pub rpf: Option<RpfEntry>,
}

impl RoutingMulticastTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cached RPF entry for (S,G), unresolved sources included
    pub fn rpf(&self, sg: SourceGroupPair) -> Option<RpfEntry> {
        self.groups
            .get(&sg.group)
            .and_then(|sources| sources.get(&sg.source))
            .copied()
            .flatten()
    }

    /// Whether (S,G) is tracked at all
    pub fn contains(&self, sg: SourceGroupPair) -> bool {
        self.groups
            .get(&sg.group)
            .map(|sources| sources.contains_key(&sg.source))
            .unwrap_or(false)
    }

    /// Start tracking (S,G) and resolve it immediately
    pub fn register(&mut self, sg: SourceGroupPair, rib: &dyn UnicastRib) -> Option<RpfEntry> {
        let entry = Self::resolve(rib, sg.source);
        self.groups
            .entry(sg.group)
            .or_default()
            .insert(sg.source, entry);
        entry
    }

    /// Stop tracking (S,G)
    pub fn unregister(&mut self, sg: SourceGroupPair) {
        if let Some(sources) = self.groups.get_mut(&sg.group) {
            sources.remove(&sg.source);
            if sources.is_empty() {
                self.groups.remove(&sg.group);
            }
        }
    }

    /// Re-resolve one (S,G) and report what changed
    pub fn refresh(&mut self, sg: SourceGroupPair, rib: &dyn UnicastRib) -> RpfChange {
        let new = Self::resolve(rib, sg.source);
        let slot = self.groups.entry(sg.group).or_default().entry(sg.source);
        let slot = slot.or_insert(None);
        let old = *slot;
        *slot = new;
        match (old, new) {
            (old_entry, Some(new_entry)) if old_entry != Some(new_entry) => RpfChange::Moved {
                old: old_entry,
                new: new_entry,
            },
            (Some(old_entry), None) => RpfChange::Lost {
                old: Some(old_entry),
            },
            _ => RpfChange::Unchanged,
        }
    }

    /// All tracked (S,G) pairs
    pub fn pairs(&self) -> Vec<SourceGroupPair> {
        self.groups
            .iter()
            .flat_map(|(group, sources)| {
                sources.keys().map(|source| SourceGroupPair {
                    source: *source,
                    group: *group,
                })
            })
            .collect()
    }

    /// Diagnostic dump, sorted by (group, source)
    pub fn dump(&self) -> Vec<MulticastEntry> {
        self.groups
            .iter()
            .flat_map(|(group, sources)| {
                sources.iter().map(|(source, rpf)| MulticastEntry {
                    group: *group,
                    source: *source,
                    rpf: *rpf,
                })
            })
            .collect()
    }

    fn resolve(rib: &dyn UnicastRib, source: Ipv4Addr) -> Option<RpfEntry> {
        rib.route_to(source).map(|route| RpfEntry {
            interface: route.interface,
            next_hop: route.next_hop,
            directly_connected: route.directly_connected,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// In-memory RIB for tests: routes and metrics are set explicitly.
    #[derive(Debug, Default)]
    pub struct StaticRib {
        pub routes: HashMap<Ipv4Addr, UnicastRoute>,
        pub preference: u32,
        pub metric: u32,
    }

    impl StaticRib {
        pub fn with_route(
            destination: Ipv4Addr,
            interface: InterfaceId,
            next_hop: Ipv4Addr,
        ) -> Self {
            let mut rib = Self {
                preference: 101,
                metric: 20,
                ..Self::default()
            };
            rib.routes.insert(
                destination,
                UnicastRoute {
                    interface,
                    next_hop,
                    directly_connected: false,
                },
            );
            rib
        }
    }

    impl UnicastRib for StaticRib {
        fn route_to(&self, destination: Ipv4Addr) -> Option<UnicastRoute> {
            self.routes.get(&destination).copied()
        }

        fn metric_preference(&self, _interface: InterfaceId) -> u32 {
            self.preference
        }

        fn route_metric(&self, _interface: InterfaceId, _destination: Ipv4Addr) -> u32 {
            self.metric
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticRib;
    use super::*;

    fn sg() -> SourceGroupPair {
        SourceGroupPair::new("192.0.2.1".parse().unwrap(), "239.1.1.1".parse().unwrap())
    }

    #[test]
    fn test_register_resolves_immediately() {
        let rib = StaticRib::with_route(
            "192.0.2.1".parse().unwrap(),
            InterfaceId(1),
            "10.0.0.9".parse().unwrap(),
        );
        let mut table = RoutingMulticastTable::new();
        let entry = table.register(sg(), &rib).unwrap();
        assert_eq!(entry.interface, InterfaceId(1));
        assert_eq!(entry.next_hop, "10.0.0.9".parse::<Ipv4Addr>().unwrap());
        assert_eq!(table.rpf(sg()), Some(entry));
    }

    #[test]
    fn test_unresolved_source_is_tracked() {
        let rib = StaticRib::default();
        let mut table = RoutingMulticastTable::new();
        assert!(table.register(sg(), &rib).is_none());
        assert!(table.contains(sg()));
        assert_eq!(table.rpf(sg()), None);
    }

    #[test]
    fn test_refresh_reports_move() {
        let mut rib = StaticRib::with_route(
            "192.0.2.1".parse().unwrap(),
            InterfaceId(1),
            "10.0.0.9".parse().unwrap(),
        );
        let mut table = RoutingMulticastTable::new();
        let old = table.register(sg(), &rib).unwrap();

        assert_eq!(table.refresh(sg(), &rib), RpfChange::Unchanged);

        rib.routes.insert(
            "192.0.2.1".parse().unwrap(),
            UnicastRoute {
                interface: InterfaceId(2),
                next_hop: "10.0.1.9".parse().unwrap(),
                directly_connected: false,
            },
        );
        match table.refresh(sg(), &rib) {
            RpfChange::Moved {
                old: Some(previous),
                new,
            } => {
                assert_eq!(previous, old);
                assert_eq!(new.interface, InterfaceId(2));
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_refresh_reports_loss() {
        let mut rib = StaticRib::with_route(
            "192.0.2.1".parse().unwrap(),
            InterfaceId(1),
            "10.0.0.9".parse().unwrap(),
        );
        let mut table = RoutingMulticastTable::new();
        table.register(sg(), &rib);

        rib.routes.clear();
        assert!(matches!(
            table.refresh(sg(), &rib),
            RpfChange::Lost { old: Some(_) }
        ));
        assert_eq!(table.rpf(sg()), None);
    }

    #[test]
    fn test_unregister_drops_empty_group() {
        let rib = StaticRib::default();
        let mut table = RoutingMulticastTable::new();
        table.register(sg(), &rib);
        table.unregister(sg());
        assert!(!table.contains(sg()));
        assert!(table.dump().is_empty());
    }
}
