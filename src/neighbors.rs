// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Hello protocol: per-interface neighbor tables, generation-ID restart
//! detection, and LAN Prune Delay negotiation.
//!
//! The manager is pure with respect to I/O. Handlers take an explicit `now`
//! and return the Hello to send and/or timer requests; the engine turns
//! those into packets and timer commands.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::PimInterfaceConfig;
use crate::logging::{Facility, Logger};
use crate::messages::hello::{HOLDTIME_FOREVER, HOLDTIME_GOODBYE};
use crate::messages::HelloMessage;
use crate::timers::{TimerRequest, TimerType};
use crate::{log_debug, log_info, log_notice};
use crate::{InterfaceId, ProtocolError};

/// State Refresh protocol version this router advertises
pub const STATE_REFRESH_VERSION: u8 = 1;

/// A PIM neighbor learned from Hello
#[derive(Debug, Clone)]
pub struct NeighborState {
    /// Neighbor's link-local source address
    pub address: Ipv4Addr,
    /// Last seen generation ID, if the neighbor sent one
    pub generation_id: Option<u32>,
    /// Advertised hold time; `None` means the neighbor never expires
    pub holdtime: Option<Duration>,
    /// Advertised LAN Prune Delay pair, if the neighbor sent the option
    pub lan_prune_delay: Option<(Duration, Duration)>,
    /// State Refresh interval the neighbor advertised, if capable
    pub refresh_interval: Option<Duration>,
    /// When the last Hello arrived
    pub last_hello: Instant,
}

impl NeighborState {
    fn from_hello(
        address: Ipv4Addr,
        hello: &HelloMessage,
        default_holdtime: Duration,
        now: Instant,
    ) -> Self {
        let holdtime = match hello.holdtime() {
            Some(HOLDTIME_FOREVER) => None,
            Some(secs) => Some(Duration::from_secs(secs as u64)),
            None => Some(default_holdtime),
        };
        Self {
            address,
            generation_id: hello.generation_id(),
            holdtime,
            lan_prune_delay: hello.lan_prune_delay().map(|(delay_ms, override_ms)| {
                (
                    Duration::from_millis(delay_ms as u64),
                    Duration::from_millis(override_ms as u64),
                )
            }),
            refresh_interval: hello
                .state_refresh_capable()
                .map(|(_, secs)| Duration::from_secs(secs as u64)),
            last_hello: now,
        }
    }
}

/// Per-interface aggregate: our own Hello parameters plus the neighbor
/// table and the negotiated LAN-wide values.
#[derive(Debug)]
pub struct NeighborhoodStatus {
    /// Interface id issued at enable time
    pub interface: InterfaceId,
    /// Operating-system interface name (config key)
    pub name: String,
    /// Our address on this interface
    pub local_address: Ipv4Addr,
    /// Interface configuration
    pub config: PimInterfaceConfig,
    /// Our generation ID, regenerated per process start
    pub generation_id: u32,
    /// State Refresh interval advertised in our Hello, in seconds
    pub refresh_interval_secs: u8,
    /// Live neighbors keyed by address
    pub neighbors: HashMap<Ipv4Addr, NeighborState>,
    /// Whether every live neighbor advertised LAN Prune Delay
    pub lan_delay_enabled: bool,
    /// LAN-wide propagation delay (maximum across routers)
    pub propagation_delay: Duration,
    /// LAN-wide override interval (maximum across routers)
    pub override_interval: Duration,
}

impl NeighborhoodStatus {
    /// The Hello this interface sends
    pub fn hello(&self) -> HelloMessage {
        let refresh = self
            .config
            .state_refresh_capable
            .then_some((STATE_REFRESH_VERSION, self.refresh_interval_secs));
        HelloMessage::build(
            self.config.hello_holdtime.as_secs().min(u16::MAX as u64) as u16,
            Some((
                self.config.propagation_delay.as_millis() as u16,
                self.config.override_interval.as_millis() as u16,
            )),
            self.generation_id,
            refresh,
        )
    }

    // LAN-wide maxima per RFC 3973 §4.3.3/4.3.4: the negotiated values are
    // the largest advertised on the link, ours included, and apply only
    // when every router advertised the option.
    fn renegotiate(&mut self) {
        let all_advertised = self
            .neighbors
            .values()
            .all(|n| n.lan_prune_delay.is_some());
        self.lan_delay_enabled = all_advertised;
        let mut propagation_delay = self.config.propagation_delay;
        let mut override_interval = self.config.override_interval;
        if all_advertised {
            for neighbor in self.neighbors.values() {
                if let Some((delay, override_i)) = neighbor.lan_prune_delay {
                    propagation_delay = propagation_delay.max(delay);
                    override_interval = override_interval.max(override_i);
                }
            }
        }
        self.propagation_delay = propagation_delay;
        self.override_interval = override_interval;
    }
}

/// What a received Hello did to the neighbor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    /// First Hello from this (neighbor, interface) pair
    NewNeighbor,
    /// Known neighbor, unchanged generation ID
    Refreshed,
    /// Known neighbor with a changed generation ID: the neighbor restarted
    Restarted,
    /// Hold time zero: the neighbor announced departure
    Goodbye,
}

/// Result of processing a received Hello
#[derive(Debug)]
pub struct HelloReaction {
    pub outcome: HelloOutcome,
    pub timers: Vec<TimerRequest>,
    pub cancels: Vec<TimerType>,
}

/// Diagnostic snapshot of one neighbor
#[derive(Debug, Serialize)]
pub struct NeighborSummary {
    pub interface: String,
    pub address: Ipv4Addr,
    pub generation_id: Option<u32>,
    pub holdtime_secs: Option<u64>,
    pub state_refresh_capable: bool,
}

/// Owner of all per-interface neighbor state. Interface ids are issued
/// here and never reused.
pub struct NeighborManager {
    interfaces: HashMap<InterfaceId, NeighborhoodStatus>,
    next_id: u32,
    logger: Logger,
}

impl NeighborManager {
    pub fn new(logger: Logger) -> Self {
        Self {
            interfaces: HashMap::new(),
            next_id: 0,
            logger,
        }
    }

    /// Bring an interface up. `first_hello_delay` is the caller-drawn
    /// jitter in `[0, TriggeredHelloDelay]`; the periodic Hello starts one
    /// period out. `refresh_interval_secs` is the engine-wide State-Refresh
    /// interval advertised in our Hello.
    #[allow(clippy::too_many_arguments)]
    pub fn enable_interface(
        &mut self,
        name: &str,
        local_address: Ipv4Addr,
        config: PimInterfaceConfig,
        generation_id: u32,
        refresh_interval_secs: u8,
        first_hello_delay: Duration,
        now: Instant,
    ) -> (InterfaceId, Vec<TimerRequest>) {
        let interface = InterfaceId(self.next_id);
        self.next_id += 1;

        let status = NeighborhoodStatus {
            interface,
            name: name.to_string(),
            local_address,
            propagation_delay: config.propagation_delay,
            override_interval: config.override_interval,
            refresh_interval_secs,
            config,
            generation_id,
            neighbors: HashMap::new(),
            lan_delay_enabled: true,
        };
        let hello_period = status.config.hello_period;
        self.interfaces.insert(interface, status);

        log_info!(
            self.logger,
            Facility::Hello,
            "interface {} ({}) enabled, local address {}",
            interface,
            name,
            local_address
        );

        let timers = vec![
            TimerRequest {
                timer_type: TimerType::TriggeredHello { interface },
                fire_at: now + first_hello_delay,
                replace_existing: false,
            },
            TimerRequest {
                timer_type: TimerType::Hello { interface },
                fire_at: now + hello_period,
                replace_existing: false,
            },
        ];
        (interface, timers)
    }

    /// Take an interface down: returns the goodbye Hello to send and the
    /// timers to cancel. All neighbors are dropped.
    pub fn disable_interface(
        &mut self,
        interface: InterfaceId,
    ) -> Option<(HelloMessage, Vec<TimerType>)> {
        let status = self.interfaces.remove(&interface)?;
        let mut cancels = vec![
            TimerType::Hello { interface },
            TimerType::TriggeredHello { interface },
        ];
        for neighbor in status.neighbors.keys() {
            cancels.push(TimerType::NeighborExpiry {
                interface,
                neighbor: *neighbor,
            });
        }
        log_info!(
            self.logger,
            Facility::Hello,
            "interface {} ({}) disabled",
            interface,
            status.name
        );
        Some((HelloMessage::goodbye(), cancels))
    }

    pub fn interface(&self, interface: InterfaceId) -> Option<&NeighborhoodStatus> {
        self.interfaces.get(&interface)
    }

    pub fn interface_ids(&self) -> impl Iterator<Item = InterfaceId> + '_ {
        self.interfaces.keys().copied()
    }

    /// Our address on `interface`
    pub fn local_address(&self, interface: InterfaceId) -> Option<Ipv4Addr> {
        self.interfaces.get(&interface).map(|s| s.local_address)
    }

    /// Whether `address` is a live neighbor on `interface`
    pub fn is_neighbor(&self, interface: InterfaceId, address: Ipv4Addr) -> bool {
        self.interfaces
            .get(&interface)
            .map(|s| s.neighbors.contains_key(&address))
            .unwrap_or(false)
    }

    /// Live neighbor count on `interface`
    pub fn neighbor_count(&self, interface: InterfaceId) -> usize {
        self.interfaces
            .get(&interface)
            .map(|s| s.neighbors.len())
            .unwrap_or(0)
    }

    /// Interfaces with at least one live neighbor (the `pim_nbrs` set)
    pub fn pim_nbrs(&self) -> BTreeSet<InterfaceId> {
        self.interfaces
            .iter()
            .filter(|(_, s)| !s.neighbors.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Periodic Hello fired: emit a Hello and re-arm the period
    pub fn hello_timer_fired(
        &mut self,
        interface: InterfaceId,
        now: Instant,
    ) -> Result<(HelloMessage, TimerRequest), ProtocolError> {
        let status = self
            .interfaces
            .get(&interface)
            .ok_or(ProtocolError::UnknownInterface(interface))?;
        let request = TimerRequest {
            timer_type: TimerType::Hello { interface },
            fire_at: now + status.config.hello_period,
            replace_existing: false,
        };
        Ok((status.hello(), request))
    }

    /// Triggered (jittered) Hello fired; the periodic timer is untouched
    pub fn triggered_hello_fired(
        &self,
        interface: InterfaceId,
    ) -> Result<HelloMessage, ProtocolError> {
        self.interfaces
            .get(&interface)
            .map(|s| s.hello())
            .ok_or(ProtocolError::UnknownInterface(interface))
    }

    /// Process a received Hello. The engine reacts to the outcome:
    /// `NewNeighbor` and `Restarted` warrant a triggered Hello (and, for
    /// `Restarted`, State-Refresh replays ordered after it).
    pub fn received_hello(
        &mut self,
        interface: InterfaceId,
        sender: Ipv4Addr,
        hello: &HelloMessage,
        now: Instant,
    ) -> Result<HelloReaction, ProtocolError> {
        let status = self
            .interfaces
            .get_mut(&interface)
            .ok_or(ProtocolError::UnknownInterface(interface))?;

        let expiry_type = TimerType::NeighborExpiry {
            interface,
            neighbor: sender,
        };

        if hello.holdtime() == Some(HOLDTIME_GOODBYE) {
            let known = status.neighbors.remove(&sender).is_some();
            status.renegotiate();
            if known {
                log_notice!(
                    self.logger,
                    Facility::Hello,
                    "neighbor {} on {} said goodbye",
                    sender,
                    interface
                );
            }
            return Ok(HelloReaction {
                outcome: HelloOutcome::Goodbye,
                timers: Vec::new(),
                cancels: if known { vec![expiry_type] } else { Vec::new() },
            });
        }

        let default_holdtime = status.config.hello_holdtime;
        let fresh = NeighborState::from_hello(sender, hello, default_holdtime, now);
        let outcome = match status.neighbors.get(&sender) {
            None => HelloOutcome::NewNeighbor,
            Some(existing) => {
                let restarted = matches!(
                    (existing.generation_id, fresh.generation_id),
                    (Some(old), Some(new)) if old != new
                );
                if restarted {
                    HelloOutcome::Restarted
                } else {
                    HelloOutcome::Refreshed
                }
            }
        };

        match outcome {
            HelloOutcome::NewNeighbor => {
                log_notice!(
                    self.logger,
                    Facility::Hello,
                    "new neighbor {} on {}",
                    sender,
                    interface
                );
            }
            HelloOutcome::Restarted => {
                log_notice!(
                    self.logger,
                    Facility::Hello,
                    "neighbor {} on {} restarted (generation ID changed)",
                    sender,
                    interface
                );
            }
            _ => {
                log_debug!(
                    self.logger,
                    Facility::Hello,
                    "hello refresh from {} on {}",
                    sender,
                    interface
                );
            }
        }

        let holdtime = fresh.holdtime;
        status.neighbors.insert(sender, fresh);
        status.renegotiate();

        let mut timers = Vec::new();
        let mut cancels = Vec::new();
        match holdtime {
            Some(holdtime) => timers.push(TimerRequest {
                timer_type: expiry_type,
                fire_at: now + holdtime,
                replace_existing: true,
            }),
            // Infinite holdtime: no expiry, drop any armed one
            None => cancels.push(expiry_type),
        }

        Ok(HelloReaction {
            outcome,
            timers,
            cancels,
        })
    }

    /// Liveness timer expired: drop the neighbor. The engine clears Assert
    /// winners recorded for it and re-evaluates upstream machines.
    pub fn neighbor_expired(
        &mut self,
        interface: InterfaceId,
        neighbor: Ipv4Addr,
    ) -> Option<NeighborState> {
        let status = self.interfaces.get_mut(&interface)?;
        let removed = status.neighbors.remove(&neighbor);
        if removed.is_some() {
            status.renegotiate();
            log_notice!(
                self.logger,
                Facility::Hello,
                "neighbor {} on {} expired",
                neighbor,
                interface
            );
        }
        removed
    }

    /// Diagnostic dump of every neighbor
    pub fn dump(&self) -> Vec<NeighborSummary> {
        let mut summaries: Vec<NeighborSummary> = self
            .interfaces
            .values()
            .flat_map(|status| {
                status.neighbors.values().map(|n| NeighborSummary {
                    interface: status.name.clone(),
                    address: n.address,
                    generation_id: n.generation_id,
                    holdtime_secs: n.holdtime.map(|d| d.as_secs()),
                    state_refresh_capable: n.refresh_interval.is_some(),
                })
            })
            .collect();
        summaries.sort_by(|a, b| (&a.interface, a.address).cmp(&(&b.interface, b.address)));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_interface() -> (NeighborManager, InterfaceId, Instant) {
        let mut manager = NeighborManager::new(Logger::disabled());
        let now = Instant::now();
        let (interface, timers) = manager.enable_interface(
            "eth0",
            Ipv4Addr::new(10, 0, 0, 1),
            PimInterfaceConfig::default(),
            0xaaaa_0001,
            60,
            Duration::from_secs(2),
            now,
        );
        assert_eq!(timers.len(), 2);
        (manager, interface, now)
    }

    fn hello_from(generation_id: u32) -> HelloMessage {
        HelloMessage::build(105, Some((500, 2500)), generation_id, Some((1, 60)))
    }

    #[test]
    fn test_new_neighbor_then_refresh() {
        let (mut manager, interface, now) = manager_with_interface();
        let sender = Ipv4Addr::new(10, 0, 0, 2);

        let reaction = manager
            .received_hello(interface, sender, &hello_from(7), now)
            .unwrap();
        assert_eq!(reaction.outcome, HelloOutcome::NewNeighbor);
        assert_eq!(reaction.timers.len(), 1);
        assert!(manager.is_neighbor(interface, sender));
        assert_eq!(manager.neighbor_count(interface), 1);

        let reaction = manager
            .received_hello(interface, sender, &hello_from(7), now + Duration::from_secs(30))
            .unwrap();
        assert_eq!(reaction.outcome, HelloOutcome::Refreshed);
        // Liveness timer is replaced, not double-armed
        assert!(reaction.timers[0].replace_existing);
    }

    #[test]
    fn test_generation_id_change_is_restart() {
        let (mut manager, interface, now) = manager_with_interface();
        let sender = Ipv4Addr::new(10, 0, 0, 2);
        manager
            .received_hello(interface, sender, &hello_from(7), now)
            .unwrap();

        let reaction = manager
            .received_hello(interface, sender, &hello_from(8), now + Duration::from_secs(1))
            .unwrap();
        assert_eq!(reaction.outcome, HelloOutcome::Restarted);
        // The entry is recreated with the new generation ID
        let stored = &manager.interface(interface).unwrap().neighbors[&sender];
        assert_eq!(stored.generation_id, Some(8));
    }

    #[test]
    fn test_goodbye_removes_neighbor() {
        let (mut manager, interface, now) = manager_with_interface();
        let sender = Ipv4Addr::new(10, 0, 0, 2);
        manager
            .received_hello(interface, sender, &hello_from(7), now)
            .unwrap();

        let reaction = manager
            .received_hello(interface, sender, &HelloMessage::goodbye(), now)
            .unwrap();
        assert_eq!(reaction.outcome, HelloOutcome::Goodbye);
        assert_eq!(
            reaction.cancels,
            vec![TimerType::NeighborExpiry {
                interface,
                neighbor: sender
            }]
        );
        assert!(!manager.is_neighbor(interface, sender));
    }

    #[test]
    fn test_lan_delay_negotiates_maximum() {
        let (mut manager, interface, now) = manager_with_interface();
        // Neighbor advertises larger values than our 500/2500 defaults
        let hello = HelloMessage::build(105, Some((900, 4000)), 1, None);
        manager
            .received_hello(interface, Ipv4Addr::new(10, 0, 0, 2), &hello, now)
            .unwrap();

        let status = manager.interface(interface).unwrap();
        assert!(status.lan_delay_enabled);
        assert_eq!(status.propagation_delay, Duration::from_millis(900));
        assert_eq!(status.override_interval, Duration::from_millis(4000));
    }

    #[test]
    fn test_lan_delay_disabled_when_option_missing() {
        let (mut manager, interface, now) = manager_with_interface();
        let hello = HelloMessage::build(105, None, 1, None);
        manager
            .received_hello(interface, Ipv4Addr::new(10, 0, 0, 2), &hello, now)
            .unwrap();

        let status = manager.interface(interface).unwrap();
        assert!(!status.lan_delay_enabled);
        // Falls back to our configured defaults
        assert_eq!(status.propagation_delay, Duration::from_millis(500));
        assert_eq!(status.override_interval, Duration::from_millis(2500));
    }

    #[test]
    fn test_infinite_holdtime_cancels_expiry() {
        let (mut manager, interface, now) = manager_with_interface();
        let sender = Ipv4Addr::new(10, 0, 0, 2);
        let hello = HelloMessage::build(0xffff, None, 1, None);
        let reaction = manager.received_hello(interface, sender, &hello, now).unwrap();
        assert!(reaction.timers.is_empty());
        assert_eq!(
            reaction.cancels,
            vec![TimerType::NeighborExpiry {
                interface,
                neighbor: sender
            }]
        );
        assert!(manager.is_neighbor(interface, sender));
    }

    #[test]
    fn test_neighbor_expiry_and_pim_nbrs() {
        let (mut manager, interface, now) = manager_with_interface();
        let sender = Ipv4Addr::new(10, 0, 0, 2);
        manager
            .received_hello(interface, sender, &hello_from(7), now)
            .unwrap();
        assert_eq!(manager.pim_nbrs(), BTreeSet::from([interface]));

        let removed = manager.neighbor_expired(interface, sender).unwrap();
        assert_eq!(removed.address, sender);
        assert!(manager.pim_nbrs().is_empty());
        // Expiring an already-gone neighbor is a no-op
        assert!(manager.neighbor_expired(interface, sender).is_none());
    }

    #[test]
    fn test_disable_interface_returns_goodbye_and_cancels() {
        let (mut manager, interface, now) = manager_with_interface();
        manager
            .received_hello(interface, Ipv4Addr::new(10, 0, 0, 2), &hello_from(7), now)
            .unwrap();

        let (goodbye, cancels) = manager.disable_interface(interface).unwrap();
        assert_eq!(goodbye.holdtime(), Some(0));
        assert_eq!(cancels.len(), 3);
        assert!(manager.interface(interface).is_none());
    }

    #[test]
    fn test_hello_carries_our_options() {
        let (manager, interface, _) = manager_with_interface();
        let hello = manager.interface(interface).unwrap().hello();
        assert_eq!(hello.holdtime(), Some(105));
        assert_eq!(hello.generation_id(), Some(0xaaaa_0001));
        assert_eq!(hello.lan_prune_delay(), Some((500, 2500)));
        assert!(hello.state_refresh_capable().is_some());
    }
}
