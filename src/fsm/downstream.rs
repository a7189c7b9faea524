// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Downstream Prune state machine.
//!
//! One machine per (interface, S, G). A Prune addressed to us opens a
//! prune-pending window during which any overheard Join cancels the
//! prune; only when the window closes does the interface actually leave
//! the olist.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::timers::{TimerRequest, TimerType};
use crate::{InterfaceId, SourceGroupPair};

/// Downstream prune state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PruneState {
    #[default]
    NoInfo,
    /// Prune received, override window open
    PrunePending,
    /// Prune in effect; the interface is out of the olist
    Pruned,
}

/// What the prune-pending expiry asks the engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingExpiry {
    /// The machine moved to Pruned; re-evaluate the upstream machine
    pub became_pruned: bool,
    /// Echo the Prune on the interface (multi-access reliability)
    pub echo_prune: bool,
}

#[derive(Debug)]
pub struct DownstreamPrune {
    pub interface: InterfaceId,
    pub sg: SourceGroupPair,
    pub state: PruneState,
    /// Downstream neighbor whose Prune last drove this machine; cleared
    /// with the prune itself
    pub pruner: Option<Ipv4Addr>,
    /// Holdtime from the most recent Prune, applied when Pruned
    holdtime: Duration,
}

impl DownstreamPrune {
    pub fn new(interface: InterfaceId, sg: SourceGroupPair) -> Self {
        Self {
            interface,
            sg,
            state: PruneState::NoInfo,
            pruner: None,
            holdtime: Duration::ZERO,
        }
    }

    fn pending_type(&self) -> TimerType {
        TimerType::PrunePending {
            interface: self.interface,
            sg: self.sg,
        }
    }

    fn expiry_type(&self) -> TimerType {
        TimerType::PruneExpiry {
            interface: self.interface,
            sg: self.sg,
        }
    }

    /// A Prune addressed to us arrived from `from`. `pending_delay` is
    /// zero on a link with a single neighbor, otherwise the caller-drawn
    /// randomized delay.
    pub fn received_prune(
        &mut self,
        from: Ipv4Addr,
        pending_delay: Duration,
        holdtime: Duration,
        now: Instant,
    ) -> Vec<TimerRequest> {
        self.pruner = Some(from);
        self.holdtime = holdtime;
        match self.state {
            PruneState::NoInfo => {
                self.state = PruneState::PrunePending;
                vec![TimerRequest {
                    timer_type: self.pending_type(),
                    fire_at: now + pending_delay,
                    replace_existing: false,
                }]
            }
            // Window already open; the new holdtime applies when it closes
            PruneState::PrunePending => Vec::new(),
            PruneState::Pruned => {
                // Refresh of an established prune
                vec![TimerRequest {
                    timer_type: self.expiry_type(),
                    fire_at: now + holdtime,
                    replace_existing: true,
                }]
            }
        }
    }

    /// Prune-pending window closed. `echo` requests a Prune echo, granted
    /// only on multi-access links.
    pub fn pending_expired(&mut self, echo: bool, now: Instant) -> (PendingExpiry, Vec<TimerRequest>) {
        match self.state {
            PruneState::PrunePending => {
                self.state = PruneState::Pruned;
                let timers = vec![TimerRequest {
                    timer_type: self.expiry_type(),
                    fire_at: now + self.holdtime,
                    replace_existing: false,
                }];
                (
                    PendingExpiry {
                        became_pruned: true,
                        echo_prune: echo,
                    },
                    timers,
                )
            }
            // Stale expiry after a cancel race; leave state alone
            _ => (
                PendingExpiry {
                    became_pruned: false,
                    echo_prune: false,
                },
                Vec::new(),
            ),
        }
    }

    /// Prune lifetime ran out; back to NoInfo
    pub fn prune_expired(&mut self) -> bool {
        if self.state == PruneState::Pruned {
            self.state = PruneState::NoInfo;
            self.pruner = None;
            true
        } else {
            false
        }
    }

    /// A matching Join or Graft cancels the prune outright. Returns the
    /// timers to cancel; empty when there was nothing to cancel.
    pub fn received_join_or_graft(&mut self) -> Vec<TimerType> {
        let cancels = match self.state {
            PruneState::NoInfo => Vec::new(),
            PruneState::PrunePending => vec![self.pending_type()],
            PruneState::Pruned => vec![self.expiry_type()],
        };
        self.state = PruneState::NoInfo;
        self.pruner = None;
        cancels
    }

    /// A State-Refresh with the Prune-Now bit restarts the prune lifetime
    pub fn refresh_prune(&mut self, holdtime: Duration, now: Instant) -> Vec<TimerRequest> {
        if self.state == PruneState::Pruned {
            self.holdtime = holdtime;
            vec![TimerRequest {
                timer_type: self.expiry_type(),
                fire_at: now + holdtime,
                replace_existing: true,
            }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> DownstreamPrune {
        DownstreamPrune::new(
            InterfaceId(1),
            SourceGroupPair::new("192.0.2.1".parse().unwrap(), "239.1.1.1".parse().unwrap()),
        )
    }

    fn pruner() -> Ipv4Addr {
        "10.0.0.2".parse().unwrap()
    }

    #[test]
    fn test_prune_then_pending_then_pruned() {
        let mut m = machine();
        let now = Instant::now();

        let timers = m.received_prune(pruner(), Duration::from_millis(800), Duration::from_secs(210), now);
        assert_eq!(m.state, PruneState::PrunePending);
        assert_eq!(timers.len(), 1);
        assert!(matches!(timers[0].timer_type, TimerType::PrunePending { .. }));

        let (expiry, timers) = m.pending_expired(true, now + Duration::from_millis(800));
        assert!(expiry.became_pruned);
        assert!(expiry.echo_prune);
        assert_eq!(m.state, PruneState::Pruned);
        // Prune lifetime uses the holdtime from the Prune
        assert_eq!(
            timers[0].fire_at,
            now + Duration::from_millis(800) + Duration::from_secs(210)
        );
    }

    #[test]
    fn test_join_cancels_pending() {
        let mut m = machine();
        let now = Instant::now();
        m.received_prune(pruner(), Duration::ZERO, Duration::from_secs(210), now);

        let cancels = m.received_join_or_graft();
        assert_eq!(m.state, PruneState::NoInfo);
        assert!(matches!(cancels[0], TimerType::PrunePending { .. }));

        // Late expiry after the cancel does nothing
        let (expiry, timers) = m.pending_expired(false, now);
        assert!(!expiry.became_pruned);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_graft_cancels_established_prune() {
        let mut m = machine();
        let now = Instant::now();
        m.received_prune(pruner(), Duration::ZERO, Duration::from_secs(210), now);
        m.pending_expired(false, now);
        assert_eq!(m.state, PruneState::Pruned);

        let cancels = m.received_join_or_graft();
        assert_eq!(m.state, PruneState::NoInfo);
        assert!(matches!(cancels[0], TimerType::PruneExpiry { .. }));
    }

    #[test]
    fn test_repeat_prune_refreshes_lifetime() {
        let mut m = machine();
        let now = Instant::now();
        m.received_prune(pruner(), Duration::ZERO, Duration::from_secs(210), now);
        m.pending_expired(false, now);

        let timers = m.received_prune(pruner(), Duration::ZERO, Duration::from_secs(100), now);
        assert_eq!(m.state, PruneState::Pruned);
        assert!(timers[0].replace_existing);
        assert_eq!(timers[0].fire_at, now + Duration::from_secs(100));
    }

    #[test]
    fn test_prune_expiry_returns_to_noinfo() {
        let mut m = machine();
        let now = Instant::now();
        m.received_prune(pruner(), Duration::ZERO, Duration::from_secs(210), now);
        m.pending_expired(false, now);

        assert!(m.prune_expired());
        assert_eq!(m.state, PruneState::NoInfo);
        assert!(!m.prune_expired());
    }
}
