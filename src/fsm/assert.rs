// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Assert state machine: per-(interface, S, G) forwarder election on
//! shared links.
//!
//! Receiving data on a downstream interface means some other router is
//! also forwarding there; both advertise their unicast metric toward the
//! source and the better metric (see [`AssertMetric`](super::AssertMetric))
//! keeps forwarding while the loser prunes itself.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::AssertMetric;
use crate::timers::{TimerRequest, TimerType};
use crate::{InterfaceId, SourceGroupPair};

/// Assert election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssertState {
    #[default]
    NoInfo,
    /// We are the elected forwarder on this interface
    Winner,
    /// Another router with a better metric forwards here
    Loser,
}

/// Side effects of one assert transition
#[derive(Debug, Default)]
pub struct AssertOutcome {
    /// Announce our own metric in an Assert on this interface
    pub send_assert: bool,
    /// Send a Prune to the new winner (only when we could have asserted)
    pub prune_winner: Option<Ipv4Addr>,
    pub timers: Vec<TimerRequest>,
    pub cancels: Vec<TimerType>,
    /// The lost-assert set changed; recompute the olist and re-evaluate
    /// the upstream machine
    pub state_changed: bool,
}

#[derive(Debug)]
pub struct AssertMachine {
    pub interface: InterfaceId,
    pub sg: SourceGroupPair,
    pub state: AssertState,
    /// Recorded winner metric: ours while Winner, theirs while Loser
    pub winner: Option<AssertMetric>,
}

impl AssertMachine {
    pub fn new(interface: InterfaceId, sg: SourceGroupPair) -> Self {
        Self {
            interface,
            sg,
            state: AssertState::NoInfo,
            winner: None,
        }
    }

    fn timer_type(&self) -> TimerType {
        TimerType::Assert {
            interface: self.interface,
            sg: self.sg,
        }
    }

    /// Data for (S,G) arrived on this downstream interface. With no assert
    /// in progress we become Winner unconditionally and announce.
    pub fn data_arrived(
        &mut self,
        my_metric: AssertMetric,
        assert_time: Duration,
        now: Instant,
    ) -> Option<AssertOutcome> {
        match self.state {
            AssertState::NoInfo => {
                self.state = AssertState::Winner;
                self.winner = Some(my_metric);
                Some(AssertOutcome {
                    send_assert: true,
                    prune_winner: None,
                    timers: vec![TimerRequest {
                        timer_type: self.timer_type(),
                        fire_at: now + assert_time,
                        replace_existing: false,
                    }],
                    cancels: Vec::new(),
                    state_changed: false,
                })
            }
            AssertState::Winner => {
                // Still contested; re-announce and extend
                Some(AssertOutcome {
                    send_assert: true,
                    prune_winner: None,
                    timers: vec![TimerRequest {
                        timer_type: self.timer_type(),
                        fire_at: now + assert_time,
                        replace_existing: true,
                    }],
                    cancels: Vec::new(),
                    state_changed: false,
                })
            }
            AssertState::Loser => None,
        }
    }

    /// An Assert (or the assert-relevant part of a State-Refresh) arrived
    /// on this interface. `hold` is `AssertTime`, or three refresh
    /// intervals when learned from a State-Refresh. `could_assert` gates
    /// the Prune sent to a new winner.
    pub fn received_metric(
        &mut self,
        received: AssertMetric,
        my_metric: AssertMetric,
        could_assert: bool,
        hold: Duration,
        now: Instant,
    ) -> AssertOutcome {
        if received.address == my_metric.address {
            // Our own assert looped back
            return AssertOutcome::default();
        }

        if my_metric > received {
            match self.state {
                AssertState::NoInfo => {
                    self.state = AssertState::Winner;
                    self.winner = Some(my_metric);
                    AssertOutcome {
                        send_assert: true,
                        prune_winner: None,
                        timers: vec![TimerRequest {
                            timer_type: self.timer_type(),
                            fire_at: now + hold,
                            replace_existing: false,
                        }],
                        cancels: Vec::new(),
                        state_changed: false,
                    }
                }
                AssertState::Winner => AssertOutcome {
                    send_assert: true,
                    prune_winner: None,
                    timers: vec![TimerRequest {
                        timer_type: self.timer_type(),
                        fire_at: now + hold,
                        replace_existing: true,
                    }],
                    cancels: Vec::new(),
                    state_changed: false,
                },
                AssertState::Loser => {
                    // The recorded winner deteriorated below us; forget it
                    // and let the next data arrival re-elect
                    let from_winner = self
                        .winner
                        .map(|w| w.address == received.address)
                        .unwrap_or(false);
                    if from_winner {
                        self.state = AssertState::NoInfo;
                        self.winner = None;
                        AssertOutcome {
                            send_assert: false,
                            prune_winner: None,
                            timers: Vec::new(),
                            cancels: vec![self.timer_type()],
                            state_changed: true,
                        }
                    } else {
                        AssertOutcome::default()
                    }
                }
            }
        } else {
            // They win
            let was_loser_to_same = self.state == AssertState::Loser
                && self.winner.map(|w| w.address == received.address).unwrap_or(false);
            let state_changed = self.state != AssertState::Loser;
            self.state = AssertState::Loser;
            self.winner = Some(received);
            AssertOutcome {
                send_assert: false,
                prune_winner: (could_assert && !was_loser_to_same)
                    .then_some(received.address),
                timers: vec![TimerRequest {
                    timer_type: self.timer_type(),
                    fire_at: now + hold,
                    replace_existing: true,
                }],
                cancels: Vec::new(),
                state_changed,
            }
        }
    }

    /// Assert timer expired: election state ages out
    pub fn timer_expired(&mut self) -> AssertOutcome {
        let was_loser = self.state == AssertState::Loser;
        self.state = AssertState::NoInfo;
        self.winner = None;
        AssertOutcome {
            send_assert: false,
            prune_winner: None,
            timers: Vec::new(),
            cancels: Vec::new(),
            state_changed: was_loser,
        }
    }

    /// The neighbor recorded as winner disappeared (expiry or goodbye)
    pub fn winner_lost(&mut self, neighbor: Ipv4Addr) -> Option<AssertOutcome> {
        if self.state != AssertState::Loser {
            return None;
        }
        if self.winner.map(|w| w.address != neighbor).unwrap_or(true) {
            return None;
        }
        self.state = AssertState::NoInfo;
        self.winner = None;
        Some(AssertOutcome {
            send_assert: false,
            prune_winner: None,
            timers: Vec::new(),
            cancels: vec![self.timer_type()],
            state_changed: true,
        })
    }
}
