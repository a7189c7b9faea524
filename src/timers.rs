// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Protocol timer management.
//!
//! Handlers never sleep; they return [`TimerRequest`]s and cancellations,
//! and the timer manager delivers expiries back as events. The store keeps a
//! binary heap of deadlines plus an armed-set for lazy cancellation: a
//! cancelled or replaced timer stays in the heap and is discarded when it
//! surfaces.
//!
//! Scheduling a timer that is already armed without `replace_existing` is a
//! programming error under the cancel-before-reschedule discipline and is
//! reported instead of silently racing.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::Ipv4Addr;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::logging::{Facility, Logger};
use crate::{log_debug, log_info, log_warning};
use crate::{InterfaceId, ProtocolError, SourceGroupPair};

/// Types of timers used by the engine, keyed by the state they belong to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Periodic Hello transmission
    Hello { interface: InterfaceId },
    /// Randomized triggered Hello (interface up, new neighbor, restart)
    TriggeredHello { interface: InterfaceId },
    /// Neighbor liveness expiry
    NeighborExpiry {
        interface: InterfaceId,
        neighbor: Ipv4Addr,
    },
    /// Replay of the last State-Refresh after a neighbor restart; ordered
    /// strictly after the triggered Hello
    RefreshReplay {
        interface: InterfaceId,
        sg: SourceGroupPair,
    },
    /// Downstream prune-pending delay
    PrunePending {
        interface: InterfaceId,
        sg: SourceGroupPair,
    },
    /// Downstream Pruned state lifetime
    PruneExpiry {
        interface: InterfaceId,
        sg: SourceGroupPair,
    },
    /// Prune rate limit (downstream RPF-failure prunes and upstream t_limit)
    PruneLimit {
        interface: InterfaceId,
        sg: SourceGroupPair,
    },
    /// Graft retransmission until a GraftAck arrives
    GraftRetry { sg: SourceGroupPair },
    /// Join-override window after overhearing a Prune on shared media
    Override { sg: SourceGroupPair },
    /// Assert state lifetime
    Assert {
        interface: InterfaceId,
        sg: SourceGroupPair,
    },
    /// Originator keepalive for a directly attached source
    SourceActive { sg: SourceGroupPair },
    /// Periodic State-Refresh generation
    StateRefresh { sg: SourceGroupPair },
    /// Periodic RPF re-resolution sweep
    RpfCheck,
}

/// Request to schedule a timer
#[derive(Debug, Clone)]
pub struct TimerRequest {
    /// Type of timer (also its identity for replace/cancel)
    pub timer_type: TimerType,
    /// When the timer should fire
    pub fire_at: Instant,
    /// Whether this replaces any armed timer of the same type
    pub replace_existing: bool,
}

#[derive(Debug, Clone)]
struct ScheduledTimer {
    fire_at: Instant,
    timer_type: TimerType,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.timer_type == other.timer_type
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

/// Pure timer bookkeeping: heap of deadlines plus the armed set. Usable
/// directly in tests to drive deterministic time.
#[derive(Debug, Default)]
pub struct TimerStore {
    heap: BinaryHeap<std::cmp::Reverse<ScheduledTimer>>,
    armed: HashMap<TimerType, Instant>,
}

impl TimerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer. Double-arming without `replace_existing` violates the
    /// cancel-before-reschedule discipline and is rejected.
    pub fn schedule(&mut self, request: TimerRequest) -> Result<(), ProtocolError> {
        if !request.replace_existing && self.armed.contains_key(&request.timer_type) {
            return Err(ProtocolError::InvariantViolation(format!(
                "timer {:?} armed twice without replace",
                request.timer_type
            )));
        }
        self.armed.insert(request.timer_type.clone(), request.fire_at);
        self.heap.push(std::cmp::Reverse(ScheduledTimer {
            fire_at: request.fire_at,
            timer_type: request.timer_type,
        }));
        Ok(())
    }

    /// Disarm a timer; a later heap pop of a stale entry is discarded.
    /// Cancelling an unarmed timer is a no-op.
    pub fn cancel(&mut self, timer_type: &TimerType) {
        self.armed.remove(timer_type);
    }

    /// Whether a timer of this type is currently armed
    pub fn is_armed(&self, timer_type: &TimerType) -> bool {
        self.armed.contains_key(timer_type)
    }

    /// Deadline of the next live timer, if any
    pub fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let head = self.heap.peek()?.0.clone();
            match self.armed.get(&head.timer_type) {
                Some(at) if *at == head.fire_at => return Some(head.fire_at),
                _ => {
                    // Stale entry from a cancel or replace
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop every timer due at or before `now`, in deadline order
    pub fn due(&mut self, now: Instant) -> Vec<TimerType> {
        let mut fired = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let timer = self.heap.pop().expect("next_deadline saw a head").0;
            self.armed.remove(&timer.timer_type);
            fired.push(timer.timer_type);
        }
        fired
    }

    /// Number of live (armed) timers
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

/// Commands accepted by the async timer manager
#[derive(Debug)]
pub enum TimerCommand {
    /// Arm a timer
    Schedule(TimerRequest),
    /// Disarm a timer
    Cancel(TimerType),
}

/// Async timer manager: owns a [`TimerStore`], accepts commands, and
/// delivers expiries over a channel in deadline order.
pub struct TimerManager {
    store: TimerStore,
    command_rx: mpsc::Receiver<TimerCommand>,
    expiry_tx: mpsc::Sender<TimerType>,
    logger: Logger,
}

impl TimerManager {
    /// Create a new timer manager
    pub fn new(
        command_rx: mpsc::Receiver<TimerCommand>,
        expiry_tx: mpsc::Sender<TimerType>,
        logger: Logger,
    ) -> Self {
        Self {
            store: TimerStore::new(),
            command_rx,
            expiry_tx,
            logger,
        }
    }

    /// Run the timer management loop until the command channel closes
    pub async fn run(mut self) {
        log_info!(self.logger, Facility::Timer, "timer manager started");

        loop {
            // tokio's clock, so paused-clock tests drive this loop
            let now = tokio::time::Instant::now().into_std();
            let sleep_duration = match self.store.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(now),
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = sleep(sleep_duration) => {
                    let now = tokio::time::Instant::now().into_std();
                    for timer_type in self.store.due(now) {
                        log_debug!(
                            self.logger,
                            Facility::Timer,
                            "timer expired: {:?}",
                            timer_type
                        );
                        if self.expiry_tx.send(timer_type).await.is_err() {
                            log_warning!(
                                self.logger,
                                Facility::Timer,
                                "expiry channel closed, timer manager exiting"
                            );
                            return;
                        }
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(TimerCommand::Schedule(request)) => {
                            if let Err(e) = self.store.schedule(request) {
                                log_warning!(self.logger, Facility::Timer, "{}", e);
                            }
                        }
                        Some(TimerCommand::Cancel(timer_type)) => {
                            self.store.cancel(&timer_type);
                        }
                        None => {
                            log_info!(
                                self.logger,
                                Facility::Timer,
                                "command channel closed, timer manager exiting"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }
}
