// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Origination state machine: State-Refresh generation at the first hop.
//!
//! Only the router whose interface directly attaches the source becomes
//! Originator. While data keeps arriving it emits a State-Refresh every
//! refresh interval; when the source goes quiet for a source lifetime it
//! steps down.

use std::time::{Duration, Instant};

use crate::timers::{TimerRequest, TimerType};
use crate::SourceGroupPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginationState {
    #[default]
    NotOriginator,
    Originator,
}

#[derive(Debug)]
pub struct OriginationMachine {
    pub sg: SourceGroupPair,
    pub state: OriginationState,
    /// TTL observed on the most recent data packet; copied into the
    /// State-Refresh so it propagates no further than the data would
    pub data_ttl: u8,
}

impl OriginationMachine {
    pub fn new(sg: SourceGroupPair) -> Self {
        Self {
            sg,
            state: OriginationState::NotOriginator,
            data_ttl: 0,
        }
    }

    fn source_active_type(&self) -> TimerType {
        TimerType::SourceActive { sg: self.sg }
    }

    fn refresh_type(&self) -> TimerType {
        TimerType::StateRefresh { sg: self.sg }
    }

    /// Data arrived from the directly connected source
    pub fn data_from_source(
        &mut self,
        ttl: u8,
        source_lifetime: Duration,
        refresh_interval: Duration,
        now: Instant,
    ) -> Vec<TimerRequest> {
        self.data_ttl = self.data_ttl.max(ttl);
        match self.state {
            OriginationState::NotOriginator => {
                self.state = OriginationState::Originator;
                self.data_ttl = ttl;
                vec![
                    TimerRequest {
                        timer_type: self.source_active_type(),
                        fire_at: now + source_lifetime,
                        replace_existing: false,
                    },
                    TimerRequest {
                        timer_type: self.refresh_type(),
                        fire_at: now + refresh_interval,
                        replace_existing: false,
                    },
                ]
            }
            OriginationState::Originator => {
                // Source still active; push the keepalive out
                vec![TimerRequest {
                    timer_type: self.source_active_type(),
                    fire_at: now + source_lifetime,
                    replace_existing: true,
                }]
            }
        }
    }

    /// Source went quiet; stop originating. Returns the refresh timer to
    /// cancel, or nothing when already inactive.
    pub fn source_expired(&mut self) -> Vec<TimerType> {
        if self.state == OriginationState::Originator {
            self.state = OriginationState::NotOriginator;
            vec![self.refresh_type()]
        } else {
            Vec::new()
        }
    }

    /// Refresh timer fired: emit a State-Refresh round and re-arm. `None`
    /// when no longer the originator (stale expiry).
    pub fn refresh_due(
        &mut self,
        refresh_interval: Duration,
        now: Instant,
    ) -> Option<TimerRequest> {
        if self.state != OriginationState::Originator {
            return None;
        }
        Some(TimerRequest {
            timer_type: self.refresh_type(),
            fire_at: now + refresh_interval,
            replace_existing: false,
        })
    }
}
