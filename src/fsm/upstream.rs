// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Upstream Graft/Prune state machine.
//!
//! One machine per (S,G), meaningful only on the current RPF (interface,
//! neighbor) pair. Transitions are driven by olist emptiness, GraftAcks,
//! overheard Joins/Prunes on the RPF link, and RPF changes.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::timers::{TimerRequest, TimerType};
use crate::SourceGroupPair;

/// Upstream state toward the RPF neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraftPruneState {
    /// Traffic flows; nothing has been pruned upstream
    #[default]
    Forwarding,
    /// We pruned ourselves off the tree
    Pruned,
    /// Graft sent, waiting for the GraftAck
    AckPending,
}

/// Message the engine should send toward RPF'(S,G)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSend {
    Join,
    Prune,
    Graft,
}

/// Side effects of one upstream transition. The engine applies `cancels`
/// before `timers`.
#[derive(Debug, Default)]
pub struct UpstreamActions {
    pub send: Option<UpstreamSend>,
    pub timers: Vec<TimerRequest>,
    pub cancels: Vec<TimerType>,
}

#[derive(Debug)]
pub struct UpstreamMachine {
    pub sg: SourceGroupPair,
    pub state: GraftPruneState,
    /// RPF validity pair; state is meaningful only while this matches the
    /// cache
    pub rpf: Option<(crate::InterfaceId, Ipv4Addr)>,
    /// Prune rate limit: no further upstream Prune until this instant
    prune_limit_until: Option<Instant>,
    /// Whether an override timer is armed; it is never restarted while
    /// running, so repeated overheard Prunes cannot postpone the Join
    override_pending: bool,
}

impl UpstreamMachine {
    pub fn new(sg: SourceGroupPair) -> Self {
        Self {
            sg,
            state: GraftPruneState::Forwarding,
            rpf: None,
            prune_limit_until: None,
            override_pending: false,
        }
    }

    fn graft_retry_type(&self) -> TimerType {
        TimerType::GraftRetry { sg: self.sg }
    }

    fn override_type(&self) -> TimerType {
        TimerType::Override { sg: self.sg }
    }

    fn prune_limit_type(&self, interface: crate::InterfaceId) -> TimerType {
        TimerType::PruneLimit {
            interface,
            sg: self.sg,
        }
    }

    /// Whether the prune rate limit window is closed
    pub fn can_send_prune(&self, now: Instant) -> bool {
        self.prune_limit_until.map(|until| now >= until).unwrap_or(true)
    }

    fn prune_actions(&mut self, t_limit: Duration, now: Instant) -> UpstreamActions {
        let Some((interface, _)) = self.rpf else {
            return UpstreamActions::default();
        };
        self.prune_limit_until = Some(now + t_limit);
        UpstreamActions {
            send: Some(UpstreamSend::Prune),
            timers: vec![TimerRequest {
                timer_type: self.prune_limit_type(interface),
                fire_at: now + t_limit,
                replace_existing: false,
            }],
            cancels: Vec::new(),
        }
    }

    /// The olist was recomputed. Transitions follow emptiness; a directly
    /// attached source never prunes upstream (there is no upstream).
    pub fn olist_changed(
        &mut self,
        olist_empty: bool,
        directly_connected: bool,
        t_limit: Duration,
        graft_retry: Duration,
        now: Instant,
    ) -> UpstreamActions {
        match (self.state, olist_empty) {
            (GraftPruneState::Forwarding, true) if !directly_connected => {
                self.state = GraftPruneState::Pruned;
                self.prune_actions(t_limit, now)
            }
            (GraftPruneState::Pruned, false) => {
                self.state = GraftPruneState::AckPending;
                let mut actions = UpstreamActions {
                    send: Some(UpstreamSend::Graft),
                    timers: vec![TimerRequest {
                        timer_type: self.graft_retry_type(),
                        fire_at: now + graft_retry,
                        replace_existing: false,
                    }],
                    cancels: Vec::new(),
                };
                if let Some((interface, _)) = self.rpf {
                    actions.cancels.push(self.prune_limit_type(interface));
                }
                self.prune_limit_until = None;
                actions
            }
            (GraftPruneState::AckPending, true) => {
                self.state = GraftPruneState::Pruned;
                let mut actions = self.prune_actions(t_limit, now);
                actions.cancels.push(self.graft_retry_type());
                actions
            }
            _ => UpstreamActions::default(),
        }
    }

    /// GraftAck addressed to us from the RPF neighbor
    pub fn graft_ack_received(&mut self, from: Ipv4Addr) -> Option<UpstreamActions> {
        let rpf_neighbor = self.rpf.map(|(_, n)| n)?;
        if self.state != GraftPruneState::AckPending || from != rpf_neighbor {
            return None;
        }
        self.state = GraftPruneState::Forwarding;
        Some(UpstreamActions {
            send: None,
            timers: Vec::new(),
            cancels: vec![self.graft_retry_type()],
        })
    }

    /// No GraftAck within the retry period; send the Graft again
    pub fn graft_retry_expired(
        &mut self,
        graft_retry: Duration,
        now: Instant,
    ) -> Option<UpstreamActions> {
        if self.state != GraftPruneState::AckPending {
            return None;
        }
        Some(UpstreamActions {
            send: Some(UpstreamSend::Graft),
            timers: vec![TimerRequest {
                timer_type: self.graft_retry_type(),
                fire_at: now + graft_retry,
                replace_existing: false,
            }],
            cancels: Vec::new(),
        })
    }

    /// Overheard another router's Join to our RPF neighbor: our pending
    /// override (if any) is redundant
    pub fn seen_join(&mut self) -> Vec<TimerType> {
        self.override_pending = false;
        vec![self.override_type()]
    }

    /// Overheard another router's Prune toward our RPF neighbor while we
    /// still want traffic. On shared media, arm the randomized override
    /// window (`override_delay` is caller-drawn) unless one is already
    /// running; on point-to-point links there is no prune/join storm to
    /// damp, so answer immediately.
    pub fn seen_prune(
        &mut self,
        shared_medium: bool,
        override_delay: Duration,
        now: Instant,
    ) -> UpstreamActions {
        if !matches!(
            self.state,
            GraftPruneState::Forwarding | GraftPruneState::AckPending
        ) {
            return UpstreamActions::default();
        }
        if shared_medium {
            if self.override_pending {
                return UpstreamActions::default();
            }
            self.override_pending = true;
            UpstreamActions {
                send: None,
                timers: vec![TimerRequest {
                    timer_type: self.override_type(),
                    fire_at: now + override_delay,
                    replace_existing: false,
                }],
                cancels: Vec::new(),
            }
        } else {
            UpstreamActions {
                send: Some(UpstreamSend::Join),
                timers: Vec::new(),
                cancels: Vec::new(),
            }
        }
    }

    /// Override window closed without seeing another router's Join
    pub fn override_expired(&mut self) -> Option<UpstreamSend> {
        self.override_pending = false;
        matches!(
            self.state,
            GraftPruneState::Forwarding | GraftPruneState::AckPending
        )
        .then_some(UpstreamSend::Join)
    }

    /// The prune rate-limit window closed
    pub fn prune_limit_expired(&mut self) {
        self.prune_limit_until = None;
    }

    /// The RPF cache moved to a new (interface, neighbor) pair. Timers
    /// bound to the old pair are cancelled and the machine re-enters the
    /// state the new olist dictates.
    pub fn rpf_changed(
        &mut self,
        new_rpf: (crate::InterfaceId, Ipv4Addr),
        olist_empty: bool,
        directly_connected: bool,
        t_limit: Duration,
        graft_retry: Duration,
        now: Instant,
    ) -> UpstreamActions {
        let mut cancels = vec![self.graft_retry_type(), self.override_type()];
        if let Some((old_interface, _)) = self.rpf {
            cancels.push(self.prune_limit_type(old_interface));
        }
        self.prune_limit_until = None;
        self.override_pending = false;
        self.rpf = Some(new_rpf);

        if directly_connected {
            self.state = GraftPruneState::Forwarding;
            return UpstreamActions {
                send: None,
                timers: Vec::new(),
                cancels,
            };
        }

        if olist_empty {
            self.state = GraftPruneState::Pruned;
            let mut actions = self.prune_actions(t_limit, now);
            actions.cancels = cancels;
            actions
        } else {
            self.state = GraftPruneState::AckPending;
            UpstreamActions {
                send: Some(UpstreamSend::Graft),
                timers: vec![TimerRequest {
                    timer_type: self.graft_retry_type(),
                    fire_at: now + graft_retry,
                    replace_existing: false,
                }],
                cancels,
            }
        }
    }

    /// A State-Refresh arrived on the RPF interface. With the prune bit
    /// set while we are Pruned the upstream prune is already represented;
    /// with it clear and an empty olist we must re-announce our prune,
    /// subject to the rate limit.
    pub fn refresh_received(
        &mut self,
        prune_indicator: bool,
        olist_empty: bool,
        t_limit: Duration,
        now: Instant,
    ) -> UpstreamActions {
        if self.state != GraftPruneState::Pruned || prune_indicator || !olist_empty {
            return UpstreamActions::default();
        }
        if !self.can_send_prune(now) {
            return UpstreamActions::default();
        }
        // Re-announce; the limit timer may still be armed from the
        // original prune, so replace it.
        let Some((interface, _)) = self.rpf else {
            return UpstreamActions::default();
        };
        self.prune_limit_until = Some(now + t_limit);
        UpstreamActions {
            send: Some(UpstreamSend::Prune),
            timers: vec![TimerRequest {
                timer_type: self.prune_limit_type(interface),
                fire_at: now + t_limit,
                replace_existing: true,
            }],
            cancels: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InterfaceId;

    const T_LIMIT: Duration = Duration::from_secs(210);
    const GRAFT_RETRY: Duration = Duration::from_secs(3);

    fn machine() -> UpstreamMachine {
        let mut m = UpstreamMachine::new(SourceGroupPair::new(
            "192.0.2.1".parse().unwrap(),
            "239.1.1.1".parse().unwrap(),
        ));
        m.rpf = Some((InterfaceId(0), "10.0.0.9".parse().unwrap()));
        m
    }

    #[test]
    fn test_forwarding_to_pruned_on_empty_olist() {
        let mut m = machine();
        let now = Instant::now();
        let actions = m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);
        assert_eq!(m.state, GraftPruneState::Pruned);
        assert_eq!(actions.send, Some(UpstreamSend::Prune));
        assert!(matches!(
            actions.timers[0].timer_type,
            TimerType::PruneLimit { .. }
        ));
        assert!(!m.can_send_prune(now));
        assert!(m.can_send_prune(now + T_LIMIT));
    }

    #[test]
    fn test_directly_connected_never_prunes() {
        let mut m = machine();
        let actions = m.olist_changed(true, true, T_LIMIT, GRAFT_RETRY, Instant::now());
        assert_eq!(m.state, GraftPruneState::Forwarding);
        assert!(actions.send.is_none());
    }

    #[test]
    fn test_graft_ack_cycle() {
        let mut m = machine();
        let now = Instant::now();
        m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);

        // olist refills: Graft out, retry armed, prune limit cancelled
        let actions = m.olist_changed(false, false, T_LIMIT, GRAFT_RETRY, now);
        assert_eq!(m.state, GraftPruneState::AckPending);
        assert_eq!(actions.send, Some(UpstreamSend::Graft));
        assert!(matches!(
            actions.timers[0].timer_type,
            TimerType::GraftRetry { .. }
        ));
        assert!(actions
            .cancels
            .contains(&TimerType::PruneLimit {
                interface: InterfaceId(0),
                sg: m.sg
            }));

        // GraftAck from the wrong router is ignored
        assert!(m.graft_ack_received("10.0.0.77".parse().unwrap()).is_none());
        assert_eq!(m.state, GraftPruneState::AckPending);

        // GraftAck from the RPF neighbor completes the graft
        let actions = m.graft_ack_received("10.0.0.9".parse().unwrap()).unwrap();
        assert_eq!(m.state, GraftPruneState::Forwarding);
        assert_eq!(actions.cancels, vec![TimerType::GraftRetry { sg: m.sg }]);
    }

    #[test]
    fn test_graft_retry_resends() {
        let mut m = machine();
        let now = Instant::now();
        m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);
        m.olist_changed(false, false, T_LIMIT, GRAFT_RETRY, now);

        let actions = m.graft_retry_expired(GRAFT_RETRY, now + GRAFT_RETRY).unwrap();
        assert_eq!(actions.send, Some(UpstreamSend::Graft));

        // No retry when not waiting for an ack
        m.graft_ack_received("10.0.0.9".parse().unwrap()).unwrap();
        assert!(m.graft_retry_expired(GRAFT_RETRY, now).is_none());
    }

    #[test]
    fn test_ack_pending_reempties_to_pruned() {
        let mut m = machine();
        let now = Instant::now();
        m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);
        m.olist_changed(false, false, T_LIMIT, GRAFT_RETRY, now);

        let actions = m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);
        assert_eq!(m.state, GraftPruneState::Pruned);
        assert_eq!(actions.send, Some(UpstreamSend::Prune));
        assert!(actions.cancels.contains(&TimerType::GraftRetry { sg: m.sg }));
    }

    #[test]
    fn test_override_on_shared_medium() {
        let mut m = machine();
        let now = Instant::now();
        let actions = m.seen_prune(true, Duration::from_millis(1700), now);
        assert!(actions.send.is_none());
        assert_eq!(
            actions.timers[0].timer_type,
            TimerType::Override { sg: m.sg }
        );

        assert_eq!(m.override_expired(), Some(UpstreamSend::Join));

        // Seeing another router's Join makes the override redundant
        assert_eq!(m.seen_join(), vec![TimerType::Override { sg: m.sg }]);
    }

    #[test]
    fn test_immediate_join_on_point_to_point() {
        let mut m = machine();
        let actions = m.seen_prune(false, Duration::ZERO, Instant::now());
        assert_eq!(actions.send, Some(UpstreamSend::Join));
        assert!(actions.timers.is_empty());
    }

    #[test]
    fn test_running_override_not_restarted_by_another_prune() {
        let mut m = machine();
        let now = Instant::now();
        let first = m.seen_prune(true, Duration::from_millis(400), now);
        assert_eq!(first.timers.len(), 1);

        // A second overheard Prune while the window runs must not arm a
        // new timer, or the Join could slip past the upstream router's
        // prune-pending window
        let second = m.seen_prune(true, Duration::from_millis(2400), now + Duration::from_millis(300));
        assert!(second.timers.is_empty() && second.send.is_none());

        // Once the window closes, the next Prune arms a fresh one
        assert_eq!(m.override_expired(), Some(UpstreamSend::Join));
        let third = m.seen_prune(true, Duration::from_millis(500), now + Duration::from_secs(3));
        assert_eq!(third.timers.len(), 1);
    }

    #[test]
    fn test_pruned_ignores_overheard_prune() {
        let mut m = machine();
        let now = Instant::now();
        m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);
        let actions = m.seen_prune(true, Duration::from_millis(100), now);
        assert!(actions.send.is_none() && actions.timers.is_empty());
        assert!(m.override_expired().is_none());
    }

    #[test]
    fn test_rpf_change_with_nonempty_olist_grafts() {
        let mut m = machine();
        let now = Instant::now();
        m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);

        let new_rpf = (InterfaceId(2), "10.0.1.9".parse().unwrap());
        let actions = m.rpf_changed(new_rpf, false, false, T_LIMIT, GRAFT_RETRY, now);
        assert_eq!(m.state, GraftPruneState::AckPending);
        assert_eq!(m.rpf, Some(new_rpf));
        assert_eq!(actions.send, Some(UpstreamSend::Graft));
        // Old-pair timers are cancelled
        assert!(actions.cancels.contains(&TimerType::PruneLimit {
            interface: InterfaceId(0),
            sg: m.sg
        }));
        assert!(actions.cancels.contains(&TimerType::Override { sg: m.sg }));
    }

    #[test]
    fn test_refresh_without_prune_bit_reannounces() {
        let mut m = machine();
        let now = Instant::now();
        m.olist_changed(true, false, T_LIMIT, GRAFT_RETRY, now);

        // Inside the rate-limit window: silent
        let actions = m.refresh_received(false, true, T_LIMIT, now + Duration::from_secs(1));
        assert!(actions.send.is_none());

        // Window closed: prune goes out again
        let actions = m.refresh_received(false, true, T_LIMIT, now + T_LIMIT);
        assert_eq!(actions.send, Some(UpstreamSend::Prune));

        // Prune bit set means upstream already knows
        let actions = m.refresh_received(true, true, T_LIMIT, now + 3 * T_LIMIT);
        assert!(actions.send.is_none());
    }
}
