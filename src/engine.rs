// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Event dispatch: the single-threaded protocol engine.
//!
//! The engine consumes one event at a time (a decoded control packet, a
//! data-packet notification, or a timer expiry) and runs the affected
//! state machines to completion. It performs no I/O itself: every handler
//! returns an [`EngineActions`] bundle of timer requests, cancellations,
//! outgoing packets, and data forwards for the runtime to apply.
//! Cancellations are applied before timer requests.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::{PimDmConfig, PimInterfaceConfig};
use crate::forwarding::{self, ForwardDecision};
use crate::fsm::{AssertMetric, AssertOutcome, AssertState, SgStore};
use crate::fsm::{GraftPruneState, UpstreamActions, UpstreamSend};
use crate::logging::{Facility, Logger};
use crate::messages::{
    AssertMessage, HelloMessage, JoinPruneMessage, PimMessage, StateRefreshMessage,
};
use crate::neighbors::{HelloOutcome, NeighborManager, NeighborSummary};
use crate::olist::{self, LocalMembership, OlistInputs};
use crate::rib::{MulticastEntry, RoutingMulticastTable, RpfChange, RpfEntry, UnicastRib};
use crate::timers::{TimerRequest, TimerType};
use crate::{log_debug, log_info, log_notice, log_warning};
use crate::{DataForward, InterfaceId, OutgoingPacket, PacketEnvelope, ProtocolError, SourceGroupPair};

/// Events consumed by the engine
#[derive(Debug)]
pub enum PimDmEvent {
    /// A PIM control packet arrived
    PacketReceived(PacketEnvelope),
    /// A multicast data packet arrived; the payload is carried so the
    /// engine can hand it back as [`DataForward`]s
    DataPacket {
        interface: InterfaceId,
        sender: Ipv4Addr,
        sg: SourceGroupPair,
        ttl: u8,
        payload: Vec<u8>,
    },
    /// A protocol timer fired
    TimerExpired(TimerType),
}

/// Side effects of one handler invocation. The runtime applies `cancels`
/// before `timers`.
#[derive(Debug, Default)]
pub struct EngineActions {
    pub timers: Vec<TimerRequest>,
    pub cancels: Vec<TimerType>,
    pub packets: Vec<OutgoingPacket>,
    pub forwards: Vec<DataForward>,
}

impl EngineActions {
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
            && self.cancels.is_empty()
            && self.packets.is_empty()
            && self.forwards.is_empty()
    }
}

/// Control and data plane counters, exposed for diagnostics
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TraceCounters {
    pub control_rx: u64,
    pub control_tx: u64,
    pub decode_errors: u64,
    pub data_rx: u64,
    pub data_forwarded: u64,
    pub data_dropped: u64,
    pub rpf_failures: u64,
    pub rpf_changes: u64,
}

/// The PIM-DM protocol engine
pub struct PimDmEngine {
    config: PimDmConfig,
    rib: Box<dyn UnicastRib>,
    neighbors: NeighborManager,
    store: SgStore,
    membership: LocalMembership,
    table: RoutingMulticastTable,
    /// Administrative boundary interfaces
    boundaries: BTreeSet<InterfaceId>,
    generation_id: u32,
    rng: SmallRng,
    logger: Logger,
    counters: TraceCounters,
    /// Rate limit for RPF-failure prunes per (arrival interface, S,G)
    rpf_prune_limit: HashMap<(InterfaceId, SourceGroupPair), Instant>,
    /// Last instant a received State-Refresh was propagated per (S,G)
    refresh_propagated: HashMap<SourceGroupPair, Instant>,
    /// Last State-Refresh sent per (interface, S,G), kept for replay after
    /// a downstream neighbor restart
    last_refresh: HashMap<(InterfaceId, SourceGroupPair), StateRefreshMessage>,
}

impl PimDmEngine {
    pub fn new(config: PimDmConfig, rib: Box<dyn UnicastRib>, logger: Logger) -> Self {
        Self::with_rng(config, rib, logger, SmallRng::from_entropy())
    }

    /// Deterministic construction for tests
    pub fn with_seed(
        config: PimDmConfig,
        rib: Box<dyn UnicastRib>,
        logger: Logger,
        seed: u64,
    ) -> Self {
        Self::with_rng(config, rib, logger, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: PimDmConfig,
        rib: Box<dyn UnicastRib>,
        logger: Logger,
        mut rng: SmallRng,
    ) -> Self {
        let generation_id = rng.gen();
        Self {
            config,
            rib,
            neighbors: NeighborManager::new(logger.clone()),
            store: SgStore::new(),
            membership: LocalMembership::new(),
            table: RoutingMulticastTable::new(),
            boundaries: BTreeSet::new(),
            generation_id,
            rng,
            logger,
            counters: TraceCounters::default(),
            rpf_prune_limit: HashMap::new(),
            refresh_propagated: HashMap::new(),
            last_refresh: HashMap::new(),
        }
    }

    /// Arm the periodic RPF re-resolution sweep
    pub fn start(&mut self, now: Instant) -> EngineActions {
        let mut actions = EngineActions::default();
        actions.timers.push(TimerRequest {
            timer_type: TimerType::RpfCheck,
            fire_at: now + self.config.rpf_check_interval,
            replace_existing: true,
        });
        log_info!(self.logger, Facility::Engine, "engine started");
        actions
    }

    /// Generation ID advertised in our Hellos
    pub fn generation_id(&self) -> u32 {
        self.generation_id
    }

    pub fn counters(&self) -> TraceCounters {
        self.counters
    }

    /// Diagnostic dump of the multicast route cache
    pub fn dump_routes(&self) -> Vec<MulticastEntry> {
        self.table.dump()
    }

    /// Diagnostic dump of the neighbor tables
    pub fn dump_neighbors(&self) -> Vec<NeighborSummary> {
        self.neighbors.dump()
    }

    /// One-shot status snapshot for a management or debug channel
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "generation_id": self.generation_id,
            "counters": self.counters,
            "routes": self.dump_routes(),
            "neighbors": self.dump_neighbors(),
        })
    }

    // ------------------------------------------------------------------
    // Control API
    // ------------------------------------------------------------------

    /// Enable PIM-DM on a named interface
    pub fn enable_interface(
        &mut self,
        name: &str,
        local_address: Ipv4Addr,
        now: Instant,
    ) -> (InterfaceId, EngineActions) {
        let config = self.config.interface(name);
        let first_hello_delay = self.jitter(self.config.triggered_hello_delay);
        let boundary = config.boundary;
        let refresh_secs = self.config.refresh_interval.as_secs().min(u8::MAX as u64) as u8;
        let (interface, timers) = self.neighbors.enable_interface(
            name,
            local_address,
            config,
            self.generation_id,
            refresh_secs,
            first_hello_delay,
            now,
        );
        if boundary {
            self.boundaries.insert(interface);
        }
        let mut actions = EngineActions::default();
        actions.timers = timers;
        (interface, actions)
    }

    /// Disable an interface: say goodbye, drop its neighbors and state
    pub fn disable_interface(&mut self, interface: InterfaceId, now: Instant) -> EngineActions {
        let mut actions = EngineActions::default();
        let Some((goodbye, cancels)) = self.neighbors.disable_interface(interface) else {
            return actions;
        };
        actions
            .packets
            .push(OutgoingPacket::on_interface(interface, PimMessage::Hello(goodbye)));
        actions.cancels = cancels;
        self.boundaries.remove(&interface);

        // Drop per-interface machines and re-evaluate the flows they touched
        let mut touched: BTreeSet<SourceGroupPair> = BTreeSet::new();
        self.store.downstream.retain(|(entry_if, sg), _| {
            if *entry_if == interface {
                touched.insert(*sg);
                false
            } else {
                true
            }
        });
        self.store.asserts.retain(|(entry_if, sg), _| {
            if *entry_if == interface {
                touched.insert(*sg);
                false
            } else {
                true
            }
        });
        for sg in touched {
            actions.cancels.push(TimerType::PrunePending { interface, sg });
            actions.cancels.push(TimerType::PruneExpiry { interface, sg });
            actions.cancels.push(TimerType::Assert { interface, sg });
            self.evaluate_upstream(sg, now, &mut actions);
        }
        self.count_tx(&actions);
        actions
    }

    /// Start tracking a flow and resolve its RPF entry
    pub fn register_source_group(&mut self, sg: SourceGroupPair, now: Instant) -> EngineActions {
        let mut actions = EngineActions::default();
        let entry = self.table.register(sg, &*self.rib);
        if entry.is_none() {
            log_warning!(
                self.logger,
                Facility::Rpf,
                "no unicast route toward {} yet; will retry on the next sweep",
                sg.source
            );
        }
        self.sync_upstream_rpf(sg);
        self.evaluate_upstream(sg, now, &mut actions);
        self.count_tx(&actions);
        actions
    }

    /// Tear down all state for a flow
    pub fn unregister_source_group(&mut self, sg: SourceGroupPair) -> EngineActions {
        let mut actions = EngineActions::default();
        for interface in self.neighbors.interface_ids().collect::<Vec<_>>() {
            actions.cancels.push(TimerType::PrunePending { interface, sg });
            actions.cancels.push(TimerType::PruneExpiry { interface, sg });
            actions.cancels.push(TimerType::PruneLimit { interface, sg });
            actions.cancels.push(TimerType::Assert { interface, sg });
            actions.cancels.push(TimerType::RefreshReplay { interface, sg });
        }
        actions.cancels.push(TimerType::GraftRetry { sg });
        actions.cancels.push(TimerType::Override { sg });
        actions.cancels.push(TimerType::SourceActive { sg });
        actions.cancels.push(TimerType::StateRefresh { sg });
        self.store.remove_sg(sg);
        self.table.unregister(sg);
        self.rpf_prune_limit.retain(|(_, entry_sg), _| *entry_sg != sg);
        self.refresh_propagated.remove(&sg);
        self.last_refresh.retain(|(_, entry_sg), _| *entry_sg != sg);
        actions
    }

    /// Register a local receiver; `source == None` is (*,G)
    pub fn register_member(
        &mut self,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
        interface: InterfaceId,
        now: Instant,
    ) -> EngineActions {
        self.membership.register(source, group, interface);
        self.reevaluate_group(group, now)
    }

    /// Remove a local receiver
    pub fn unregister_member(
        &mut self,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
        interface: InterfaceId,
        now: Instant,
    ) -> EngineActions {
        self.membership.unregister(source, group, interface);
        self.reevaluate_group(group, now)
    }

    /// Carve one source out of a wildcard membership on `interface`
    pub fn register_exclusion(
        &mut self,
        sg: SourceGroupPair,
        interface: InterfaceId,
        now: Instant,
    ) -> EngineActions {
        self.membership.exclude(sg, interface);
        self.reevaluate_group(sg.group, now)
    }

    /// Undo a source exclusion
    pub fn unregister_exclusion(
        &mut self,
        sg: SourceGroupPair,
        interface: InterfaceId,
        now: Instant,
    ) -> EngineActions {
        self.membership.unexclude(sg, interface);
        self.reevaluate_group(sg.group, now)
    }

    /// Toggle the administrative boundary on an interface
    pub fn set_boundary(&mut self, interface: InterfaceId, boundary: bool, now: Instant) -> EngineActions {
        if boundary {
            self.boundaries.insert(interface);
        } else {
            self.boundaries.remove(&interface);
        }
        let mut actions = EngineActions::default();
        for sg in self.table.pairs() {
            self.evaluate_upstream(sg, now, &mut actions);
        }
        self.count_tx(&actions);
        actions
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    pub fn handle_event(
        &mut self,
        event: PimDmEvent,
        now: Instant,
    ) -> Result<EngineActions, ProtocolError> {
        match event {
            PimDmEvent::PacketReceived(envelope) => self.handle_packet(envelope, now),
            PimDmEvent::DataPacket {
                interface,
                sender,
                sg,
                ttl,
                payload,
            } => self.handle_data(interface, sender, sg, ttl, payload, now),
            PimDmEvent::TimerExpired(timer) => self.handle_timer(timer, now),
        }
    }

    fn handle_packet(
        &mut self,
        envelope: PacketEnvelope,
        now: Instant,
    ) -> Result<EngineActions, ProtocolError> {
        self.counters.control_rx += 1;
        let message = match PimMessage::decode(&envelope.payload) {
            Ok(message) => message,
            Err(error) => {
                // Malformed input is dropped, never propagated
                self.counters.decode_errors += 1;
                log_info!(
                    self.logger,
                    Facility::Codec,
                    "dropping packet from {} on {}: {}",
                    envelope.sender,
                    envelope.interface,
                    error
                );
                return Ok(EngineActions::default());
            }
        };
        log_debug!(
            self.logger,
            Facility::Engine,
            "{} from {} on {}",
            message.type_name(),
            envelope.sender,
            envelope.interface
        );

        let mut actions = EngineActions::default();
        match message {
            PimMessage::Hello(hello) => {
                self.handle_hello(&envelope, &hello, now, &mut actions)?
            }
            PimMessage::JoinPrune(jp) => {
                self.handle_join_prune(&envelope, &jp, now, &mut actions)?
            }
            PimMessage::Graft(graft) => self.handle_graft(&envelope, graft, now, &mut actions)?,
            PimMessage::GraftAck(ack) => self.handle_graft_ack(&envelope, &ack, &mut actions),
            PimMessage::Assert(assert) => {
                self.handle_assert(&envelope, &assert, now, &mut actions)
            }
            PimMessage::StateRefresh(refresh) => {
                self.handle_state_refresh(&envelope, &refresh, now, &mut actions)
            }
        }
        self.count_tx(&actions);
        Ok(actions)
    }

    fn handle_hello(
        &mut self,
        envelope: &PacketEnvelope,
        hello: &HelloMessage,
        now: Instant,
        actions: &mut EngineActions,
    ) -> Result<(), ProtocolError> {
        let interface = envelope.interface;
        let reaction = self
            .neighbors
            .received_hello(interface, envelope.sender, hello, now)?;
        actions.timers.extend(reaction.timers);
        actions.cancels.extend(reaction.cancels);

        match reaction.outcome {
            HelloOutcome::NewNeighbor => {
                // Introduce ourselves promptly, jittered against storms
                actions.timers.push(TimerRequest {
                    timer_type: TimerType::TriggeredHello { interface },
                    fire_at: now + self.jitter(self.config.triggered_hello_delay),
                    replace_existing: true,
                });
                for sg in self.table.pairs() {
                    self.evaluate_upstream(sg, now, actions);
                }
            }
            HelloOutcome::Restarted => {
                self.handle_neighbor_restart(interface, envelope.sender, now, actions);
            }
            HelloOutcome::Goodbye => {
                self.neighbor_gone(interface, envelope.sender, now, actions);
            }
            HelloOutcome::Refreshed => {}
        }
        Ok(())
    }

    /// Generation-ID change: replay our Hello, replay State-Refresh state
    /// the restarted neighbor lost, and re-announce upstream prunes.
    fn handle_neighbor_restart(
        &mut self,
        interface: InterfaceId,
        neighbor: Ipv4Addr,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let hello_delay = self.jitter(self.config.triggered_hello_delay);
        actions.timers.push(TimerRequest {
            timer_type: TimerType::TriggeredHello { interface },
            fire_at: now + hello_delay,
            replace_existing: true,
        });

        // Replay the last State-Refresh where we are the elected forwarder
        // toward the restarted neighbor, strictly after the Hello.
        let replays: Vec<SourceGroupPair> = self
            .store
            .asserts
            .iter()
            .filter(|((entry_if, sg), machine)| {
                *entry_if == interface
                    && machine.state == AssertState::Winner
                    && self.last_refresh.contains_key(&(interface, *sg))
            })
            .map(|((_, sg), _)| *sg)
            .collect();
        for sg in replays {
            let after_hello =
                hello_delay + Duration::from_millis(1) + self.jitter(self.config.triggered_hello_delay);
            actions.timers.push(TimerRequest {
                timer_type: TimerType::RefreshReplay { interface, sg },
                fire_at: now + after_hello,
                replace_existing: true,
            });
        }

        // A restarted upstream neighbor forgot our prune; tell it again
        let pruned_upstream: Vec<SourceGroupPair> = self
            .store
            .upstream
            .iter()
            .filter(|(_, machine)| {
                machine.state == GraftPruneState::Pruned
                    && machine.rpf == Some((interface, neighbor))
            })
            .map(|(sg, _)| *sg)
            .collect();
        let t_limit = self.config.prune_holdtime;
        for sg in pruned_upstream {
            let (_, olist, _) = self.olist_sets(sg);
            let machine = self.store.upstream_entry(sg);
            machine.prune_limit_expired();
            let upstream_actions =
                machine.refresh_received(false, olist.is_empty(), t_limit, now);
            self.apply_upstream(sg, upstream_actions, actions);
        }
    }

    fn handle_join_prune(
        &mut self,
        envelope: &PacketEnvelope,
        jp: &JoinPruneMessage,
        now: Instant,
        actions: &mut EngineActions,
    ) -> Result<(), ProtocolError> {
        let interface = envelope.interface;
        let local = self
            .neighbors
            .local_address(interface)
            .ok_or(ProtocolError::UnknownInterface(interface))?;
        let addressed_to_us = jp.upstream_neighbor == local;
        let shared = self.neighbors.neighbor_count(interface) > 1;
        let (propagation_delay, override_interval) = self.negotiated(interface);
        let holdtime = Duration::from_secs(jp.holdtime_secs as u64);

        for sg in jp.prunes().collect::<Vec<_>>() {
            if addressed_to_us {
                let delay = if shared {
                    propagation_delay + self.jitter(override_interval)
                } else {
                    Duration::ZERO
                };
                let timers = self
                    .store
                    .downstream_entry(interface, sg)
                    .received_prune(envelope.sender, delay, holdtime, now);
                actions.timers.extend(timers);
            } else if self.is_upstream_pair(sg, interface, jp.upstream_neighbor) {
                // Overheard a sibling pruning our RPF neighbor
                let delay = self.jitter(override_interval);
                let upstream_actions =
                    self.store
                        .upstream_entry(sg)
                        .seen_prune(shared, delay, now);
                self.apply_upstream(sg, upstream_actions, actions);
            }
        }

        for sg in jp.joins().collect::<Vec<_>>() {
            if addressed_to_us {
                let cancels = self
                    .store
                    .downstream_entry(interface, sg)
                    .received_join_or_graft();
                if !cancels.is_empty() {
                    actions.cancels.extend(cancels);
                    self.evaluate_upstream(sg, now, actions);
                }
            } else if self.is_upstream_pair(sg, interface, jp.upstream_neighbor) {
                // A sibling already joined; our override is redundant
                actions
                    .cancels
                    .extend(self.store.upstream_entry(sg).seen_join());
            }
        }
        Ok(())
    }

    fn handle_graft(
        &mut self,
        envelope: &PacketEnvelope,
        graft: JoinPruneMessage,
        now: Instant,
        actions: &mut EngineActions,
    ) -> Result<(), ProtocolError> {
        let interface = envelope.interface;
        let local = self
            .neighbors
            .local_address(interface)
            .ok_or(ProtocolError::UnknownInterface(interface))?;
        if graft.upstream_neighbor != local {
            // Not for us; grafts are unicast so this is unexpected but harmless
            return Ok(());
        }
        for sg in graft.joins().collect::<Vec<_>>() {
            let cancels = self
                .store
                .downstream_entry(interface, sg)
                .received_join_or_graft();
            if !cancels.is_empty() {
                actions.cancels.extend(cancels);
                self.evaluate_upstream(sg, now, actions);
            }
        }
        // Acknowledge with the echoed body
        actions.packets.push(OutgoingPacket::unicast(
            envelope.sender,
            PimMessage::GraftAck(graft),
        ));
        Ok(())
    }

    fn handle_graft_ack(
        &mut self,
        envelope: &PacketEnvelope,
        ack: &JoinPruneMessage,
        actions: &mut EngineActions,
    ) {
        for sg in ack.joins().collect::<Vec<_>>() {
            if let Some(machine) = self.store.upstream.get_mut(&sg) {
                if let Some(upstream_actions) = machine.graft_ack_received(envelope.sender) {
                    log_info!(
                        self.logger,
                        Facility::Upstream,
                        "graft for {} acknowledged by {}",
                        sg,
                        envelope.sender
                    );
                    actions.cancels.extend(upstream_actions.cancels);
                    actions.timers.extend(upstream_actions.timers);
                }
            }
        }
    }

    fn handle_assert(
        &mut self,
        envelope: &PacketEnvelope,
        assert: &AssertMessage,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let sg = assert.sg();
        if !self.table.contains(sg) {
            self.table.register(sg, &*self.rib);
            self.sync_upstream_rpf(sg);
        }
        let received = AssertMetric::new(assert.metric_preference, assert.metric, envelope.sender);
        self.run_assert_election(
            envelope.interface,
            sg,
            received,
            self.config.assert_time,
            now,
            actions,
        );
    }

    fn handle_state_refresh(
        &mut self,
        envelope: &PacketEnvelope,
        refresh: &StateRefreshMessage,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let sg = refresh.sg();
        let interface = envelope.interface;
        if !self.table.contains(sg) {
            self.table.register(sg, &*self.rib);
            self.sync_upstream_rpf(sg);
        }

        // The refresh carries the forwarder's metric; it doubles as an
        // Assert with a hold of three refresh intervals.
        let received = AssertMetric::new(refresh.metric_preference, refresh.metric, envelope.sender);
        let hold = 3 * Duration::from_secs(refresh.interval_secs.max(1) as u64);
        self.run_assert_election(interface, sg, received, hold, now, actions);

        let Some(rpf) = self.table.rpf(sg) else {
            return;
        };
        if rpf.interface != interface {
            return;
        }

        // Refresh arrived from upstream: drive the upstream machine and
        // propagate down the tree.
        let (_, olist, _) = self.olist_sets(sg);
        let t_limit = self.config.prune_holdtime;
        let upstream_actions = self.store.upstream_entry(sg).refresh_received(
            refresh.prune_indicator,
            olist.is_empty(),
            t_limit,
            now,
        );
        self.apply_upstream(sg, upstream_actions, actions);

        if refresh.ttl <= 1 {
            return;
        }
        // Rate limit: at most one propagated refresh per advertised interval
        let window = Duration::from_secs(refresh.interval_secs.max(1) as u64);
        let allowed = self
            .refresh_propagated
            .get(&sg)
            .map(|last| now >= *last + window)
            .unwrap_or(true);
        if !allowed {
            return;
        }
        self.refresh_propagated.insert(sg, now);

        let prunes = self.store.prunes_for(sg);
        for out_interface in self.refresh_targets(sg, interface) {
            let mut forwarded = refresh.clone();
            forwarded.ttl -= 1;
            forwarded.prune_indicator = prunes.contains(&out_interface);
            self.last_refresh
                .insert((out_interface, sg), forwarded.clone());
            actions.packets.push(OutgoingPacket::on_interface(
                out_interface,
                PimMessage::StateRefresh(forwarded),
            ));
            // The refresh stands in for re-flooded data; keep downstream
            // prunes alive without waiting for their holdtime
            if let Some(machine) = self.store.downstream.get_mut(&(out_interface, sg)) {
                if refresh.prune_now {
                    actions
                        .timers
                        .extend(machine.refresh_prune(self.config.prune_holdtime, now));
                }
            }
        }
    }

    fn handle_data(
        &mut self,
        interface: InterfaceId,
        sender: Ipv4Addr,
        sg: SourceGroupPair,
        ttl: u8,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<EngineActions, ProtocolError> {
        self.counters.data_rx += 1;
        let mut actions = EngineActions::default();
        if !self.table.contains(sg) {
            self.table.register(sg, &*self.rib);
            self.sync_upstream_rpf(sg);
        }
        let rpf = self.table.rpf(sg);
        let (immediate, olist, _) = self.olist_sets(sg);

        // First-hop: the source sits on a directly attached subnet
        if let Some(entry) = rpf {
            if entry.directly_connected && entry.interface == interface {
                let timers = self.store.origination_entry(sg).data_from_source(
                    ttl,
                    self.config.source_lifetime,
                    self.config.refresh_interval,
                    now,
                );
                actions.timers.extend(timers);
                if olist.is_empty() {
                    self.counters.data_dropped += 1;
                } else {
                    self.counters.data_forwarded += 1;
                    actions.forwards.push(DataForward {
                        sg,
                        out_interfaces: olist.iter().copied().collect(),
                        payload,
                    });
                }
                self.count_tx(&actions);
                return Ok(actions);
            }
        }

        let pruned = self
            .store
            .upstream
            .get(&sg)
            .map(|machine| machine.state == GraftPruneState::Pruned)
            .unwrap_or(false);
        match forwarding::decide(interface, rpf.map(|e| e.interface), pruned, &olist) {
            ForwardDecision::Forward(out_interfaces) => {
                self.counters.data_forwarded += 1;
                actions.forwards.push(DataForward {
                    sg,
                    out_interfaces,
                    payload,
                });
            }
            ForwardDecision::Drop(reason) => {
                self.counters.data_dropped += 1;
                log_debug!(
                    self.logger,
                    Facility::Forwarding,
                    "dropping data for {}: {:?}",
                    sg,
                    reason
                );
            }
            ForwardDecision::RpfFailure => {
                self.counters.rpf_failures += 1;
                if immediate.contains(&interface) {
                    // Another forwarder on a downstream link: assert
                    let my_metric = self.my_metric(sg, interface);
                    if let Some(outcome) = self.store.assert_entry(interface, sg).data_arrived(
                        my_metric,
                        self.config.assert_time,
                        now,
                    ) {
                        self.apply_assert(interface, sg, my_metric, outcome, now, &mut actions);
                    }
                } else {
                    self.rate_limited_prune(interface, sender, sg, now, &mut actions);
                }
            }
        }
        self.count_tx(&actions);
        Ok(actions)
    }

    fn handle_timer(
        &mut self,
        timer: TimerType,
        now: Instant,
    ) -> Result<EngineActions, ProtocolError> {
        let mut actions = EngineActions::default();
        match timer {
            TimerType::Hello { interface } => {
                let (hello, request) = self.neighbors.hello_timer_fired(interface, now)?;
                actions
                    .packets
                    .push(OutgoingPacket::on_interface(interface, PimMessage::Hello(hello)));
                actions.timers.push(request);
            }
            TimerType::TriggeredHello { interface } => {
                let hello = self.neighbors.triggered_hello_fired(interface)?;
                actions
                    .packets
                    .push(OutgoingPacket::on_interface(interface, PimMessage::Hello(hello)));
            }
            TimerType::NeighborExpiry {
                interface,
                neighbor,
            } => {
                if self.neighbors.neighbor_expired(interface, neighbor).is_some() {
                    self.neighbor_gone(interface, neighbor, now, &mut actions);
                }
            }
            TimerType::RefreshReplay { interface, sg } => {
                let still_winner = self
                    .store
                    .asserts
                    .get(&(interface, sg))
                    .map(|machine| machine.state == AssertState::Winner)
                    .unwrap_or(false);
                if still_winner {
                    if let Some(refresh) = self.last_refresh.get(&(interface, sg)) {
                        actions.packets.push(OutgoingPacket::on_interface(
                            interface,
                            PimMessage::StateRefresh(refresh.clone()),
                        ));
                    }
                }
            }
            TimerType::PrunePending { interface, sg } => {
                let echo = self.iface_config(interface).prune_echo
                    && self.neighbors.neighbor_count(interface) > 1;
                let (expiry, timers) = self
                    .store
                    .downstream_entry(interface, sg)
                    .pending_expired(echo, now);
                actions.timers.extend(timers);
                if expiry.became_pruned {
                    log_info!(
                        self.logger,
                        Facility::Downstream,
                        "{} pruned on {}",
                        sg,
                        interface
                    );
                    if expiry.echo_prune {
                        if let Some(local) = self.neighbors.local_address(interface) {
                            let holdtime =
                                self.config.prune_holdtime.as_secs().min(u16::MAX as u64) as u16;
                            actions.packets.push(OutgoingPacket::on_interface(
                                interface,
                                PimMessage::JoinPrune(JoinPruneMessage::prune(
                                    local, sg, holdtime,
                                )),
                            ));
                        }
                    }
                    self.evaluate_upstream(sg, now, &mut actions);
                }
            }
            TimerType::PruneExpiry { interface, sg } => {
                if self.store.downstream_entry(interface, sg).prune_expired() {
                    self.evaluate_upstream(sg, now, &mut actions);
                }
            }
            TimerType::PruneLimit { interface, sg } => {
                self.rpf_prune_limit.remove(&(interface, sg));
                // The same timer type also serves the data-plane limiter on
                // non-RPF interfaces; only the RPF interface's expiry closes
                // the upstream t_limit window.
                if let Some(machine) = self.store.upstream.get_mut(&sg) {
                    if machine.rpf.map(|(rpf_if, _)| rpf_if) == Some(interface) {
                        machine.prune_limit_expired();
                    }
                }
            }
            TimerType::GraftRetry { sg } => {
                let graft_retry = self.config.graft_retry_period;
                if let Some(machine) = self.store.upstream.get_mut(&sg) {
                    if let Some(upstream_actions) = machine.graft_retry_expired(graft_retry, now) {
                        self.apply_upstream(sg, upstream_actions, &mut actions);
                    }
                }
            }
            TimerType::Override { sg } => {
                let send = self
                    .store
                    .upstream
                    .get_mut(&sg)
                    .and_then(|machine| machine.override_expired());
                if let Some(send) = send {
                    self.send_upstream(sg, send, &mut actions);
                }
            }
            TimerType::Assert { interface, sg } => {
                let my_metric = self.my_metric(sg, interface);
                let outcome = self.store.assert_entry(interface, sg).timer_expired();
                self.apply_assert(interface, sg, my_metric, outcome, now, &mut actions);
            }
            TimerType::SourceActive { sg } => {
                let cancels = self.store.origination_entry(sg).source_expired();
                if !cancels.is_empty() {
                    log_info!(
                        self.logger,
                        Facility::Refresh,
                        "source {} went quiet; no longer originating refreshes",
                        sg
                    );
                    actions.cancels.extend(cancels);
                }
            }
            TimerType::StateRefresh { sg } => {
                let refresh_interval = self.config.refresh_interval;
                let rearm = self
                    .store
                    .origination_entry(sg)
                    .refresh_due(refresh_interval, now);
                if let Some(request) = rearm {
                    actions.timers.push(request);
                    self.originate_refresh(sg, now, &mut actions);
                }
            }
            TimerType::RpfCheck => {
                self.rpf_sweep(now, &mut actions);
                actions.timers.push(TimerRequest {
                    timer_type: TimerType::RpfCheck,
                    fire_at: now + self.config.rpf_check_interval,
                    replace_existing: false,
                });
            }
        }
        self.count_tx(&actions);
        Ok(actions)
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Neighbor disappeared (expiry or goodbye): clear assert winners it
    /// held, drop its prunes, and re-evaluate the flows it touched.
    fn neighbor_gone(
        &mut self,
        interface: InterfaceId,
        neighbor: Ipv4Addr,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let mut touched: BTreeSet<SourceGroupPair> = BTreeSet::new();

        let assert_keys: Vec<(InterfaceId, SourceGroupPair)> = self
            .store
            .asserts
            .keys()
            .filter(|(entry_if, _)| *entry_if == interface)
            .copied()
            .collect();
        for key in assert_keys {
            if let Some(machine) = self.store.asserts.get_mut(&key) {
                if let Some(outcome) = machine.winner_lost(neighbor) {
                    actions.cancels.extend(outcome.cancels);
                    if outcome.state_changed {
                        touched.insert(key.1);
                    }
                }
            }
        }

        let prune_keys: Vec<(InterfaceId, SourceGroupPair)> = self
            .store
            .downstream
            .iter()
            .filter(|((entry_if, _), machine)| {
                *entry_if == interface && machine.pruner == Some(neighbor)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in prune_keys {
            if let Some(machine) = self.store.downstream.get_mut(&key) {
                let cancels = machine.received_join_or_graft();
                if !cancels.is_empty() {
                    actions.cancels.extend(cancels);
                    touched.insert(key.1);
                }
            }
        }

        for sg in touched {
            self.evaluate_upstream(sg, now, actions);
        }
    }

    /// Shared assert-election path for Assert messages and State-Refresh
    fn run_assert_election(
        &mut self,
        interface: InterfaceId,
        sg: SourceGroupPair,
        received: AssertMetric,
        hold: Duration,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let my_metric = self.my_metric(sg, interface);
        let could_assert = self
            .table
            .rpf(sg)
            .map(|entry| entry.interface != interface)
            .unwrap_or(false);
        let outcome = self.store.assert_entry(interface, sg).received_metric(
            received,
            my_metric,
            could_assert,
            hold,
            now,
        );
        self.apply_assert(interface, sg, my_metric, outcome, now, actions);
    }

    fn apply_assert(
        &mut self,
        interface: InterfaceId,
        sg: SourceGroupPair,
        my_metric: AssertMetric,
        outcome: AssertOutcome,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        if outcome.send_assert {
            actions.packets.push(OutgoingPacket::on_interface(
                interface,
                PimMessage::Assert(AssertMessage::new(sg, my_metric.preference, my_metric.metric)),
            ));
        }
        if let Some(winner) = outcome.prune_winner {
            // Loser prunes itself toward the winner; the holdtime matches
            // the assert lifetime so both age out together
            let holdtime = self.config.assert_time.as_secs().min(u16::MAX as u64) as u16;
            actions.packets.push(OutgoingPacket::on_interface_to(
                interface,
                winner,
                PimMessage::JoinPrune(JoinPruneMessage::prune(winner, sg, holdtime)),
            ));
            log_notice!(
                self.logger,
                Facility::Assert,
                "lost assert for {} on {} to {}",
                sg,
                interface,
                winner
            );
        }
        actions.cancels.extend(outcome.cancels);
        actions.timers.extend(outcome.timers);
        if outcome.state_changed {
            self.evaluate_upstream(sg, now, actions);
        }
    }

    /// Originate one State-Refresh round on every downstream interface
    fn originate_refresh(
        &mut self,
        sg: SourceGroupPair,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let Some(rpf) = self.table.rpf(sg) else {
            return;
        };
        let Some(originator) = self.neighbors.local_address(rpf.interface) else {
            return;
        };
        let prunes = self.store.prunes_for(sg);
        let ttl = self.store.origination_entry(sg).data_ttl;
        let preference = self.rib.metric_preference(rpf.interface);
        let metric = self.rib.route_metric(rpf.interface, sg.source);
        let interval_secs = self.config.refresh_interval.as_secs().min(u8::MAX as u64) as u8;

        for out_interface in self.refresh_targets(sg, rpf.interface) {
            let refresh = StateRefreshMessage {
                group: sg.group,
                group_mask_len: 32,
                source: sg.source,
                originator,
                rpt_bit: false,
                metric_preference: preference,
                metric,
                mask_len: 32,
                ttl,
                prune_indicator: prunes.contains(&out_interface),
                prune_now: false,
                assert_override: false,
                interval_secs,
            };
            self.last_refresh.insert((out_interface, sg), refresh.clone());
            actions.packets.push(OutgoingPacket::on_interface(
                out_interface,
                PimMessage::StateRefresh(refresh),
            ));
        }
    }

    /// Data arrived on a non-RPF interface we would not forward on: prune
    /// the sender, at most once per prune holdtime.
    fn rate_limited_prune(
        &mut self,
        interface: InterfaceId,
        sender: Ipv4Addr,
        sg: SourceGroupPair,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let limited = self
            .rpf_prune_limit
            .get(&(interface, sg))
            .map(|until| now < *until)
            .unwrap_or(false);
        if limited {
            return;
        }
        let t_limit = self.config.prune_holdtime;
        self.rpf_prune_limit.insert((interface, sg), now + t_limit);
        actions.timers.push(TimerRequest {
            timer_type: TimerType::PruneLimit { interface, sg },
            fire_at: now + t_limit,
            replace_existing: true,
        });
        let holdtime = t_limit.as_secs().min(u16::MAX as u64) as u16;
        actions.packets.push(OutgoingPacket::on_interface_to(
            interface,
            sender,
            PimMessage::JoinPrune(JoinPruneMessage::prune(sender, sg, holdtime)),
        ));
    }

    /// Periodic re-resolution of every tracked source
    fn rpf_sweep(&mut self, now: Instant, actions: &mut EngineActions) {
        for sg in self.table.pairs() {
            match self.table.refresh(sg, &*self.rib) {
                RpfChange::Unchanged => {}
                RpfChange::Moved { old, new } => {
                    self.counters.rpf_changes += 1;
                    log_notice!(
                        self.logger,
                        Facility::Rpf,
                        "RPF for {} moved to {} via {}",
                        sg,
                        new.interface,
                        new.next_hop
                    );
                    self.rpf_moved(sg, old, new, now, actions);
                }
                RpfChange::Lost { .. } => {
                    log_warning!(
                        self.logger,
                        Facility::Rpf,
                        "source {} became unreachable; retrying next sweep",
                        sg.source
                    );
                }
            }
        }
    }

    fn rpf_moved(
        &mut self,
        sg: SourceGroupPair,
        _old: Option<RpfEntry>,
        new: RpfEntry,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        // The new upstream interface cannot be a downstream forwarder;
        // retire any assert state we held there.
        if let Some(machine) = self.store.asserts.get_mut(&(new.interface, sg)) {
            if machine.state != AssertState::NoInfo {
                machine.timer_expired();
                actions.cancels.push(TimerType::Assert {
                    interface: new.interface,
                    sg,
                });
            }
        }

        let (_, olist, _) = self.olist_sets(sg);
        let t_limit = self.config.prune_holdtime;
        let graft_retry = self.config.graft_retry_period;
        let upstream_actions = self.store.upstream_entry(sg).rpf_changed(
            (new.interface, new.next_hop),
            olist.is_empty(),
            new.directly_connected,
            t_limit,
            graft_retry,
            now,
        );
        self.apply_upstream(sg, upstream_actions, actions);
    }

    /// Compute (immediate olist, final olist, RPF entry) for one flow
    fn olist_sets(
        &self,
        sg: SourceGroupPair,
    ) -> (BTreeSet<InterfaceId>, BTreeSet<InterfaceId>, Option<RpfEntry>) {
        let pim_nbrs = self.neighbors.pim_nbrs();
        let prunes = self.store.prunes_for(sg);
        let lost_assert = self.store.lost_assert_for(sg);
        let inputs = OlistInputs {
            pim_nbrs: &pim_nbrs,
            prunes: &prunes,
            lost_assert: &lost_assert,
            boundary: &self.boundaries,
        };
        let rpf = self.table.rpf(sg);
        let immediate = olist::immediate_olist(sg, &self.membership, inputs);
        let mut final_set = immediate.clone();
        if let Some(entry) = rpf {
            final_set.remove(&entry.interface);
        }
        (immediate, final_set, rpf)
    }

    /// Interfaces a State-Refresh goes out on: every interface with PIM
    /// neighbors except the inbound one, boundaries, and interfaces where
    /// we lost the assert. Unlike the olist, Pruned interfaces stay in;
    /// the refresh is what keeps their prune state alive, carried with the
    /// Prune-Indicator bit set.
    fn refresh_targets(&self, sg: SourceGroupPair, inbound: InterfaceId) -> BTreeSet<InterfaceId> {
        let lost_assert = self.store.lost_assert_for(sg);
        let mut targets = self.neighbors.pim_nbrs();
        targets.remove(&inbound);
        targets.retain(|candidate| {
            !self.boundaries.contains(candidate) && !lost_assert.contains(candidate)
        });
        targets
    }

    /// RPF'(S,G): the cached next hop, substituted by the Assert winner on
    /// the RPF interface when we lost the election there.
    fn rpf_prime(&self, sg: SourceGroupPair) -> Option<(InterfaceId, Ipv4Addr)> {
        let entry = self.table.rpf(sg)?;
        if let Some(machine) = self.store.asserts.get(&(entry.interface, sg)) {
            if machine.state == AssertState::Loser {
                if let Some(winner) = machine.winner {
                    return Some((entry.interface, winner.address));
                }
            }
        }
        Some((entry.interface, entry.next_hop))
    }

    /// Our metric toward the source, announced on `interface`
    fn my_metric(&self, sg: SourceGroupPair, interface: InterfaceId) -> AssertMetric {
        let local = self
            .neighbors
            .local_address(interface)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        match self.table.rpf(sg) {
            Some(entry) => AssertMetric::new(
                self.rib.metric_preference(entry.interface),
                self.rib.route_metric(entry.interface, sg.source),
                local,
            ),
            None => AssertMetric::infinite(local),
        }
    }

    /// Re-run the upstream machine after anything that may have changed
    /// the olist.
    fn evaluate_upstream(
        &mut self,
        sg: SourceGroupPair,
        now: Instant,
        actions: &mut EngineActions,
    ) {
        let (_, olist, rpf) = self.olist_sets(sg);
        let directly_connected = rpf.map(|entry| entry.directly_connected).unwrap_or(false);
        let t_limit = self.config.prune_holdtime;
        let graft_retry = self.config.graft_retry_period;
        self.sync_upstream_rpf(sg);
        let upstream_actions = self.store.upstream_entry(sg).olist_changed(
            olist.is_empty(),
            directly_connected,
            t_limit,
            graft_retry,
            now,
        );
        self.apply_upstream(sg, upstream_actions, actions);
    }

    /// Keep the upstream validity pair aligned with RPF'(S,G)
    fn sync_upstream_rpf(&mut self, sg: SourceGroupPair) {
        let pair = self.rpf_prime(sg);
        let machine = self.store.upstream_entry(sg);
        if pair.is_some() {
            machine.rpf = pair;
        }
    }

    fn apply_upstream(
        &mut self,
        sg: SourceGroupPair,
        upstream_actions: UpstreamActions,
        actions: &mut EngineActions,
    ) {
        if let Some(send) = upstream_actions.send {
            self.send_upstream(sg, send, actions);
        }
        actions.cancels.extend(upstream_actions.cancels);
        actions.timers.extend(upstream_actions.timers);
    }

    fn send_upstream(&mut self, sg: SourceGroupPair, send: UpstreamSend, actions: &mut EngineActions) {
        let Some((interface, neighbor)) = self.rpf_prime(sg) else {
            log_warning!(
                self.logger,
                Facility::Upstream,
                "cannot send {:?} for {}: RPF unresolved",
                send,
                sg
            );
            return;
        };
        let holdtime = self.config.prune_holdtime.as_secs().min(u16::MAX as u64) as u16;
        let packet = match send {
            UpstreamSend::Join => OutgoingPacket::on_interface(
                interface,
                PimMessage::JoinPrune(JoinPruneMessage::join(neighbor, sg)),
            ),
            UpstreamSend::Prune => OutgoingPacket::on_interface(
                interface,
                PimMessage::JoinPrune(JoinPruneMessage::prune(neighbor, sg, holdtime)),
            ),
            UpstreamSend::Graft => {
                OutgoingPacket::unicast(neighbor, PimMessage::Graft(JoinPruneMessage::join(neighbor, sg)))
            }
        };
        actions.packets.push(packet);
    }

    fn is_upstream_pair(
        &self,
        sg: SourceGroupPair,
        interface: InterfaceId,
        neighbor: Ipv4Addr,
    ) -> bool {
        self.rpf_prime(sg) == Some((interface, neighbor))
    }

    fn reevaluate_group(&mut self, group: Ipv4Addr, now: Instant) -> EngineActions {
        let mut actions = EngineActions::default();
        for sg in self.table.pairs() {
            if sg.group == group {
                self.evaluate_upstream(sg, now, &mut actions);
            }
        }
        self.count_tx(&actions);
        actions
    }

    fn negotiated(&self, interface: InterfaceId) -> (Duration, Duration) {
        self.neighbors
            .interface(interface)
            .map(|status| (status.propagation_delay, status.override_interval))
            .unwrap_or((
                crate::config::DEFAULT_PROPAGATION_DELAY,
                crate::config::DEFAULT_OVERRIDE_INTERVAL,
            ))
    }

    fn iface_config(&self, interface: InterfaceId) -> PimInterfaceConfig {
        self.neighbors
            .interface(interface)
            .map(|status| status.config.clone())
            .unwrap_or_default()
    }

    fn jitter(&mut self, max: Duration) -> Duration {
        if max.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..=max.as_millis() as u64))
    }

    fn count_tx(&mut self, actions: &EngineActions) {
        self.counters.control_tx += actions.packets.len() as u64;
    }
}
