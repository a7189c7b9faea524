// SPDX-License-Identifier: Apache-2.0 OR MIT
//! End-to-end protocol scenarios driven through the public engine API.
//!
//! Each test builds a small topology (interfaces, neighbors, a unicast
//! route), feeds wire-encoded packets and timer expiries to the engine,
//! and checks the packets and timers it asks for in return.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pimdm::engine::PimDmEngine;
use pimdm::logging::Logger;
use pimdm::messages::{AssertMessage, HelloMessage, JoinPruneMessage, PimMessage};
use pimdm::rib::{UnicastRib, UnicastRoute};
use pimdm::timers::TimerType;
use pimdm::{
    InterfaceId, PacketEnvelope, PimDmConfig, PimDmEvent, SourceGroupPair, ALL_PIM_ROUTERS,
};

/// Unicast RIB whose routes can be changed mid-test to model convergence
#[derive(Debug, Clone, Default)]
struct SharedRib {
    routes: Arc<Mutex<HashMap<Ipv4Addr, UnicastRoute>>>,
}

impl SharedRib {
    fn set_route(&self, destination: Ipv4Addr, interface: InterfaceId, next_hop: Ipv4Addr) {
        self.routes.lock().unwrap().insert(
            destination,
            UnicastRoute {
                interface,
                next_hop,
                directly_connected: false,
            },
        );
    }
}

impl UnicastRib for SharedRib {
    fn route_to(&self, destination: Ipv4Addr) -> Option<UnicastRoute> {
        self.routes.lock().unwrap().get(&destination).copied()
    }

    fn metric_preference(&self, _interface: InterfaceId) -> u32 {
        101
    }

    fn route_metric(&self, _interface: InterfaceId, _destination: Ipv4Addr) -> u32 {
        20
    }
}

fn sg() -> SourceGroupPair {
    SourceGroupPair::new("192.0.2.1".parse().unwrap(), "239.1.1.1".parse().unwrap())
}

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

struct Topology {
    engine: PimDmEngine,
    rib: SharedRib,
    upstream_if: InterfaceId,
    downstream_if: InterfaceId,
    now: Instant,
}

/// Two interfaces: eth0 (10.0.0.1) toward the source via next hop 10.0.0.9,
/// eth1 (10.0.1.1) downstream.
fn topology() -> Topology {
    let rib = SharedRib::default();
    rib.set_route(sg().source, InterfaceId(0), addr("10.0.0.9"));
    let mut engine = PimDmEngine::with_seed(
        PimDmConfig::default(),
        Box::new(rib.clone()),
        Logger::disabled(),
        99,
    );
    let now = Instant::now();
    let (upstream_if, _) = engine.enable_interface("eth0", addr("10.0.0.1"), now);
    let (downstream_if, _) = engine.enable_interface("eth1", addr("10.0.1.1"), now);
    assert_eq!(upstream_if, InterfaceId(0));
    Topology {
        engine,
        rib,
        upstream_if,
        downstream_if,
        now,
    }
}

fn deliver(
    engine: &mut PimDmEngine,
    interface: InterfaceId,
    sender: &str,
    message: PimMessage,
    now: Instant,
) -> pimdm::EngineActions {
    engine
        .handle_event(
            PimDmEvent::PacketReceived(PacketEnvelope {
                interface,
                sender: addr(sender),
                destination: ALL_PIM_ROUTERS,
                payload: message.encode(),
            }),
            now,
        )
        .unwrap()
}

fn deliver_hello(
    engine: &mut PimDmEngine,
    interface: InterfaceId,
    sender: &str,
    generation_id: u32,
    now: Instant,
) -> pimdm::EngineActions {
    deliver(
        engine,
        interface,
        sender,
        PimMessage::Hello(HelloMessage::build(105, Some((500, 2500)), generation_id, None)),
        now,
    )
}

fn fire(engine: &mut PimDmEngine, timer: TimerType, now: Instant) -> pimdm::EngineActions {
    engine.handle_event(PimDmEvent::TimerExpired(timer), now).unwrap()
}

fn data(
    engine: &mut PimDmEngine,
    interface: InterfaceId,
    sender: &str,
    now: Instant,
) -> pimdm::EngineActions {
    engine
        .handle_event(
            PimDmEvent::DataPacket {
                interface,
                sender: addr(sender),
                sg: sg(),
                ttl: 16,
                payload: vec![0xaa; 32],
            },
            now,
        )
        .unwrap()
}

fn join_packets(actions: &pimdm::EngineActions) -> Vec<&JoinPruneMessage> {
    actions
        .packets
        .iter()
        .filter_map(|p| match &p.message {
            PimMessage::JoinPrune(jp) if jp.joins().count() > 0 => Some(jp),
            _ => None,
        })
        .collect()
}

fn prune_packets(actions: &pimdm::EngineActions) -> Vec<&JoinPruneMessage> {
    actions
        .packets
        .iter()
        .filter_map(|p| match &p.message {
            PimMessage::JoinPrune(jp) if jp.prunes().count() > 0 => Some(jp),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------
// Scenario: Join override on shared media
// ---------------------------------------------------------------------

/// A sibling on the shared upstream LAN prunes our RPF neighbor while we
/// still have a member. We arm a randomized override and, if nobody else
/// joins first, send the overriding Join ourselves.
#[test]
fn test_join_override_after_sibling_prune() {
    let mut t = topology();
    // Two routers on the upstream LAN: the RPF neighbor and a sibling
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.7", 2, t.now);
    t.engine.register_source_group(sg(), t.now);
    // A local member keeps the olist non-empty
    t.engine
        .register_member(None, sg().group, t.downstream_if, t.now);

    // Overheard: the sibling prunes our RPF neighbor
    let actions = deliver(
        &mut t.engine,
        t.upstream_if,
        "10.0.0.7",
        PimMessage::JoinPrune(JoinPruneMessage::prune(addr("10.0.0.9"), sg(), 210)),
        t.now,
    );
    let override_timer = actions
        .timers
        .iter()
        .find(|req| req.timer_type == TimerType::Override { sg: sg() })
        .expect("override timer armed");
    // Randomized within the override interval, never immediate
    assert!(override_timer.fire_at <= t.now + Duration::from_millis(2500));
    assert!(join_packets(&actions).is_empty());

    // Nobody else joined: the override fires and our Join goes out
    let actions = fire(
        &mut t.engine,
        TimerType::Override { sg: sg() },
        t.now + Duration::from_millis(1800),
    );
    let joins = join_packets(&actions);
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].upstream_neighbor, addr("10.0.0.9"));
    assert_eq!(
        actions.packets[0].interface,
        Some(t.upstream_if),
        "join goes to the RPF link"
    );
}

/// Overhearing another downstream router's Join makes our pending override
/// redundant.
#[test]
fn test_sibling_join_cancels_override() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.7", 2, t.now);
    t.engine.register_source_group(sg(), t.now);
    t.engine
        .register_member(None, sg().group, t.downstream_if, t.now);

    deliver(
        &mut t.engine,
        t.upstream_if,
        "10.0.0.7",
        PimMessage::JoinPrune(JoinPruneMessage::prune(addr("10.0.0.9"), sg(), 210)),
        t.now,
    );

    // The sibling's Join arrives before our override window closes
    let actions = deliver(
        &mut t.engine,
        t.upstream_if,
        "10.0.0.7",
        PimMessage::JoinPrune(JoinPruneMessage::join(addr("10.0.0.9"), sg())),
        t.now + Duration::from_millis(300),
    );
    assert!(actions.cancels.contains(&TimerType::Override { sg: sg() }));
    assert!(join_packets(&actions).is_empty());
}

/// A Prune addressed to us on a link with other neighbors opens the
/// prune-pending window instead of pruning immediately, so a Join can
/// override it.
#[test]
fn test_downstream_prune_pending_overridden_by_join() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.2", 2, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.3", 3, t.now);
    t.engine.register_source_group(sg(), t.now);

    // One downstream neighbor prunes
    let actions = deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.2",
        PimMessage::JoinPrune(JoinPruneMessage::prune(addr("10.0.1.1"), sg(), 210)),
        t.now,
    );
    let pending = actions
        .timers
        .iter()
        .find(|req| {
            req.timer_type
                == TimerType::PrunePending {
                    interface: t.downstream_if,
                    sg: sg(),
                }
        })
        .expect("prune-pending armed");
    // Multi-access link: the window is propagation delay plus jitter,
    // never zero
    assert!(pending.fire_at > t.now);

    // The other neighbor overrides with a Join before the window closes
    let actions = deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.3",
        PimMessage::JoinPrune(JoinPruneMessage::join(addr("10.0.1.1"), sg())),
        t.now + Duration::from_millis(200),
    );
    assert!(actions.cancels.contains(&TimerType::PrunePending {
        interface: t.downstream_if,
        sg: sg(),
    }));

    // The stale expiry is a no-op: data still flows downstream
    fire(
        &mut t.engine,
        TimerType::PrunePending {
            interface: t.downstream_if,
            sg: sg(),
        },
        t.now + Duration::from_secs(3),
    );
    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now + Duration::from_secs(4));
    assert_eq!(actions.forwards.len(), 1);
    assert_eq!(actions.forwards[0].out_interfaces, vec![t.downstream_if]);
}

// ---------------------------------------------------------------------
// Scenario: Assert negotiation
// ---------------------------------------------------------------------

/// Two forwarders on the downstream LAN. The one with the worse metric
/// loses the election, prunes itself toward the winner, and stops
/// forwarding; when the winner dies the state clears.
#[test]
fn test_assert_negotiation_loser_stops_forwarding() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.7", 2, t.now);
    t.engine.register_source_group(sg(), t.now);

    // Flooding works before the contest
    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now);
    assert_eq!(actions.forwards.len(), 1);

    // The sibling advertises a better metric (lower preference wins)
    let actions = deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.7",
        PimMessage::Assert(AssertMessage::new(sg(), 90, 5)),
        t.now,
    );
    let prunes = prune_packets(&actions);
    assert!(
        prunes.iter().any(|jp| jp.upstream_neighbor == addr("10.0.1.7")),
        "loser prunes itself toward the winner"
    );

    // Losing the only downstream interface empties the olist: the next
    // packet is not forwarded
    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now + Duration::from_secs(1));
    assert!(actions.forwards.is_empty());

    // The winner expires: the assert state clears with it
    let actions = fire(
        &mut t.engine,
        TimerType::NeighborExpiry {
            interface: t.downstream_if,
            neighbor: addr("10.0.1.7"),
        },
        t.now + Duration::from_secs(120),
    );
    assert!(actions.cancels.contains(&TimerType::Assert {
        interface: t.downstream_if,
        sg: sg(),
    }));
}

/// An inferior assert keeps us Winner: we answer with our own metric and
/// keep forwarding.
#[test]
fn test_assert_winner_reasserts_against_inferior_metric() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.7", 2, t.now);
    t.engine.register_source_group(sg(), t.now);

    let actions = deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.7",
        PimMessage::Assert(AssertMessage::new(sg(), 200, 99)),
        t.now,
    );
    let assert_reply = actions
        .packets
        .iter()
        .find_map(|p| match &p.message {
            PimMessage::Assert(m) => Some(m),
            _ => None,
        })
        .expect("winner re-asserts");
    assert_eq!(assert_reply.metric_preference, 101);
    assert_eq!(assert_reply.metric, 20);
    assert!(prune_packets(&actions).is_empty());

    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now + Duration::from_secs(1));
    assert_eq!(actions.forwards.len(), 1);
}

// ---------------------------------------------------------------------
// Scenario: RPF change triggers a Graft
// ---------------------------------------------------------------------

/// While pruned, the unicast route to the source moves to another
/// interface with active downstream interest. The engine cancels the
/// timers bound to the old RPF pair and grafts toward the new next hop.
#[test]
fn test_rpf_change_cancels_old_pair_and_grafts() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.2", 2, t.now);
    t.engine.register_source_group(sg(), t.now);

    // The only downstream neighbor prunes; we prune upstream
    deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.2",
        PimMessage::JoinPrune(JoinPruneMessage::prune(addr("10.0.1.1"), sg(), 210)),
        t.now,
    );
    let actions = fire(
        &mut t.engine,
        TimerType::PrunePending {
            interface: t.downstream_if,
            sg: sg(),
        },
        t.now,
    );
    assert_eq!(prune_packets(&actions).len(), 1);

    // Downstream interest returns
    deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.2",
        PimMessage::JoinPrune(JoinPruneMessage::join(addr("10.0.1.1"), sg())),
        t.now + Duration::from_secs(1),
    );

    // The IGP moves the route: eth1 becomes the RPF interface
    t.rib.set_route(sg().source, t.downstream_if, addr("10.0.1.2"));
    let actions = fire(&mut t.engine, TimerType::RpfCheck, t.now + Duration::from_secs(2));

    // Old-pair timers are cancelled
    assert!(actions.cancels.contains(&TimerType::PruneLimit {
        interface: t.upstream_if,
        sg: sg(),
    }));
    assert!(actions.cancels.contains(&TimerType::Override { sg: sg() }));

    // Graft travels unicast to the new next hop, retry armed
    let graft = actions
        .packets
        .iter()
        .find(|p| matches!(p.message, PimMessage::Graft(_)))
        .expect("graft sent");
    assert_eq!(graft.interface, None);
    assert_eq!(graft.destination, addr("10.0.1.2"));
    assert!(actions
        .timers
        .iter()
        .any(|req| req.timer_type == TimerType::GraftRetry { sg: sg() }));

    // GraftAck from the new RPF neighbor settles the machine
    let ack = JoinPruneMessage::join(addr("10.0.1.2"), sg());
    let actions = t
        .engine
        .handle_event(
            PimDmEvent::PacketReceived(PacketEnvelope {
                interface: t.downstream_if,
                sender: addr("10.0.1.2"),
                destination: addr("10.0.1.1"),
                payload: PimMessage::GraftAck(ack).encode(),
            }),
            t.now + Duration::from_secs(3),
        )
        .unwrap();
    assert!(actions.cancels.contains(&TimerType::GraftRetry { sg: sg() }));
}

/// A Graft left unacknowledged is retransmitted every retry period.
#[test]
fn test_graft_retransmits_until_acked() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.2", 2, t.now);
    t.engine.register_source_group(sg(), t.now);

    deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.2",
        PimMessage::JoinPrune(JoinPruneMessage::prune(addr("10.0.1.1"), sg(), 210)),
        t.now,
    );
    fire(
        &mut t.engine,
        TimerType::PrunePending {
            interface: t.downstream_if,
            sg: sg(),
        },
        t.now,
    );
    // Interest returns: first Graft
    let actions = deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.2",
        PimMessage::JoinPrune(JoinPruneMessage::join(addr("10.0.1.1"), sg())),
        t.now + Duration::from_secs(1),
    );
    assert!(actions
        .packets
        .iter()
        .any(|p| matches!(p.message, PimMessage::Graft(_))));

    // No ack: retry fires and the Graft goes out again
    let actions = fire(
        &mut t.engine,
        TimerType::GraftRetry { sg: sg() },
        t.now + Duration::from_secs(4),
    );
    let graft = actions
        .packets
        .iter()
        .find(|p| matches!(p.message, PimMessage::Graft(_)))
        .expect("graft retransmitted");
    assert_eq!(graft.destination, addr("10.0.0.9"));
    assert!(actions
        .timers
        .iter()
        .any(|req| req.timer_type == TimerType::GraftRetry { sg: sg() }));
}

// ---------------------------------------------------------------------
// Scenario: generation-ID restart
// ---------------------------------------------------------------------

/// The upstream neighbor restarts (new generation ID). It forgot our
/// prune, so we replay it, and our triggered Hello is scheduled promptly.
#[test]
fn test_genid_restart_replays_prune_after_hello() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    deliver_hello(&mut t.engine, t.downstream_if, "10.0.1.2", 2, t.now);
    t.engine.register_source_group(sg(), t.now);

    // Reach upstream-Pruned state
    deliver(
        &mut t.engine,
        t.downstream_if,
        "10.0.1.2",
        PimMessage::JoinPrune(JoinPruneMessage::prune(addr("10.0.1.1"), sg(), 210)),
        t.now,
    );
    let actions = fire(
        &mut t.engine,
        TimerType::PrunePending {
            interface: t.downstream_if,
            sg: sg(),
        },
        t.now,
    );
    assert_eq!(prune_packets(&actions).len(), 1);
    // Let the prune rate-limit window close before the restart
    fire(
        &mut t.engine,
        TimerType::PruneLimit {
            interface: t.upstream_if,
            sg: sg(),
        },
        t.now + Duration::from_secs(210),
    );

    // Same neighbor, new generation ID
    let restart_at = t.now + Duration::from_secs(211);
    let actions = deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 2, restart_at);

    // Triggered Hello scheduled with jitter
    let hello = actions
        .timers
        .iter()
        .find(|req| {
            req.timer_type
                == TimerType::TriggeredHello {
                    interface: t.upstream_if,
                }
        })
        .expect("triggered hello armed");
    assert!(hello.fire_at <= restart_at + Duration::from_secs(5));

    // The prune is re-announced so the restarted neighbor stops flooding
    let prunes = prune_packets(&actions);
    assert_eq!(prunes.len(), 1);
    assert_eq!(prunes[0].upstream_neighbor, addr("10.0.0.9"));
}

/// An unchanged generation ID is a plain refresh: no replay, just a new
/// liveness deadline.
#[test]
fn test_genid_unchanged_is_plain_refresh() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    t.engine.register_source_group(sg(), t.now);

    let actions = deliver_hello(
        &mut t.engine,
        t.upstream_if,
        "10.0.0.9",
        1,
        t.now + Duration::from_secs(30),
    );
    assert!(actions.packets.is_empty());
    let expiry = actions
        .timers
        .iter()
        .find(|req| {
            req.timer_type
                == TimerType::NeighborExpiry {
                    interface: t.upstream_if,
                    neighbor: addr("10.0.0.9"),
                }
        })
        .expect("liveness deadline refreshed");
    assert!(expiry.replace_existing);
}

// ---------------------------------------------------------------------
// Membership and boundary behavior
// ---------------------------------------------------------------------

/// Local members keep an interface in the olist with no PIM neighbors on
/// it; an administrative boundary removes it unconditionally.
#[test]
fn test_membership_and_boundary_shape_the_olist() {
    let mut t = topology();
    deliver_hello(&mut t.engine, t.upstream_if, "10.0.0.9", 1, t.now);
    t.engine.register_source_group(sg(), t.now);

    // No neighbors and no members downstream: nothing to forward to
    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now);
    assert!(actions.forwards.is_empty());

    // A member appears; the engine grafts back and data flows again
    let actions = t
        .engine
        .register_member(None, sg().group, t.downstream_if, t.now);
    assert!(actions
        .packets
        .iter()
        .any(|p| matches!(p.message, PimMessage::Graft(_))));
    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now + Duration::from_secs(1));
    assert_eq!(actions.forwards.len(), 1);

    // A boundary on the member interface wins over membership
    t.engine.set_boundary(t.downstream_if, true, t.now + Duration::from_secs(2));
    let actions = data(&mut t.engine, t.upstream_if, "10.0.0.9", t.now + Duration::from_secs(3));
    assert!(actions.forwards.is_empty());
}
