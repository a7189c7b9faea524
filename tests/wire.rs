// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Wire-format checks across the public codec surface.

use pimdm::messages::{
    AssertMessage, HelloMessage, JoinPruneMessage, PimMessage, StateRefreshMessage,
};
use pimdm::{DecodeError, SourceGroupPair};

fn sg() -> SourceGroupPair {
    SourceGroupPair::new("192.0.2.1".parse().unwrap(), "239.1.1.1".parse().unwrap())
}

#[test]
fn test_hello_options_survive_the_wire() {
    let hello = HelloMessage::build(105, Some((500, 2500)), 0xdead_beef, Some((1, 60)));
    let bytes = PimMessage::Hello(hello).encode();

    let decoded = match PimMessage::decode(&bytes).unwrap() {
        PimMessage::Hello(h) => h,
        other => panic!("wrong type: {:?}", other),
    };
    assert_eq!(decoded.holdtime(), Some(105));
    assert_eq!(decoded.generation_id(), Some(0xdead_beef));
    assert_eq!(decoded.lan_prune_delay(), Some((500, 2500)));
    assert_eq!(decoded.state_refresh_capable(), Some((1, 60)));
}

#[test]
fn test_graft_and_graft_ack_keep_distinct_type_codes() {
    let body = JoinPruneMessage::join("10.0.0.9".parse().unwrap(), sg());
    let graft = PimMessage::Graft(body.clone()).encode();
    let ack = PimMessage::GraftAck(body).encode();

    // Same body, different message type in the header
    assert_ne!(graft[0], ack[0]);
    assert!(matches!(
        PimMessage::decode(&graft).unwrap(),
        PimMessage::Graft(_)
    ));
    assert!(matches!(
        PimMessage::decode(&ack).unwrap(),
        PimMessage::GraftAck(_)
    ));
}

#[test]
fn test_flipped_checksum_bit_rejected() {
    let mut bytes = PimMessage::Assert(AssertMessage::new(sg(), 101, 20)).encode();
    *bytes.last_mut().unwrap() ^= 0x01;
    assert!(matches!(
        PimMessage::decode(&bytes),
        Err(DecodeError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_truncated_body_rejected_without_panic() {
    let bytes = PimMessage::JoinPrune(JoinPruneMessage::prune(
        "10.0.0.9".parse().unwrap(),
        sg(),
        210,
    ))
    .encode();
    // Every prefix either decodes or errors cleanly
    for len in 0..bytes.len() {
        assert!(PimMessage::decode(&bytes[..len]).is_err());
    }
}

#[test]
fn test_state_refresh_flags_round_trip() {
    let refresh = StateRefreshMessage {
        group: sg().group,
        group_mask_len: 32,
        source: sg().source,
        originator: "10.0.0.1".parse().unwrap(),
        rpt_bit: false,
        metric_preference: 101,
        metric: 20,
        mask_len: 32,
        ttl: 16,
        prune_indicator: true,
        prune_now: false,
        assert_override: true,
        interval_secs: 60,
    };
    let bytes = PimMessage::StateRefresh(refresh.clone()).encode();
    let decoded = match PimMessage::decode(&bytes).unwrap() {
        PimMessage::StateRefresh(m) => m,
        other => panic!("wrong type: {:?}", other),
    };
    assert_eq!(decoded, refresh);
}
