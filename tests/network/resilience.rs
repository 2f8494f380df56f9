//! Sessions over lossy, duplicating and reordering datagram paths.
//!
//! Commands still travel over a lossless stream; only frame packets suffer. Every test ends
//! with both peers paused on the same frame and compares them against a local reference run.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use crate::common::stubs::{reference_state, GameStub, InputScript};
use crate::common::test_utils::{
    chaos_sessions, run_lossy, settle_at_pause, synchronize_sessions, SessionPair,
};
use netplay_rollback::{
    ChaosConfig, Frame, NetplaySession, NullSink, ProtocolConfig, SessionBuilder, StepStatus,
};

const HOST_SCRIPT: InputScript = InputScript::Pattern(41);
const CLIENT_SCRIPT: InputScript = InputScript::Pattern(42);

fn builder(delay_frames: u32, redundancy: usize) -> SessionBuilder {
    SessionBuilder::new()
        .with_delay_frames(delay_frames)
        .unwrap()
        .with_protocol_config(ProtocolConfig {
            resend_interval: Duration::from_millis(5),
            stall_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            redundancy,
        })
}

fn unreliable_pair(
    delay_frames: u32,
    redundancy: usize,
    host_chaos: ChaosConfig,
    client_chaos: ChaosConfig,
) -> SessionPair {
    let mut pair = chaos_sessions(
        GameStub::new(HOST_SCRIPT),
        GameStub::new(CLIENT_SCRIPT),
        builder(delay_frames, redundancy),
        builder(delay_frames, redundancy),
        host_chaos,
        client_chaos,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    pair
}

/// Plays `iterations` rounds, pauses and checks both peers against the reference.
fn play_and_compare(pair: &mut SessionPair, iterations: usize, context: &str) {
    run_lossy(pair, iterations);
    let pause = pair.host.request_pause().unwrap();
    settle_at_pause(pair, pause, 5_000);

    let expected = reference_state(0, HOST_SCRIPT, CLIENT_SCRIPT, pause.as_u32());
    assert_eq!(pair.host.bridge().gs, expected, "host, {context}");
    assert_eq!(pair.client.bridge().gs, expected, "client, {context}");
}

#[test]
fn test_single_lost_packet_is_covered_by_the_next() {
    // Every armed frame sends at least one packet, so send 4 carries frame 4 at the latest.
    let mut pair = chaos_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        builder(2, 8),
        builder(2, 8),
        ChaosConfig::builder().drop_send(4).build(),
        ChaosConfig::passthrough(),
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);

    for round in 0..30 {
        assert_eq!(
            pair.host.run_frame(&mut NullSink).unwrap(),
            StepStatus::Ready,
            "host, round {round}"
        );
        assert_eq!(
            pair.client.run_frame(&mut NullSink).unwrap(),
            StepStatus::Ready,
            "client, round {round}"
        );
    }

    let read = pair.client.sync_layer().unwrap().read_frame();
    assert!(read >= Frame::new(20), "client stuck reading at {read}");
    assert!(
        pair.client.network_stats().packets_received < pair.host.network_stats().packets_sent,
        "nothing was dropped"
    );
    for session in [&pair.host, &pair.client] {
        assert_eq!(session.rollback_stats().replays, 0);
        assert_eq!(session.network_stats().stalls, 0);
    }
}

#[test]
fn test_random_loss_converges() {
    for seed in 1..=4 {
        let mut pair = unreliable_pair(
            2,
            16,
            ChaosConfig::lossy(0.2, seed),
            ChaosConfig::lossy(0.2, seed + 100),
        );
        play_and_compare(&mut pair, 150, &format!("seed {seed}"));
        assert!(pair.host.network_stats().packets_sent > 0);
    }
}

#[test]
fn test_terrible_network_converges() {
    for seed in [7, 8, 9] {
        let mut pair = unreliable_pair(
            3,
            16,
            ChaosConfig::terrible_network(seed),
            ChaosConfig::terrible_network(seed ^ 0xFF),
        );
        play_and_compare(&mut pair, 200, &format!("seed {seed}"));
    }
}

#[test]
fn test_duplicates_and_reordering_are_ignored() {
    let chaos = |seed| {
        ChaosConfig::builder()
            .duplication_rate(0.5)
            .reorder_rate(0.5)
            .seed(seed)
            .build()
    };
    let mut pair = unreliable_pair(2, 8, chaos(3), chaos(4));
    play_and_compare(&mut pair, 150, "duplication and reordering");

    // Every frame is repeated in the window anyway; the extra copies only add to that.
    let ignored = pair.host.network_stats().inputs_ignored
        + pair.client.network_stats().inputs_ignored;
    assert!(ignored > 0);
}

#[test]
fn test_burst_loss_recovers() {
    let chaos = |seed| {
        ChaosConfig::builder()
            .burst_loss(0.05, 30)
            .seed(seed)
            .build()
    };
    let mut pair = unreliable_pair(1, 16, chaos(11), chaos(12));
    play_and_compare(&mut pair, 250, "burst loss");
}

#[test]
fn test_targeted_drops_are_covered_by_redundancy() {
    let drops = |first: u64| {
        (first..first + 6)
            .fold(ChaosConfig::builder(), |builder, index| {
                builder.drop_send(index)
            })
            .build()
    };
    let mut pair = unreliable_pair(2, 16, drops(10), drops(20));
    play_and_compare(&mut pair, 80, "targeted drops");
}

#[test]
fn test_minimum_redundancy_converges() {
    let mut pair = unreliable_pair(
        2,
        1,
        ChaosConfig::lossy(0.1, 5),
        ChaosConfig::lossy(0.1, 6),
    );
    play_and_compare(&mut pair, 120, "minimum redundancy");
}

#[test]
fn test_delayed_delivery_converges() {
    let chaos = |seed| ChaosConfig::builder().delay_polls(6).seed(seed).build();
    let mut pair = unreliable_pair(2, 16, chaos(21), chaos(22));
    play_and_compare(&mut pair, 150, "delayed delivery");
    let replays = pair.host.rollback_stats().replays + pair.client.rollback_stats().replays;
    assert!(replays > 0, "late input never caused a replay");
}
