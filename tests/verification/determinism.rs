//! Determinism tests.
//!
//! Over in-memory transports a session pair is a pure function of its inputs, so two runs
//! with the same scripts must agree frame for frame, replays included.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{reference_state, GameStub, InputScript, StateStub};
use crate::common::test_utils::{
    memory_sessions, run_both, run_until_paused, step_once, synchronize_sessions,
};
use netplay_rollback::{Frame, FrameInputs, RollbackStats, MAX_DELAY_FRAMES};

struct Outcome {
    pause: Frame,
    host: StateStub,
    client: StateStub,
    host_stats: RollbackStats,
    client_stats: RollbackStats,
}

fn play(host: InputScript, client: InputScript, delay: u32, iterations: usize) -> Outcome {
    let mut pair = memory_sessions(GameStub::new(host), GameStub::new(client), delay);
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, iterations);
    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 500);
    Outcome {
        pause,
        host: pair.host.bridge().gs,
        client: pair.client.bridge().gs,
        host_stats: pair.host.rollback_stats(),
        client_stats: pair.client.rollback_stats(),
    }
}

#[test]
fn test_repeated_runs_are_identical() {
    let first = play(InputScript::Pattern(61), InputScript::Pattern(62), 2, 120);
    let second = play(InputScript::Pattern(61), InputScript::Pattern(62), 2, 120);
    assert_eq!(first.pause, second.pause);
    assert_eq!(first.host, second.host);
    assert_eq!(first.client, second.client);
    assert_eq!(first.host_stats, second.host_stats);
    assert_eq!(first.client_stats, second.client_stats);
}

#[test]
fn test_every_delay_reaches_the_reference() {
    for delay in [0, 1, 2, 4, 8, MAX_DELAY_FRAMES] {
        let outcome = play(InputScript::Pattern(63), InputScript::Pattern(64), delay, 100);
        let expected = reference_state(
            0,
            InputScript::Pattern(63),
            InputScript::Pattern(64),
            outcome.pause.as_u32(),
        );
        assert_eq!(outcome.host, expected, "host, delay {delay}");
        assert_eq!(outcome.client, expected, "client, delay {delay}");
        assert!(
            outcome.host_stats.max_replay_depth <= delay + 1,
            "delay {delay} replayed {} frames",
            outcome.host_stats.max_replay_depth
        );
    }
}

#[test]
fn test_steady_input_needs_no_replays() {
    let outcome = play(InputScript::Hold(2), InputScript::Hold(5), 3, 100);
    // Only the first real input can contradict the initial idle prediction.
    assert!(outcome.host_stats.replays <= 1);
    assert!(outcome.client_stats.replays <= 1);
    assert!(outcome.host_stats.skipped_frames > 0);
    assert_eq!(outcome.host, outcome.client);
}

#[test]
fn test_both_sides_simulate_the_same_inputs() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Hold(4)),
        GameStub::new(InputScript::Hold(9)),
        0,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);

    // Without delay nobody runs ahead, so every frame is stepped once with real input.
    let mut host_frames: Vec<FrameInputs> = Vec::new();
    let mut client_frames: Vec<FrameInputs> = Vec::new();
    for _ in 0..200 {
        host_frames.extend(step_once(&mut pair.host));
        client_frames.extend(step_once(&mut pair.client));
        if host_frames.len() >= 30 && client_frames.len() >= 30 {
            break;
        }
    }
    assert!(host_frames.len() >= 30 && client_frames.len() >= 30);
    for (host, client) in host_frames.iter().zip(&client_frames).take(30) {
        assert_eq!(host, client);
    }
    assert_eq!(pair.host.rollback_stats().replays, 0);
}
