//! Spectator integration tests over localhost TCP.
//!
//! Spectators use real sockets, so these tests run serially and wait a little between polls
//! instead of relying on in-memory delivery.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use serial_test::serial;

use crate::common::stubs::{reference_state, GameStub, InputScript};
use crate::common::test_utils::{
    chaos_sessions, drain_events, free_port, run_both, run_until_paused, synchronize_sessions,
};
use netplay_rollback::{
    ChaosConfig, Frame, NetplayEvent, NetplaySession, NullSink, SessionBuilder, SessionState,
    SpectatorSession, StepStatus,
};

const MAX_SPECTATOR_POLLS: usize = 500;

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Plays the spectator until it reaches `target`, giving the host a turn via `pump` between
/// polls.
fn watch_until(
    spectator: &mut SpectatorSession<GameStub>,
    target: Frame,
    mut pump: impl FnMut(),
) {
    for _ in 0..MAX_SPECTATOR_POLLS {
        if spectator.frame_count() >= target {
            return;
        }
        pump();
        if spectator.run_frame(&mut NullSink).unwrap() != StepStatus::Ready {
            thread::sleep(Duration::from_millis(1));
        }
    }
    panic!(
        "spectator stuck at {} (target {})",
        spectator.frame_count(),
        target
    );
}

#[test]
#[cfg(not(miri))]
#[serial]
fn test_spectator_follows_p2p_host_to_the_pause_frame() {
    let port = free_port();
    let mut pair = chaos_sessions(
        GameStub::new(InputScript::Pattern(31)),
        GameStub::new(InputScript::Pattern(32)),
        SessionBuilder::new()
            .with_nickname("host")
            .with_delay_frames(1)
            .unwrap()
            .with_spectator_port(port),
        SessionBuilder::new().with_nickname("client"),
        ChaosConfig::passthrough(),
        ChaosConfig::passthrough(),
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 15);

    let mut spectator = SessionBuilder::new()
        .with_nickname("viewer")
        .start_spectator_session(GameStub::new(InputScript::Idle), localhost(port))
        .unwrap();
    for _ in 0..MAX_SPECTATOR_POLLS {
        if spectator.state() == SessionState::Synchronized {
            break;
        }
        run_both(&mut pair.host, &mut pair.client, 1);
        spectator.run_frame(&mut NullSink).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(spectator.state(), SessionState::Synchronized);
    assert_eq!(spectator.host_nickname(), "host");
    assert_eq!(pair.host.num_spectators(), 1);
    assert!(drain_events(&mut pair.host)
        .iter()
        .any(|e| matches!(e, NetplayEvent::SpectatorJoined { .. })));

    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);
    watch_until(&mut spectator, pause, || {
        run_both(&mut pair.host, &mut pair.client, 1);
    });

    assert_eq!(spectator.frame_count(), pause);
    assert_eq!(spectator.bridge().gs, pair.host.bridge().gs);
    assert_eq!(
        spectator.bridge().gs,
        reference_state(
            0,
            InputScript::Pattern(31),
            InputScript::Pattern(32),
            pause.as_u32()
        )
    );
    // A paused stream has nothing more to play.
    assert_eq!(spectator.run_frame(&mut NullSink).unwrap(), StepStatus::Stalled);
}

#[test]
#[cfg(not(miri))]
#[serial]
fn test_spectator_follows_broadcast() {
    let port = free_port();
    let mut caster = SessionBuilder::new()
        .with_nickname("caster")
        .start_broadcast_session(GameStub::new(InputScript::Hold(3)), port)
        .unwrap();
    for _ in 0..10 {
        caster.run_frame(&mut NullSink).unwrap();
    }

    let mut spectator =
        SpectatorSession::connect(GameStub::new(InputScript::Idle), localhost(port), "viewer")
            .unwrap();
    for _ in 0..MAX_SPECTATOR_POLLS {
        caster.run_frame(&mut NullSink).unwrap();
        spectator.run_frame(&mut NullSink).unwrap();
        if spectator.state() == SessionState::Synchronized && caster.frame_count().as_u32() >= 40
        {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(caster.num_spectators(), 1);
    assert_eq!(spectator.host_nickname(), "caster");

    let target = caster.frame_count();
    watch_until(&mut spectator, target, || {});
    assert_eq!(spectator.bridge().gs, caster.bridge().gs);
    assert_eq!(spectator.frames_behind(), 0);
}

#[test]
#[cfg(not(miri))]
#[serial]
fn test_spectator_leaving_is_reported() {
    let port = free_port();
    let mut caster = SessionBuilder::new()
        .start_broadcast_session(GameStub::new(InputScript::Idle), port)
        .unwrap();
    let mut spectator =
        SpectatorSession::connect(GameStub::new(InputScript::Idle), localhost(port), "viewer")
            .unwrap();
    for _ in 0..MAX_SPECTATOR_POLLS {
        caster.run_frame(&mut NullSink).unwrap();
        spectator.run_frame(&mut NullSink).unwrap();
        if spectator.state() == SessionState::Synchronized {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(caster.num_spectators(), 1);

    drop(spectator);
    let mut left = false;
    for _ in 0..MAX_SPECTATOR_POLLS {
        caster.run_frame(&mut NullSink).unwrap();
        if caster
            .events()
            .any(|e| matches!(e, NetplayEvent::SpectatorLeft { .. }))
        {
            left = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(left, "spectator departure never reported");
    assert_eq!(caster.num_spectators(), 0);
}

#[test]
#[cfg(not(miri))]
#[serial]
fn test_spectator_without_host_fails_to_connect() {
    let port = free_port();
    assert!(
        SpectatorSession::connect(GameStub::new(InputScript::Idle), localhost(port), "viewer")
            .is_err()
    );
}
