//! P2P session integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{reference_state, GameStub, InputScript};
use crate::common::test_utils::{
    chaos_sessions, drain_events, memory_sessions, run_both, run_until_paused,
    synchronize_sessions,
};
use netplay_rollback::network::memory::{memory_command_pair, memory_datagram_pair};
use netplay_rollback::{
    CheatCode, ChaosConfig, DisconnectReason, Frame, NetplayError, NetplayEvent,
    NetplaySession, NullSink, ProtocolConfig, Role, SessionBuilder, SessionState, StepStatus,
};
use std::time::Duration;

fn quick_timeouts() -> ProtocolConfig {
    ProtocolConfig {
        resend_interval: Duration::from_millis(20),
        stall_timeout: Duration::from_millis(150),
        handshake_timeout: Duration::from_millis(150),
        ..ProtocolConfig::default()
    }
}

#[test]
fn test_synchronize_reports_peer_and_delay() {
    let mut pair = memory_sessions(
        GameStub::with_state(InputScript::Idle, 42),
        GameStub::new(InputScript::Idle),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);

    let host_events = drain_events(&mut pair.host);
    assert!(host_events.contains(&NetplayEvent::Synchronized {
        peer: "client".to_owned(),
        delay_frames: 2,
    }));
    let client_events = drain_events(&mut pair.client);
    assert!(client_events.contains(&NetplayEvent::Synchronized {
        peer: "host".to_owned(),
        delay_frames: 2,
    }));
    assert!(client_events
        .iter()
        .any(|e| matches!(e, NetplayEvent::PeerConfig(_))));

    let info = pair.client.peer_info().unwrap();
    assert_eq!(info.nickname, "host");
    assert_eq!(info.delay_frames, 2);
    assert!(!info.spectating);
}

#[test]
fn test_client_adopts_host_state() {
    let mut pair = memory_sessions(
        GameStub::with_state(InputScript::Idle, 0xDEAD_BEEF),
        GameStub::with_state(InputScript::Idle, 7),
        1,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 3);
    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);

    let expected = reference_state(
        0xDEAD_BEEF,
        InputScript::Idle,
        InputScript::Idle,
        pause.as_u32(),
    );
    assert_eq!(pair.client.bridge().gs, expected);
}

#[test]
fn test_clean_run_has_no_replays() {
    // Frame 0 is idle on both sides and idle input is what gets predicted, so a
    // quiet pair never mispredicts.
    let mut pair = memory_sessions(
        GameStub::with_state(InputScript::Idle, 41),
        GameStub::new(InputScript::Idle),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 60);

    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);

    assert_eq!(pair.host.frame_count(), pause);
    assert_eq!(pair.client.frame_count(), pause);
    assert_eq!(pair.host.confirmed_frame(), pause);
    assert_eq!(pair.client.confirmed_frame(), pause);

    let expected = reference_state(41, InputScript::Idle, InputScript::Idle, pause.as_u32());
    assert_eq!(pair.host.bridge().gs, expected);
    assert_eq!(pair.client.bridge().gs, expected);

    for stats in [pair.host.rollback_stats(), pair.client.rollback_stats()] {
        assert_eq!(stats.replays, 0);
        assert_eq!(stats.replayed_frames, 0);
    }
}

#[test]
fn test_held_button_replays_once() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Hold(0)),
        GameStub::new(InputScript::Hold(5)),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 60);
    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);

    let expected = reference_state(0, InputScript::Hold(0), InputScript::Hold(5), pause.as_u32());
    assert_eq!(pair.host.bridge().gs, expected);
    assert_eq!(pair.client.bridge().gs, expected);
    // Only the step from idle frame 0 to the held button can miss.
    assert!(pair.host.rollback_stats().replays <= 1);
    assert!(pair.client.rollback_stats().replays <= 1);
}

#[test]
fn test_mispredictions_replay_to_the_same_state() {
    for delay in [0, 1, 3] {
        let mut pair = memory_sessions(
            GameStub::with_state(InputScript::Pattern(1), 99),
            GameStub::new(InputScript::Pattern(2)),
            delay,
        );
        synchronize_sessions(&mut pair.host, &mut pair.client);
        run_both(&mut pair.host, &mut pair.client, 100);
        let pause = pair.client.request_pause().unwrap();
        run_until_paused(&mut pair.host, &mut pair.client, 300);

        let expected = reference_state(
            99,
            InputScript::Pattern(1),
            InputScript::Pattern(2),
            pause.as_u32(),
        );
        assert_eq!(pair.host.bridge().gs, expected, "host, delay {delay}");
        assert_eq!(pair.client.bridge().gs, expected, "client, delay {delay}");

        let replays = pair.host.rollback_stats().replays + pair.client.rollback_stats().replays;
        if delay > 0 {
            assert!(replays > 0, "delay {delay} never replayed");
        }
        let max_depth = pair
            .host
            .rollback_stats()
            .max_replay_depth
            .max(pair.client.rollback_stats().max_replay_depth);
        assert!(max_depth <= delay + 1, "replay deeper than the ring");
    }
}

#[test]
fn test_pre_step_twice_is_invalid() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    let mut status = pair.host.pre_step().unwrap();
    while status != StepStatus::Ready {
        pair.client.run_frame(&mut NullSink).unwrap();
        status = pair.host.pre_step().unwrap();
    }
    assert!(matches!(
        pair.host.pre_step(),
        Err(NetplayError::InvalidRequest { .. })
    ));
    // The session survives a misuse.
    let inputs = pair.host.current_inputs();
    netplay_rollback::SimulationBridge::step(pair.host.bridge_mut(), &inputs, &mut NullSink);
    pair.host.post_step().unwrap();
}

#[test]
fn test_stall_recovers_after_blackout() {
    let builder = SessionBuilder::new()
        .with_delay_frames(2)
        .unwrap()
        .with_protocol_config(ProtocolConfig {
            stall_timeout: Duration::from_secs(10),
            ..quick_timeouts()
        });
    let mut pair = chaos_sessions(
        GameStub::new(InputScript::Pattern(3)),
        GameStub::new(InputScript::Pattern(4)),
        builder.clone(),
        builder,
        ChaosConfig::passthrough(),
        ChaosConfig::passthrough(),
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 20);

    pair.set_blackout(true);
    let mut stalled = false;
    for _ in 0..10 {
        if pair.host.run_frame(&mut NullSink).unwrap() == StepStatus::Stalled {
            stalled = true;
            break;
        }
        pair.client.run_frame(&mut NullSink).unwrap();
    }
    assert!(stalled, "host never stalled during the blackout");
    let stalled_at = pair.host.frame_count();
    assert!(pair.host.network_stats().stalls >= 1);

    pair.set_blackout(false);
    for _ in 0..100 {
        std::thread::sleep(Duration::from_millis(5));
        run_both(&mut pair.host, &mut pair.client, 1);
        if pair.host.frame_count() > stalled_at + 5 {
            break;
        }
    }
    assert!(pair.host.frame_count() > stalled_at + 5, "host never resumed");
    assert!(pair.host.network_stats().resends > 0 || pair.client.network_stats().resends > 0);
    assert_eq!(pair.host.network_stats().current_stall, Duration::ZERO);

    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 300);
    let expected = reference_state(
        0,
        InputScript::Pattern(3),
        InputScript::Pattern(4),
        pause.as_u32(),
    );
    assert_eq!(pair.host.bridge().gs, expected);
    assert_eq!(pair.client.bridge().gs, expected);
}

#[test]
fn test_stall_timeout_ends_both_sessions() {
    let builder = SessionBuilder::new().with_protocol_config(quick_timeouts());
    let mut pair = chaos_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        builder.clone(),
        builder,
        ChaosConfig::passthrough(),
        ChaosConfig::passthrough(),
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 5);
    pair.set_blackout(true);

    let mut result = Ok(StepStatus::Ready);
    for _ in 0..200 {
        result = pair.host.run_frame(&mut NullSink);
        if result.is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(result, Err(NetplayError::StallTimeout { .. })));
    assert_eq!(pair.host.current_state(), SessionState::Disconnected);
    assert!(pair.host.request_pause().is_err());

    // The host said goodbye on the reliable stream.
    assert_eq!(
        pair.client.pre_step(),
        Err(NetplayError::ConnectionLost {
            reason: DisconnectReason::PeerDisconnected
        })
    );
}

#[test]
fn test_handshake_times_out_without_peer() {
    let (commands, _peer_commands) = memory_command_pair();
    let (socket, _peer_socket) = memory_datagram_pair();
    let mut host = SessionBuilder::new()
        .with_protocol_config(quick_timeouts())
        .start_p2p_session(GameStub::new(InputScript::Idle), commands, socket, Role::Host)
        .unwrap();

    let mut result = Ok(StepStatus::Handshaking);
    for _ in 0..200 {
        result = host.pre_step();
        if result != Ok(StepStatus::Handshaking) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(result, Err(NetplayError::HandshakeTimeout));
    assert_eq!(host.frame_count(), Frame::ZERO);
}

#[test]
fn test_peer_disconnect() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        1,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 10);

    let host_bridge = pair.host.disconnect();
    assert!(host_bridge.gs.frame >= 5);

    let err = pair.client.pre_step().unwrap_err();
    assert_eq!(
        err,
        NetplayError::ConnectionLost {
            reason: DisconnectReason::PeerDisconnected
        }
    );
    let events = drain_events(&mut pair.client);
    assert!(events.contains(&NetplayEvent::Disconnected {
        reason: DisconnectReason::PeerDisconnected
    }));
    // The simulation can continue locally.
    let bridge = pair.client.into_bridge();
    assert!(bridge.gs.frame >= 5);
}

#[test]
fn test_spectate_and_cheat_notices_reach_peer() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        1,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    drain_events(&mut pair.client);

    pair.host.set_spectate(true).unwrap();
    let cheats = vec![CheatCode {
        index: 0,
        enabled: true,
        code: "010-23F-E6E".to_owned(),
    }];
    pair.host.sync_cheats(cheats.clone()).unwrap();
    run_both(&mut pair.host, &mut pair.client, 3);

    let events = drain_events(&mut pair.client);
    assert!(events.contains(&NetplayEvent::PeerSpectating { enabled: true }));
    assert!(events.contains(&NetplayEvent::CheatsReceived(cheats)));
    assert!(pair.client.peer_info().unwrap().spectating);
    assert!(pair.host.network_stats().commands_received > 0);
}

#[test]
fn test_sessions_work_as_trait_objects() {
    let pair = memory_sessions(
        GameStub::new(InputScript::Hold(2)),
        GameStub::new(InputScript::Idle),
        0,
    );
    let mut host: Box<dyn NetplaySession<GameStub>> = Box::new(pair.host);
    let mut client: Box<dyn NetplaySession<GameStub>> = Box::new(pair.client);
    synchronize_sessions(host.as_mut(), client.as_mut());
    run_both(host.as_mut(), client.as_mut(), 30);
    assert!(host.frame_count() > Frame::new(20));
    assert!(client.frame_count() > Frame::new(20));
}
