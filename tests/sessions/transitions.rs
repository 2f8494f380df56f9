//! Pause, flip and savestate integration tests.
//!
//! Each of these changes what both peers simulate, so each must take effect on the same
//! frame on both sides.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{reference_state, GameStub, InputScript};
use crate::common::test_utils::{
    drain_events, memory_sessions, run_both, run_until_paused, step_once, synchronize_sessions,
};
use netplay_rollback::{NetplayError, NetplayEvent, NetplaySession, NullSink, StepStatus};

#[test]
fn test_pause_holds_both_sides_on_the_agreed_frame() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Pattern(11)),
        GameStub::new(InputScript::Pattern(12)),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 10);

    let pause = pair.host.request_pause().unwrap();
    assert!(pause > pair.host.frame_count());
    assert!(pair.host.request_pause().is_err(), "second pause while pending");
    run_until_paused(&mut pair.host, &mut pair.client, 200);

    for _ in 0..10 {
        assert_eq!(pair.host.run_frame(&mut NullSink).unwrap(), StepStatus::Paused);
        assert_eq!(pair.client.run_frame(&mut NullSink).unwrap(), StepStatus::Paused);
    }
    assert_eq!(pair.host.frame_count(), pause);
    assert_eq!(pair.client.frame_count(), pause);
    assert_eq!(pair.client.pause_frame(), Some(pause));

    let client_events = drain_events(&mut pair.client);
    assert!(client_events.contains(&NetplayEvent::PauseScheduled { frame: pause }));
    let paused_reports = client_events
        .iter()
        .filter(|e| **e == NetplayEvent::Paused { frame: pause })
        .count();
    assert_eq!(paused_reports, 1, "paused is reported once");

    pair.client.request_resume().unwrap();
    run_both(&mut pair.host, &mut pair.client, 20);
    assert!(pair.host.frame_count() > pause);
    assert!(pair.client.frame_count() > pause);
    assert!(drain_events(&mut pair.host).contains(&NetplayEvent::Resumed));

    let again = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);
    let expected = reference_state(
        0,
        InputScript::Pattern(11),
        InputScript::Pattern(12),
        again.as_u32(),
    );
    assert_eq!(pair.host.bridge().gs, expected);
    assert_eq!(pair.client.bridge().gs, expected);
}

#[test]
fn test_resume_without_pause_is_invalid() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        1,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    assert!(matches!(
        pair.host.request_resume(),
        Err(NetplayError::InvalidRequest { .. })
    ));
}

#[test]
fn test_simultaneous_pause_requests_cancel_each_other() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Idle),
        GameStub::new(InputScript::Idle),
        1,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 5);

    pair.host.request_pause().unwrap();
    pair.client.request_pause().unwrap();
    run_both(&mut pair.host, &mut pair.client, 60);

    assert_eq!(pair.host.pause_frame(), None);
    assert_eq!(pair.client.pause_frame(), None);
    assert!(pair.host.frame_count().as_u32() > 40, "nobody paused");
}

#[test]
fn test_flip_swaps_ports_on_the_same_frame() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Hold(0)),
        GameStub::new(InputScript::Hold(1)),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 10);

    assert!(pair.client.request_flip().is_err(), "only the host flips");
    let flip = pair.host.request_flip().unwrap();
    assert!(pair.host.request_pause().is_err(), "flip still pending");

    let mut host_after = None;
    for _ in 0..200 {
        let host_inputs = step_once(&mut pair.host);
        step_once(&mut pair.client);
        if let Some(inputs) = host_inputs {
            if inputs.frame > flip + 2 {
                host_after = Some(inputs);
                break;
            }
            if inputs.frame < flip && inputs.frame.as_u32() > 8 {
                assert!(inputs.ports[0].button(0), "before the flip port 0 is the host");
                assert!(inputs.ports[1].button(1));
            }
        }
    }
    let inputs = host_after.expect("host never passed the flip frame");
    assert!(inputs.ports[0].button(1), "after the flip port 0 is the client");
    assert!(inputs.ports[1].button(0));

    run_both(&mut pair.host, &mut pair.client, 10);
    for session in [&mut pair.host, &mut pair.client] {
        let events = drain_events(session);
        assert!(events.contains(&NetplayEvent::FlipScheduled { frame: flip }));
        assert!(events.contains(&NetplayEvent::Flipped { frame: flip }));
    }

    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);
    assert_eq!(pair.host.frame_count(), pause);
    assert_eq!(pair.host.bridge().gs, pair.client.bridge().gs);
}

#[test]
fn test_savestate_replaces_peer_state() {
    let mut pair = memory_sessions(
        GameStub::new(InputScript::Pattern(21)),
        GameStub::new(InputScript::Pattern(22)),
        2,
    );
    synchronize_sessions(&mut pair.host, &mut pair.client);
    run_both(&mut pair.host, &mut pair.client, 20);

    // Savestates need every frame confirmed, which only a pause guarantees.
    let pause = pair.host.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);

    pair.host.bridge_mut().gs.state = 0x5EED;
    let frame = pair.host.load_savestate().unwrap();
    assert_eq!(frame, pause);
    run_both(&mut pair.host, &mut pair.client, 3);

    assert_eq!(pair.client.bridge().gs, pair.host.bridge().gs);
    assert!(drain_events(&mut pair.client).contains(&NetplayEvent::SavestateLoaded { frame }));

    pair.host.request_resume().unwrap();
    run_both(&mut pair.host, &mut pair.client, 30);
    pair.client.request_pause().unwrap();
    run_until_paused(&mut pair.host, &mut pair.client, 200);
    assert_eq!(pair.client.bridge().gs, pair.host.bridge().gs);
    assert!(pair.host.frame_count() > pause);
}
