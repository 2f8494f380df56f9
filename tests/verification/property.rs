//! Property-based tests.
//!
//! Random networks, delays and input scripts must all converge on the state a local run
//! with perfect foresight produces. Session cases sleep while waiting on resends, so they
//! run few cases; the window properties are cheap and run many.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

use std::time::Duration;

use proptest::prelude::*;

use crate::common::stubs::{reference_state, GameStub, InputScript};
use crate::common::test_utils::{chaos_sessions, run_lossy, settle_at_pause, synchronize_sessions};
use netplay_rollback::__internal::RedundancyWindow;
use netplay_rollback::{ChaosConfig, Frame, InputState, ProtocolConfig, SessionBuilder};

fn script_strategy() -> impl Strategy<Value = InputScript> {
    prop_oneof![
        Just(InputScript::Idle),
        (0u32..16).prop_map(InputScript::Hold),
        any::<u32>().prop_map(InputScript::Pattern),
    ]
}

fn chaos_strategy() -> impl Strategy<Value = ChaosConfig> {
    (0.0f64..0.3, 0.0f64..0.2, 0.0f64..0.3, 0u32..4, any::<u64>()).prop_map(
        |(loss, duplication, reorder, delay_polls, seed)| {
            ChaosConfig::builder()
                .packet_loss_rate(loss)
                .duplication_rate(duplication)
                .reorder_rate(reorder)
                .delay_polls(delay_polls)
                .seed(seed)
                .build()
        },
    )
}

fn builder(delay_frames: u32) -> SessionBuilder {
    SessionBuilder::new()
        .with_delay_frames(delay_frames)
        .unwrap()
        .with_protocol_config(ProtocolConfig {
            resend_interval: Duration::from_millis(5),
            ..ProtocolConfig::default()
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: if cfg!(miri) { 1 } else { 12 },
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_sessions_converge_on_any_network(
        host_script in script_strategy(),
        client_script in script_strategy(),
        host_chaos in chaos_strategy(),
        client_chaos in chaos_strategy(),
        delay in 0u32..5,
        iterations in 20usize..120,
    ) {
        let mut pair = chaos_sessions(
            GameStub::new(host_script),
            GameStub::new(client_script),
            builder(delay),
            builder(delay),
            host_chaos,
            client_chaos,
        );
        synchronize_sessions(&mut pair.host, &mut pair.client);
        run_lossy(&mut pair, iterations);
        let pause = pair.client.request_pause().unwrap();
        settle_at_pause(&mut pair, pause, 5_000);

        let expected = reference_state(0, host_script, client_script, pause.as_u32());
        prop_assert_eq!(pair.host.bridge().gs, expected);
        prop_assert_eq!(pair.client.bridge().gs, expected);
        prop_assert!(pair.host.rollback_stats().max_replay_depth <= delay + 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: if cfg!(miri) { 8 } else { 256 },
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_window_holds_the_newest_frames_in_order(
        redundancy in 1usize..64,
        capacity in 1usize..18,
        pushed in 1u32..200,
    ) {
        let mut window = RedundancyWindow::new(redundancy, capacity);
        prop_assert_eq!(window.len(), redundancy.max(2 * capacity));
        for frame in 0..pushed {
            window.push(Frame::new(frame), InputState::NONE.with_button(frame % 16, true));
        }

        let entries = &window.packet().inputs;
        prop_assert_eq!(entries.len(), window.len().min(pushed as usize));
        prop_assert_eq!(window.packet().last_frame(), Some(Frame::new(pushed - 1)));
        for pair in entries.windows(2) {
            prop_assert_eq!(pair[0].frame + 1, pair[1].frame);
        }
        for entry in entries.iter() {
            prop_assert!(entry.input.button(entry.frame.as_u32() % 16));
        }
    }

    #[test]
    fn prop_any_later_packet_covers_a_stalled_peer(
        capacity in 1usize..18,
        pushed in 1u32..200,
    ) {
        // A stalled peer waits on a frame at most twice the ring capacity behind our newest.
        let mut window = RedundancyWindow::new(1, capacity);
        for frame in 0..pushed {
            window.push(Frame::new(frame), InputState::NONE);
        }
        let oldest_needed = pushed.saturating_sub(2 * capacity as u32);
        let first = window.packet().inputs.first().map(|e| e.frame.as_u32());
        prop_assert!(first.is_some_and(|first| first <= oldest_needed));
    }
}
