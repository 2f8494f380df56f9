use crate::bridge::{NullSink, SimulationBridge};
use crate::sync_layer::SyncLayer;
use crate::telemetry::{report_to_observer, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::NetplayError;

impl SyncLayer {
    /// Restores the snapshot at the trust frontier and re-executes every frame up to
    /// `frame_count` with the best inputs known now. Returns the number of frames executed.
    ///
    /// Snapshots along the way are refreshed so a later replay can start from any of them.
    /// Frames still lacking remote input are predicted again from the newest confirmed
    /// input, which is usually what the peer is still holding.
    pub(super) fn replay<B: SimulationBridge + ?Sized>(
        &mut self,
        bridge: &mut B,
    ) -> Result<u32, NetplayError> {
        self.is_replay = true;
        self.tmp = self.other;
        if let Err(err) = self.ring.load_state(self.tmp.ptr, self.tmp.frame, bridge) {
            self.is_replay = false;
            let violation = InvariantViolation::new(
                ViolationSeverity::Critical,
                ViolationKind::Replay,
                "could not restore the trusted snapshot to replay from",
                concat!(file!(), ":", line!()),
            )
            .with_frame(self.tmp.frame)
            .with_context("frame_count", self.frame_count.to_string());
            report_to_observer(self.violation_observer.as_ref(), &violation);
            return Err(err);
        }

        let latest = self.latest_real_input();
        let mut first_error = None;
        let mut depth = 0u32;
        while self.tmp.frame < self.frame_count {
            if let Err(err) = self.ring.save_state(self.tmp.ptr, self.tmp.frame, bridge) {
                first_error.get_or_insert(err);
            }
            if self.tmp.frame >= self.read.frame {
                let slot = self.ring.slot_mut(self.tmp.ptr);
                slot.simulated_input = latest;
                slot.is_simulated = true;
                slot.used_real = false;
            }
            let inputs = self.inputs_at(self.tmp.ptr, self.tmp.frame);
            bridge.step(&inputs, &mut NullSink);
            self.tmp = self.ring.step(self.tmp);
            depth += 1;
        }

        tracing::debug!(
            from = %self.other.frame,
            to = %self.frame_count,
            depth,
            "replayed"
        );
        self.other = self.read;
        self.is_replay = false;

        self.stats.replays += 1;
        self.stats.replayed_frames += u64::from(depth);
        self.stats.max_replay_depth = self.stats.max_replay_depth.max(depth);

        match first_error {
            Some(err) => Err(err),
            None => Ok(depth),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]
mod tests {
    use super::*;
    use crate::bridge::FrameInputs;
    use crate::sync_layer::test_support::{input, run, Counter};
    use crate::sync_layer::{PortMap, ReconcileOutcome};
    use crate::test_config::miri_case_count;
    use crate::{Frame, InputState};
    use proptest::prelude::*;

    fn inputs(frame: u32, local: InputState, remote: InputState) -> FrameInputs {
        FrameInputs {
            frame: Frame::new(frame),
            ports: [local, remote],
        }
    }

    #[test]
    fn misprediction_replays_to_reference_state() {
        let mut bridge = Counter::default();
        let mut layer = SyncLayer::new(8, &bridge, PortMap::new(1)).unwrap();
        run(&mut layer, &mut bridge, input(1));
        for _ in 1..5 {
            assert_eq!(run(&mut layer, &mut bridge, input(1)), ReconcileOutcome::Idle);
        }

        layer.arm_frame(&mut bridge, input(1)).unwrap();
        assert!(layer.confirm_remote(Frame::new(1), InputState::NONE));
        for frame in 2..5 {
            assert!(layer.confirm_remote(Frame::new(frame), input(3)));
        }
        layer.predict_current();
        bridge.step(&layer.current_inputs(), &mut NullSink);
        let outcome = layer.post_step(&mut bridge).unwrap();

        assert_eq!(outcome, ReconcileOutcome::Replayed { skipped: 1, depth: 4 });
        assert_eq!(layer.other_frame(), Frame::new(5));
        assert!(!layer.is_replay());

        let mut reference = Counter::default();
        reference.apply(&inputs(0, InputState::NONE, InputState::NONE));
        reference.apply(&inputs(1, input(1), InputState::NONE));
        for frame in 2..6 {
            reference.apply(&inputs(frame, input(1), input(3)));
        }
        assert_eq!(bridge.value, reference.value);

        let stats = layer.stats();
        assert_eq!(stats.replays, 1);
        assert_eq!(stats.replayed_frames, 4);
        assert_eq!(stats.max_replay_depth, 4);
    }

    #[test]
    fn unconfirmed_frames_are_predicted_again() {
        let mut bridge = Counter::default();
        let mut layer = SyncLayer::new(8, &bridge, PortMap::new(1)).unwrap();
        for _ in 0..5 {
            run(&mut layer, &mut bridge, InputState::NONE);
        }

        layer.arm_frame(&mut bridge, InputState::NONE).unwrap();
        assert!(layer.confirm_remote(Frame::new(1), InputState::NONE));
        assert!(layer.confirm_remote(Frame::new(2), input(5)));
        layer.predict_current();
        bridge.step(&layer.current_inputs(), &mut NullSink);
        let outcome = layer.post_step(&mut bridge).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replayed { skipped: 1, depth: 4 });
        assert_eq!(layer.other_frame(), Frame::new(3));

        // The peer kept holding the same input, so the re-predicted frames need no second replay.
        layer.arm_frame(&mut bridge, InputState::NONE).unwrap();
        for frame in 3..6 {
            assert!(layer.confirm_remote(Frame::new(frame), input(5)));
        }
        layer.predict_current();
        bridge.step(&layer.current_inputs(), &mut NullSink);
        assert_eq!(layer.post_step(&mut bridge).unwrap(), ReconcileOutcome::Skipped { frames: 3 });
        assert_eq!(layer.stats().replays, 1);
    }

    #[test]
    fn failed_restore_leaves_replay_mode() {
        let observer = std::sync::Arc::new(crate::telemetry::CollectingObserver::new());
        let mut bridge = Counter::default();
        let mut layer = SyncLayer::new(4, &bridge, PortMap::new(1)).unwrap();
        layer.set_violation_observer(Some(observer.clone()));
        run(&mut layer, &mut bridge, InputState::NONE);
        run(&mut layer, &mut bridge, InputState::NONE);

        layer.arm_frame(&mut bridge, InputState::NONE).unwrap();
        assert!(layer.confirm_remote(Frame::new(1), input(2)));
        layer.predict_current();
        bridge.step(&layer.current_inputs(), &mut NullSink);
        bridge.reject_loads = true;
        assert!(matches!(
            layer.post_step(&mut bridge),
            Err(NetplayError::StateTransfer { .. })
        ));
        assert!(!layer.is_replay());
        assert!(observer.has_violation(ViolationKind::Replay));
        assert_eq!(observer.violations()[0].frame, Some(Frame::new(1)));
    }

    /// Confirms up to `count` remote frames in order, stopping at the newest armed frame.
    fn deliver(layer: &mut SyncLayer, remotes: &[u32], count: usize) {
        for _ in 0..count {
            let frame = layer.read_frame();
            if frame >= layer.self_frame() {
                break;
            }
            assert!(layer.confirm_remote(frame, input(remotes[frame.as_u32() as usize])));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: miri_case_count(),
            ..ProptestConfig::default()
        })]

        #[test]
        fn any_confirmation_schedule_ends_at_the_reference(
            locals in prop::collection::vec(0u32..4, 1..40),
            remotes in prop::collection::vec(0u32..4, 40),
            deliveries in prop::collection::vec(0usize..4, 40),
            capacity in 2usize..9,
        ) {
            let mut bridge = Counter::default();
            let mut layer = SyncLayer::new(capacity, &bridge, PortMap::new(1)).unwrap();
            for (frame, &local) in locals.iter().enumerate() {
                layer.arm_frame(&mut bridge, input(local)).unwrap();
                if layer.must_stall() {
                    deliver(&mut layer, &remotes, 1);
                }
                prop_assert!(!layer.must_stall());
                layer.predict_current();
                bridge.step(&layer.current_inputs(), &mut NullSink);
                layer.post_step(&mut bridge).unwrap();
                deliver(&mut layer, &remotes, deliveries[frame]);
            }
            deliver(&mut layer, &remotes, locals.len());
            layer.settle(&mut bridge).unwrap();

            let end = Frame::new(locals.len() as u32);
            prop_assert_eq!(layer.other_frame(), end);
            let mut reference = Counter::default();
            reference.apply(&inputs(0, InputState::NONE, InputState::NONE));
            for frame in 1..locals.len() {
                reference.apply(&inputs(
                    frame as u32,
                    input(locals[frame]),
                    input(remotes[frame]),
                ));
            }
            prop_assert_eq!(bridge.value, reference.value);
            prop_assert!(layer.stats().max_replay_depth as usize <= capacity);
        }
    }
}
