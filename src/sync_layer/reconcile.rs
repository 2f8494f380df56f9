use crate::bridge::SimulationBridge;
use crate::report_violation_to;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{report_to_observer, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Frame, InputState, NetplayError};

/// What [`SyncLayer::post_step`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing new was confirmed.
    Idle,
    /// Newly confirmed frames all matched their predictions.
    Skipped {
        /// Frames the trust frontier moved over.
        frames: u32,
    },
    /// A misprediction was found and the frames after it were executed again.
    Replayed {
        /// Frames skipped before the misprediction.
        skipped: u32,
        /// Frames re-executed.
        depth: u32,
    },
}

/// Result of offering a peer savestate to [`SyncLayer::apply_savestate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavestateOutcome {
    /// Loaded; the simulation now continues from it.
    Applied,
    /// Remote input up to the savestate frame has not arrived yet. Offer it again later.
    Deferred,
    /// The frame already left the ring, lies in the future, or the size is wrong.
    Rejected,
}

impl SyncLayer {
    /// Snapshots the bridge into the next slot and records the local input for it.
    ///
    /// Frame 0 always runs with idle input on both sides and is confirmed without the network.
    pub fn arm_frame<B: SimulationBridge + ?Sized>(
        &mut self,
        bridge: &mut B,
        local_input: InputState,
    ) -> Result<Frame, NetplayError> {
        if !self.can_poll {
            return Err(NetplayError::InvalidRequest {
                info: format!("frame {} is already armed", self.frame_count),
            });
        }
        let frame = self.frame_count;
        let ptr = self.self_ptr;
        self.ring.save_state(ptr, frame, bridge)?;
        let first = frame == Frame::ZERO;
        self.ring
            .slot_mut(ptr)
            .rearm(if first { InputState::NONE } else { local_input });
        self.self_ptr = self.ring.advance(ptr);
        self.can_poll = false;

        if first && self.read.frame == Frame::ZERO {
            let slot = self.ring.slot_mut(ptr);
            slot.used_real = true;
            slot.real_input = InputState::NONE;
            self.read = self.ring.step(self.read);
        }
        self.check_order();
        Ok(frame)
    }

    /// Records the peer's input for `frame`.
    ///
    /// Accepted only for exactly the next unconfirmed frame, and only once that frame has been
    /// armed locally; anything else is a duplicate or from the future and returns `false`.
    pub fn confirm_remote(&mut self, frame: Frame, input: InputState) -> bool {
        if frame != self.read.frame || frame >= self.self_frame() {
            return false;
        }
        let slot = self.ring.slot_mut(self.read.ptr);
        slot.real_input = input;
        slot.is_simulated = false;
        self.read = self.ring.step(self.read);
        tracing::trace!(frame = %frame, "confirmed remote input");
        true
    }

    /// Decides the remote input of the armed frame: the real one if it is already
    /// confirmed, otherwise the last confirmed input repeated.
    pub fn predict_current(&mut self) {
        if self.can_poll {
            return;
        }
        let current = self.ring.prev(self.self_ptr);
        if self.read.frame < self.self_frame() {
            let guess = self.latest_real_input();
            let slot = self.ring.slot_mut(current);
            slot.simulated_input = guess;
            slot.is_simulated = true;
            slot.used_real = false;
            self.stats.predicted_frames += 1;
        } else {
            let slot = self.ring.slot_mut(current);
            slot.simulated_input = slot.real_input;
            slot.used_real = true;
        }
    }

    /// Whether arming another frame would overwrite the trust frontier's slot.
    ///
    /// True when the ring already holds `capacity` frames past the frontier and no newly
    /// confirmed input is waiting to move it.
    #[must_use]
    pub fn must_stall(&self) -> bool {
        let held = self.self_frame() - self.other.frame;
        held as usize >= self.ring.capacity() && self.read.frame == self.other.frame
    }

    /// Completes the armed frame after the bridge stepped it, then moves the trust frontier.
    ///
    /// The frontier first skips every newly confirmed frame whose prediction held. If it
    /// stops short of `read`, the frame it stopped at was mispredicted, and everything from
    /// there to the present is replayed.
    pub fn post_step<B: SimulationBridge + ?Sized>(
        &mut self,
        bridge: &mut B,
    ) -> Result<ReconcileOutcome, NetplayError> {
        if self.can_poll {
            return Err(NetplayError::InvalidRequest {
                info: "post_step called without an armed frame".to_owned(),
            });
        }
        self.frame_count += 1;
        self.can_poll = true;

        let outcome = self.reconcile(bridge)?;
        self.check_order();
        self.check_capacity()?;
        Ok(outcome)
    }

    /// Reconciles input confirmed since the last frame without producing a new one.
    ///
    /// Used while the session is paused, where frames stop but remote input keeps arriving.
    /// A replay here ends on the same live state the bridge holds now, corrected.
    pub fn settle<B: SimulationBridge + ?Sized>(
        &mut self,
        bridge: &mut B,
    ) -> Result<ReconcileOutcome, NetplayError> {
        if !self.can_poll {
            return Err(NetplayError::InvalidRequest {
                info: "cannot settle while a frame is armed".to_owned(),
            });
        }
        let outcome = self.reconcile(bridge)?;
        self.check_order();
        Ok(outcome)
    }

    /// Installs a peer savestate for `frame` and continues the simulation from it.
    ///
    /// Only valid between frames. Frames before `frame` no longer matter once the state is
    /// replaced, so the trust frontier jumps straight to `frame`.
    pub fn apply_savestate<B: SimulationBridge + ?Sized>(
        &mut self,
        frame: Frame,
        state: &[u8],
        bridge: &mut B,
    ) -> Result<SavestateOutcome, NetplayError> {
        if !self.can_poll {
            return Err(NetplayError::InvalidRequest {
                info: "savestates can only be applied between frames".to_owned(),
            });
        }
        if state.len() != self.ring.state_size() {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Command,
                "savestate for frame {} has {} bytes, expected {}",
                frame,
                state.len(),
                self.ring.state_size()
            );
            return Ok(SavestateOutcome::Rejected);
        }
        let oldest_kept = self.frame_count.as_u32() + 1;
        let capacity = self.ring.capacity() as u32;
        if frame > self.frame_count || frame.as_u32() + capacity < oldest_kept {
            return Ok(SavestateOutcome::Rejected);
        }
        if self.read.frame < frame {
            return Ok(SavestateOutcome::Deferred);
        }

        let ptr = self.ring.ptr_for(self.read, frame);
        self.ring.slot_mut(ptr).state.copy_from_slice(state);
        self.other = super::Cursor { ptr, frame };
        if frame == self.frame_count {
            self.ring.load_state(ptr, frame, bridge)?;
            self.other = self.read;
        } else {
            self.replay(bridge)?;
        }
        tracing::info!(frame = %frame, "savestate applied");
        Ok(SavestateOutcome::Applied)
    }

    /// Serializes the live state for sending to the peer. Requires every produced frame to be
    /// confirmed, so both sides hold the same history up to this frame.
    pub fn capture_savestate<B: SimulationBridge + ?Sized>(
        &self,
        bridge: &mut B,
    ) -> Result<(Frame, Vec<u8>), NetplayError> {
        if !self.can_poll || self.read.frame != self.frame_count || self.other != self.read {
            return Err(NetplayError::InvalidRequest {
                info: "savestates can only be sent while every frame is confirmed".to_owned(),
            });
        }
        let mut state = vec![0; self.ring.state_size()];
        match bridge.serialize(&mut state) {
            Some(len) if len == state.len() => Ok((self.frame_count, state)),
            _ => Err(NetplayError::StateTransfer {
                frame: self.frame_count,
                context: "bridge failed to serialize savestate".to_owned(),
            }),
        }
    }

    pub(super) fn latest_real_input(&self) -> InputState {
        self.ring.slot(self.ring.prev(self.read.ptr)).real_input
    }

    fn reconcile<B: SimulationBridge + ?Sized>(
        &mut self,
        bridge: &mut B,
    ) -> Result<ReconcileOutcome, NetplayError> {
        if self.other.frame == self.read.frame {
            return Ok(ReconcileOutcome::Idle);
        }
        let skipped = self.skip_ahead();
        if self.other.frame < self.read.frame {
            let depth = self.replay(bridge)?;
            Ok(ReconcileOutcome::Replayed { skipped, depth })
        } else {
            Ok(ReconcileOutcome::Skipped { frames: skipped })
        }
    }

    fn skip_ahead(&mut self) -> u32 {
        let mut skipped = 0;
        while self.other.frame < self.read.frame && self.ring.slot(self.other.ptr).prediction_held()
        {
            self.other = self.ring.step(self.other);
            skipped += 1;
        }
        self.stats.skipped_frames += u64::from(skipped);
        if skipped > 0 {
            tracing::trace!(skipped, other = %self.other.frame, "skip-ahead");
        }
        skipped
    }

    fn check_capacity(&self) -> Result<(), NetplayError> {
        let in_flight = self.in_flight();
        if in_flight as usize >= self.ring.capacity() {
            let violation = InvariantViolation::new(
                ViolationSeverity::Critical,
                ViolationKind::FrameRing,
                format!(
                    "{in_flight} unconfirmed frames exceed ring capacity {}",
                    self.ring.capacity()
                ),
                concat!(file!(), ":", line!()),
            )
            .with_frame(self.frame_count)
            .with_context("other", self.other.frame.to_string())
            .with_context("read", self.read.frame.to_string());
            report_to_observer(self.violation_observer.as_ref(), &violation);
            return Err(NetplayError::CapacityViolation {
                in_flight,
                capacity: self.ring.capacity(),
            });
        }
        Ok(())
    }
}
