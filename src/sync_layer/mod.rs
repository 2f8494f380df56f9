//! # Sync Layer
//!
//! The rollback core: a ring of [`DeltaFrame`]s plus four cursors into it.
//!
//! ```text
//!   other          read                 self
//!     │              │                    │
//!  ───┼──────────────┼────────────────────┼──────►  frames
//!     │ confirmed but│ executed on a guess│
//!     │ not reconciled                    │
//!   trust frontier
//! ```
//!
//! * `self` is the next slot to be produced locally (`frame_count` counts produced frames).
//! * `read` is one past the last frame whose remote input arrived.
//! * `other` is the trust frontier: every frame before it executed with the right input.
//! * `tmp` walks from `other` to `self` while a replay is running.
//!
//! `other <= read <= self` always holds, and after every [`SyncLayer::post_step`]
//! `frame_count - other < capacity`.
//!
//! Per frame the session calls [`SyncLayer::arm_frame`] (snapshot plus local input),
//! [`SyncLayer::confirm_remote`] for every input received, [`SyncLayer::predict_current`],
//! steps the bridge with [`SyncLayer::current_inputs`], then [`SyncLayer::post_step`],
//! which skips ahead over correct predictions and replays from the first wrong one.

mod delta_frame;
mod frame_ring;
mod reconcile;
mod replay;
#[cfg(test)]
mod test_support;

pub use delta_frame::DeltaFrame;
pub use frame_ring::{Cursor, FrameRing};
pub use reconcile::{ReconcileOutcome, SavestateOutcome};

use std::sync::Arc;

use crate::bridge::{FrameInputs, SimulationBridge};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, NetplayError, NUM_PORTS};

/// A frame that can no longer be rewritten by rollback, with the inputs it ran with.
pub type FinalizedFrame = FrameInputs;

/// Counters describing how much rollback work a session has done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackStats {
    /// Number of replays.
    pub replays: u64,
    /// Frames re-executed across all replays.
    pub replayed_frames: u64,
    /// Deepest single replay.
    pub max_replay_depth: u32,
    /// Frames confirmed by skip-ahead without re-execution.
    pub skipped_frames: u64,
    /// Frames executed on a predicted remote input.
    pub predicted_frames: u64,
}

/// Maps logical ports to the physical player behind them, honoring a deferred flip.
///
/// With no flip ever scheduled the mapping is the identity. Once a flip is
/// scheduled for frame `ff`, frames before `ff` keep the previous orientation and
/// frames from `ff` on use the new one, so peers that agree on `ff` swap on the
/// same frame even while replaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    remote_port: usize,
    flip: bool,
    flip_frame: Option<Frame>,
    before_pending: Option<(bool, Option<Frame>)>,
}

impl PortMap {
    /// Creates a mapping where the peer plays on `remote_port`.
    #[must_use]
    pub fn new(remote_port: usize) -> Self {
        Self {
            remote_port: remote_port.min(NUM_PORTS - 1),
            flip: false,
            flip_frame: None,
            before_pending: None,
        }
    }

    /// Physical port of the remote player.
    #[must_use]
    pub fn remote_port(&self) -> usize {
        self.remote_port
    }

    /// Physical port of the local player.
    #[must_use]
    pub fn local_port(&self) -> usize {
        NUM_PORTS - 1 - self.remote_port
    }

    /// The most recently scheduled flip frame.
    #[must_use]
    pub fn flip_frame(&self) -> Option<Frame> {
        self.flip_frame
    }

    /// Whether ports are swapped at `frame`.
    #[must_use]
    pub fn flipped_at(&self, frame: Frame) -> bool {
        match self.flip_frame {
            None => false,
            Some(ff) => self.flip ^ (frame < ff),
        }
    }

    /// Physical port answering for logical `port` at `frame`.
    #[must_use]
    pub fn map(&self, port: usize, frame: Frame) -> usize {
        if self.flipped_at(frame) {
            NUM_PORTS - 1 - port
        } else {
            port
        }
    }

    /// Schedules a flip. Refused while an earlier flip is still ahead of `now`.
    pub fn schedule_flip(&mut self, frame: Frame, now: Frame) -> bool {
        if matches!(self.flip_frame, Some(pending) if pending > now) {
            return false;
        }
        self.before_pending = Some((self.flip, self.flip_frame));
        self.flip = !self.flip;
        self.flip_frame = Some(frame);
        true
    }

    /// Withdraws a flip that has not taken effect yet.
    pub fn cancel_flip(&mut self, frame: Frame, now: Frame) -> bool {
        if self.flip_frame != Some(frame) || frame <= now {
            return false;
        }
        let Some((flip, flip_frame)) = self.before_pending.take() else {
            return false;
        };
        self.flip = flip;
        self.flip_frame = flip_frame;
        true
    }
}

/// The ring plus cursors. Owns no transport; the session feeds it.
pub struct SyncLayer {
    ring: FrameRing,
    self_ptr: usize,
    frame_count: Frame,
    other: Cursor,
    read: Cursor,
    tmp: Cursor,
    is_replay: bool,
    can_poll: bool,
    ports: PortMap,
    stats: RollbackStats,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("ring", &self.ring)
            .field("frame_count", &self.frame_count)
            .field("other", &self.other)
            .field("read", &self.read)
            .field("is_replay", &self.is_replay)
            .field("ports", &self.ports)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl SyncLayer {
    /// Allocates a ring of `capacity` slots for `bridge`.
    pub fn new<B: SimulationBridge + ?Sized>(
        capacity: usize,
        bridge: &B,
        ports: PortMap,
    ) -> Result<Self, NetplayError> {
        Ok(Self {
            ring: FrameRing::allocate(capacity, bridge)?,
            self_ptr: 0,
            frame_count: Frame::ZERO,
            other: Cursor::default(),
            read: Cursor::default(),
            tmp: Cursor::default(),
            is_replay: false,
            can_poll: true,
            ports,
            stats: RollbackStats::default(),
            violation_observer: None,
        })
    }

    /// Routes ring, reconciliation and replay violations to `observer` instead of the
    /// tracing log.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.ring.set_violation_observer(observer.clone());
        self.violation_observer = observer;
    }

    /// Ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Snapshot size in bytes.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.ring.state_size()
    }

    /// Frames fully produced (stepped and post-processed).
    #[must_use]
    pub fn frame_count(&self) -> Frame {
        self.frame_count
    }

    /// Frames armed: `frame_count`, plus one while a frame is armed but not yet post-processed.
    #[must_use]
    pub fn self_frame(&self) -> Frame {
        if self.can_poll {
            self.frame_count
        } else {
            self.frame_count + 1
        }
    }

    /// The trust frontier.
    #[must_use]
    pub fn other_frame(&self) -> Frame {
        self.other.frame
    }

    /// One past the last frame with confirmed remote input.
    #[must_use]
    pub fn read_frame(&self) -> Frame {
        self.read.frame
    }

    /// The replay cursor. Meaningful only while [`is_replay`](Self::is_replay).
    #[must_use]
    pub fn tmp_frame(&self) -> Frame {
        self.tmp.frame
    }

    /// Whether a replay is running.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.is_replay
    }

    /// Whether the next frame still has to be armed.
    #[must_use]
    pub fn can_poll(&self) -> bool {
        self.can_poll
    }

    /// Port mapping.
    #[must_use]
    pub fn ports(&self) -> &PortMap {
        &self.ports
    }

    /// Port mapping, for scheduling flips.
    pub fn ports_mut(&mut self) -> &mut PortMap {
        &mut self.ports
    }

    /// Rollback counters.
    #[must_use]
    pub fn stats(&self) -> RollbackStats {
        self.stats
    }

    /// The underlying ring.
    #[must_use]
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Unconfirmed frames the ring currently holds.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.frame_count - self.other.frame
    }

    /// Inputs for the frame about to execute: the replay cursor during replay,
    /// otherwise the most recently armed frame.
    #[must_use]
    pub fn current_inputs(&self) -> FrameInputs {
        if self.is_replay {
            self.inputs_at(self.tmp.ptr, self.tmp.frame)
        } else {
            self.inputs_at(self.ring.prev(self.self_ptr), self.frame_count)
        }
    }

    /// Appends every finalized frame from `from` up to the trust frontier to `out`,
    /// returning the frame to resume from next time.
    pub fn collect_finalized(&self, from: Frame, out: &mut Vec<FinalizedFrame>) -> Frame {
        let oldest_kept = Frame::new(
            self.self_frame()
                .as_u32()
                .saturating_sub(self.ring.capacity() as u32),
        );
        let mut frame = from;
        if frame < oldest_kept {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::FrameRing,
                "finalized frames {}..{} were recycled before being collected",
                frame,
                oldest_kept
            );
            frame = oldest_kept;
        }
        while frame < self.other.frame {
            let ptr = self.ring.ptr_for(self.other, frame);
            out.push(self.inputs_at(ptr, frame));
            frame += 1;
        }
        frame
    }

    /// The snapshot taken at the start of the trust frontier's frame, if it is still in the
    /// ring. `None` between frames when every produced frame is confirmed: the live
    /// simulation is then the trusted state.
    #[must_use]
    pub fn trusted_state(&self) -> Option<(Frame, &[u8])> {
        (self.other.frame < self.self_frame())
            .then(|| (self.other.frame, &*self.ring.slot(self.other.ptr).state))
    }

    fn inputs_at(&self, ptr: usize, frame: Frame) -> FrameInputs {
        let slot = self.ring.slot(ptr);
        let mut inputs = FrameInputs::idle(frame);
        for (port, input) in inputs.ports.iter_mut().enumerate() {
            *input = if self.ports.map(port, frame) == self.ports.remote_port() {
                slot.remote_input()
            } else {
                slot.self_input
            };
        }
        inputs
    }

    fn check_order(&self) {
        let ordered = self.other.frame <= self.read.frame && self.read.frame <= self.self_frame();
        debug_assert!(
            ordered,
            "cursor order broken: other={} read={} self={}",
            self.other.frame,
            self.read.frame,
            self.self_frame()
        );
        if cfg!(feature = "paranoid") && !ordered {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::Reconciliation,
                "cursor order broken: other={} read={} self={}",
                self.other.frame,
                self.read.frame,
                self.self_frame()
            );
        }
    }
}
