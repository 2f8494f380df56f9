//! Fixed-capacity storage for recent snapshots and their inputs.
//!
//! All snapshot buffers are allocated in [`FrameRing::allocate`]; nothing on the
//! per-frame path allocates afterwards. Slots are addressed by index, and the
//! [`Cursor`] type pairs an index with the absolute frame it currently refers to,
//! so ordering never depends on wraparound.

use std::sync::Arc;

use crate::bridge::SimulationBridge;
use crate::sync_layer::delta_frame::DeltaFrame;
use crate::telemetry::{
    report_to_observer, InvariantViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{Frame, NetplayError};

/// A ring position together with the frame it addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Slot index.
    pub ptr: usize,
    /// Absolute frame.
    pub frame: Frame,
}

/// The ring of [`DeltaFrame`]s.
pub struct FrameRing {
    slots: Vec<DeltaFrame>,
    state_size: usize,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("capacity", &self.slots.len())
            .field("state_size", &self.state_size)
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl FrameRing {
    /// Allocates `capacity` slots sized for the bridge's snapshots.
    ///
    /// Fails if the bridge cannot report a fixed, non-zero snapshot size; rollback is
    /// impossible without one.
    pub fn allocate<B: SimulationBridge + ?Sized>(
        capacity: usize,
        bridge: &B,
    ) -> Result<Self, NetplayError> {
        if capacity == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "frame ring capacity must be at least 1".to_owned(),
            });
        }
        let state_size = match bridge.state_size() {
            Some(size) if size > 0 => size,
            Some(_) => {
                return Err(NetplayError::UnsupportedBridge {
                    info: "serialized state size is zero".to_owned(),
                })
            },
            None => {
                return Err(NetplayError::UnsupportedBridge {
                    info: "bridge cannot report a serialized state size".to_owned(),
                })
            },
        };
        let slots = (0..capacity)
            .map(|_| DeltaFrame::with_state_size(state_size))
            .collect();
        tracing::debug!(capacity, state_size, "allocated frame ring");
        Ok(Self {
            slots,
            state_size,
            violation_observer: None,
        })
    }

    /// Routes ring violations to `observer` instead of the tracing log.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.violation_observer = observer;
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size of every snapshot in bytes.
    #[inline]
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// The slot after `ptr`.
    #[inline]
    #[must_use]
    pub fn advance(&self, ptr: usize) -> usize {
        (ptr + 1) % self.slots.len()
    }

    /// The slot before `ptr`.
    #[inline]
    #[must_use]
    pub fn prev(&self, ptr: usize) -> usize {
        (ptr + self.slots.len() - 1) % self.slots.len()
    }

    /// Moves a cursor one frame forward.
    #[inline]
    #[must_use]
    pub fn step(&self, cursor: Cursor) -> Cursor {
        Cursor {
            ptr: self.advance(cursor.ptr),
            frame: cursor.frame + 1,
        }
    }

    /// The slot that holds `frame`, given a cursor known to address `anchor.frame`.
    #[must_use]
    pub fn ptr_for(&self, anchor: Cursor, frame: Frame) -> usize {
        let len = self.slots.len();
        if frame >= anchor.frame {
            (anchor.ptr + (frame - anchor.frame) as usize % len) % len
        } else {
            let back = (anchor.frame - frame) as usize % len;
            (anchor.ptr + len - back) % len
        }
    }

    /// Shared access to a slot.
    #[inline]
    #[must_use]
    pub fn slot(&self, ptr: usize) -> &DeltaFrame {
        self.check_ptr(ptr);
        &self.slots[ptr]
    }

    /// Exclusive access to a slot.
    #[inline]
    pub fn slot_mut(&mut self, ptr: usize) -> &mut DeltaFrame {
        self.check_ptr(ptr);
        &mut self.slots[ptr]
    }

    /// Serializes the bridge into the snapshot of slot `ptr`.
    pub fn save_state<B: SimulationBridge + ?Sized>(
        &mut self,
        ptr: usize,
        frame: Frame,
        bridge: &mut B,
    ) -> Result<(), NetplayError> {
        let expected = self.state_size;
        let written = bridge.serialize(&mut self.slot_mut(ptr).state);
        match written {
            Some(written) if written == expected => Ok(()),
            Some(written) => {
                let violation = InvariantViolation::new(
                    ViolationSeverity::Critical,
                    ViolationKind::FrameRing,
                    "bridge wrote a snapshot of the wrong size",
                    concat!(file!(), ":", line!()),
                )
                .with_frame(frame)
                .with_context("written", written.to_string())
                .with_context("expected", expected.to_string());
                report_to_observer(self.violation_observer.as_ref(), &violation);
                Err(NetplayError::StateTransfer {
                    frame,
                    context: format!("serialized {written} bytes, expected {expected}"),
                })
            },
            None => Err(NetplayError::StateTransfer {
                frame,
                context: "bridge failed to serialize".to_owned(),
            }),
        }
    }

    /// Restores the snapshot of slot `ptr` into the bridge.
    pub fn load_state<B: SimulationBridge + ?Sized>(
        &self,
        ptr: usize,
        frame: Frame,
        bridge: &mut B,
    ) -> Result<(), NetplayError> {
        if bridge.deserialize(&self.slot(ptr).state) {
            Ok(())
        } else {
            Err(NetplayError::StateTransfer {
                frame,
                context: "bridge rejected snapshot".to_owned(),
            })
        }
    }

    #[inline]
    fn check_ptr(&self, ptr: usize) {
        debug_assert!(
            ptr < self.slots.len(),
            "ring slot {ptr} out of range for capacity {}",
            self.slots.len()
        );
        #[cfg(feature = "paranoid")]
        if ptr >= self.slots.len() {
            crate::report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Critical,
                ViolationKind::FrameRing,
                "ring slot {} out of range for capacity {}",
                ptr,
                self.slots.len()
            );
        }
    }
}
