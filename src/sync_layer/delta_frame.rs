//! One ring slot: the snapshot taken before a frame ran and the inputs that frame used.

use crate::InputState;

/// The record of one simulation step.
///
/// Slots are allocated once and recycled every time the ring wraps; [`DeltaFrame::rearm`]
/// clears the input bookkeeping without touching the snapshot allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    /// Snapshot of the simulation at the start of this frame.
    pub state: Box<[u8]>,
    /// Confirmed remote input, valid once `is_simulated` is false.
    pub real_input: InputState,
    /// The remote input guessed when the frame was executed without confirmation.
    pub simulated_input: InputState,
    /// This peer's own input.
    pub self_input: InputState,
    /// The frame is executing on a guess; no confirmed remote input yet.
    pub is_simulated: bool,
    /// The frame was executed with confirmed remote input and never needs replay.
    pub used_real: bool,
}

impl DeltaFrame {
    pub(crate) fn with_state_size(state_size: usize) -> Self {
        Self {
            state: vec![0; state_size].into_boxed_slice(),
            real_input: InputState::NONE,
            simulated_input: InputState::NONE,
            self_input: InputState::NONE,
            is_simulated: false,
            used_real: false,
        }
    }

    /// Prepares a recycled slot for a newly produced frame.
    pub(crate) fn rearm(&mut self, self_input: InputState) {
        self.self_input = self_input;
        self.real_input = InputState::NONE;
        self.simulated_input = InputState::NONE;
        self.is_simulated = false;
        self.used_real = false;
    }

    /// The remote input the simulation sees for this frame.
    #[must_use]
    pub fn remote_input(&self) -> InputState {
        if self.is_simulated {
            self.simulated_input
        } else {
            self.real_input
        }
    }

    /// Executing this frame again would not change anything.
    #[must_use]
    pub fn prediction_held(&self) -> bool {
        self.used_real || self.simulated_input == self.real_input
    }
}

// Snapshots can be megabytes; show their size only.
impl std::fmt::Debug for DeltaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            state,
            real_input,
            simulated_input,
            self_input,
            is_simulated,
            used_real,
        } = self;
        f.debug_struct("DeltaFrame")
            .field("state_len", &state.len())
            .field("real_input", real_input)
            .field("simulated_input", simulated_input)
            .field("self_input", self_input)
            .field("is_simulated", is_simulated)
            .field("used_real", used_real)
            .finish()
    }
}
