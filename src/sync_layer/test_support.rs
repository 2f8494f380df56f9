//! A tiny deterministic bridge and a frame driver shared by the sync layer's unit tests.

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use crate::bridge::{FrameInputs, OutputSink, SimulationBridge};
use crate::sync_layer::{ReconcileOutcome, SyncLayer};
use crate::{InputState, NullSink};

/// Folds every frame's inputs into a `u64`, so any divergence in input history shows up.
#[derive(Debug, Default, Clone)]
pub(crate) struct Counter {
    pub value: u64,
    pub steps: u32,
    pub reject_loads: bool,
}

impl Counter {
    pub fn apply(&mut self, inputs: &FrameInputs) {
        let mix = u64::from(inputs.ports[0].words()[0]) * 3
            + u64::from(inputs.ports[1].words()[0]) * 7;
        self.value = self.value.wrapping_mul(31).wrapping_add(mix + 1);
    }
}

impl SimulationBridge for Counter {
    fn state_size(&self) -> Option<usize> {
        Some(8)
    }

    fn serialize(&mut self, buf: &mut [u8]) -> Option<usize> {
        buf.copy_from_slice(&self.value.to_le_bytes());
        Some(8)
    }

    fn deserialize(&mut self, buf: &[u8]) -> bool {
        if self.reject_loads {
            return false;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(buf);
        self.value = u64::from_le_bytes(bytes);
        true
    }

    fn step(&mut self, inputs: &FrameInputs, _sink: &mut dyn OutputSink) {
        self.steps += 1;
        self.apply(inputs);
    }

    fn poll_input(&self, _port: u32, _device: u32, _index: u32, _id: u32) -> i16 {
        0
    }
}

pub(crate) fn input(bits: u32) -> InputState {
    InputState::from_words([bits, 0, 0])
}

/// Arms, predicts, steps and post-processes one frame.
pub(crate) fn run(layer: &mut SyncLayer, bridge: &mut Counter, local: InputState) -> ReconcileOutcome {
    layer.arm_frame(bridge, local).unwrap();
    layer.predict_current();
    let inputs = layer.current_inputs();
    bridge.step(&inputs, &mut NullSink);
    layer.post_step(bridge).unwrap()
}
