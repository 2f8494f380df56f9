//! A deterministic simulation stub driven by scripted input.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use netplay_rollback::{
    Frame, FrameInputs, InputState, OutputSink, SimulationBridge, DEVICE_JOYPAD,
};

/// Bytes of a serialized [`StateStub`].
pub const STATE_SIZE: usize = 12;

/// What the local player presses on each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputScript {
    /// Nothing, ever.
    Idle,
    /// One button held down the whole time.
    Hold(u32),
    /// A different button combination almost every frame, derived from the seed.
    Pattern(u32),
}

impl InputScript {
    /// The joypad bitmask pressed on `frame`.
    #[must_use]
    pub fn buttons(self, frame: u32) -> u32 {
        match self {
            Self::Idle => 0,
            Self::Hold(button) => 1 << button,
            Self::Pattern(seed) => {
                let mut x = frame.wrapping_mul(0x9E37_79B9) ^ seed.wrapping_mul(0x85EB_CA6B);
                x ^= x >> 15;
                x = x.wrapping_mul(0x2C1B_3C6D);
                x ^= x >> 12;
                // Change only every few frames so predictions sometimes hold.
                if frame % 3 == 0 {
                    x & 0xFFFF
                } else {
                    (x >> 4) & 0x0F0F
                }
            },
        }
    }

    /// The captured input for `frame`, as the engine sees it.
    #[must_use]
    pub fn input(self, frame: u32) -> InputState {
        let mask = self.buttons(frame);
        InputState::capture(|device, _index, id| {
            i16::from(device == DEVICE_JOYPAD && id < 16 && mask & (1 << id) != 0)
        })
    }
}

/// The whole simulation state: a frame counter and a running hash of every input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateStub {
    pub frame: u32,
    pub state: u64,
}

impl StateStub {
    /// Advances by one frame.
    pub fn advance(&mut self, inputs: &FrameInputs) {
        assert_eq!(
            inputs.frame,
            Frame::new(self.frame),
            "inputs for the wrong frame"
        );
        let mut hash = self.state ^ 0xcbf2_9ce4_8422_2325;
        for port in &inputs.ports {
            for word in port.words() {
                hash ^= u64::from(word);
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
        }
        self.state = hash.rotate_left(7) ^ u64::from(self.frame);
        self.frame += 1;
    }
}

/// A [`SimulationBridge`] around [`StateStub`] whose local pad follows an [`InputScript`].
#[derive(Debug, Clone)]
pub struct GameStub {
    pub gs: StateStub,
    pub script: InputScript,
    /// Steps executed, replays included.
    pub steps: u64,
}

impl GameStub {
    #[must_use]
    pub fn new(script: InputScript) -> Self {
        Self {
            gs: StateStub::default(),
            script,
            steps: 0,
        }
    }

    #[must_use]
    pub fn with_state(script: InputScript, state: u64) -> Self {
        Self {
            gs: StateStub { frame: 0, state },
            script,
            steps: 0,
        }
    }
}

impl SimulationBridge for GameStub {
    fn state_size(&self) -> Option<usize> {
        Some(STATE_SIZE)
    }

    fn serialize(&mut self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() != STATE_SIZE {
            return None;
        }
        buf[..4].copy_from_slice(&self.gs.frame.to_le_bytes());
        buf[4..].copy_from_slice(&self.gs.state.to_le_bytes());
        Some(STATE_SIZE)
    }

    fn deserialize(&mut self, buf: &[u8]) -> bool {
        if buf.len() != STATE_SIZE {
            return false;
        }
        self.gs.frame = u32::from_le_bytes(buf[..4].try_into().unwrap());
        self.gs.state = u64::from_le_bytes(buf[4..].try_into().unwrap());
        true
    }

    fn step(&mut self, inputs: &FrameInputs, _sink: &mut dyn OutputSink) {
        self.gs.advance(inputs);
        self.steps += 1;
    }

    fn poll_input(&self, _port: u32, device: u32, _index: u32, id: u32) -> i16 {
        let mask = self.script.buttons(self.gs.frame);
        i16::from(device == DEVICE_JOYPAD && id < 16 && mask & (1 << id) != 0)
    }
}

/// Runs `frames` frames locally with both scripts, the way two peers with perfect foresight
/// would. Frame 0 runs idle on both ports.
#[must_use]
pub fn reference_state(
    initial: u64,
    port0: InputScript,
    port1: InputScript,
    frames: u32,
) -> StateStub {
    let mut gs = StateStub {
        frame: 0,
        state: initial,
    };
    for frame in 0..frames {
        let mut inputs = FrameInputs::idle(Frame::new(frame));
        if frame > 0 {
            inputs.ports[0] = port0.input(frame);
            inputs.ports[1] = port1.input(frame);
        }
        gs.advance(&inputs);
    }
    gs
}
