//! The boundary between the engine and the simulation it drives.
//!
//! The engine never looks inside the simulation. It asks the [`SimulationBridge`] for
//! fixed-size snapshots, restores them, executes single steps with an explicit
//! [`FrameInputs`] value, and polls local controller state. Presentation side effects
//! go through an [`OutputSink`]; during replay the engine passes a [`NullSink`].

use serde::{Deserialize, Serialize};

use crate::{Frame, NUM_PORTS};

/// Digital pad device class. Ids `0..16` are buttons.
pub const DEVICE_JOYPAD: u32 = 1;
/// Analog stick device class. Index 0 is the left stick, 1 the right; id 0 is X, id 1 is Y.
pub const DEVICE_ANALOG: u32 = 5;

/// Number of joypad button ids packed into the first input word.
pub const JOYPAD_BUTTONS: u32 = 16;

const ANALOG_STICKS: u32 = 2;
const INPUT_WORDS: usize = 1 + ANALOG_STICKS as usize;

/// One player's complete input for one frame.
///
/// Word 0 holds the joypad bitmask; words 1 and 2 hold the left and right stick,
/// `x | (y << 16)` as 16-bit two's complement. Predictions are compared on the
/// whole value, so a difference in any bit of any word counts as a misprediction.
///
/// # Examples
///
/// ```
/// use netplay_rollback::{InputState, DEVICE_ANALOG, DEVICE_JOYPAD};
///
/// let input = InputState::NONE.with_button(3, true).with_axis(0, 1, -200);
/// assert_eq!(input.value(DEVICE_JOYPAD, 0, 3), 1);
/// assert_eq!(input.value(DEVICE_ANALOG, 0, 1), -200);
/// assert_ne!(input, InputState::NONE);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InputState {
    words: [u32; INPUT_WORDS],
}

impl InputState {
    /// No buttons pressed, sticks centered.
    pub const NONE: InputState = InputState {
        words: [0; INPUT_WORDS],
    };

    /// Builds an input from raw words.
    #[must_use]
    pub const fn from_words(words: [u32; INPUT_WORDS]) -> Self {
        Self { words }
    }

    /// The raw words.
    #[must_use]
    pub const fn words(&self) -> [u32; INPUT_WORDS] {
        self.words
    }

    /// Returns a copy with button `id` set or cleared. Ids outside the pad are ignored.
    #[must_use]
    pub fn with_button(mut self, id: u32, pressed: bool) -> Self {
        if id < JOYPAD_BUTTONS {
            if pressed {
                self.words[0] |= 1 << id;
            } else {
                self.words[0] &= !(1 << id);
            }
        }
        self
    }

    /// Whether button `id` is pressed.
    #[must_use]
    pub fn button(&self, id: u32) -> bool {
        id < JOYPAD_BUTTONS && self.words[0] & (1 << id) != 0
    }

    /// Returns a copy with one stick axis replaced.
    #[must_use]
    pub fn with_axis(mut self, index: u32, id: u32, value: i16) -> Self {
        if let Some(word) = Self::stick_word(index) {
            let shift = if id == 0 { 0 } else { 16 };
            let cleared = self.words[word] & !(0xFFFF << shift);
            self.words[word] = cleared | (u32::from(value as u16) << shift);
        }
        self
    }

    /// One stick axis.
    #[must_use]
    pub fn axis(&self, index: u32, id: u32) -> i16 {
        match Self::stick_word(index) {
            Some(word) => {
                let shift = if id == 0 { 0 } else { 16 };
                ((self.words[word] >> shift) & 0xFFFF) as u16 as i16
            },
            None => 0,
        }
    }

    /// Answers a device query the way a polled controller would.
    #[must_use]
    pub fn value(&self, device: u32, index: u32, id: u32) -> i16 {
        match device {
            DEVICE_JOYPAD => i16::from(self.button(id)),
            DEVICE_ANALOG => self.axis(index, id),
            _ => 0,
        }
    }

    /// Captures a full input by querying every button and axis through `poll`.
    pub fn capture(mut poll: impl FnMut(u32, u32, u32) -> i16) -> Self {
        let mut input = InputState::NONE;
        for id in 0..JOYPAD_BUTTONS {
            input = input.with_button(id, poll(DEVICE_JOYPAD, 0, id) != 0);
        }
        for index in 0..ANALOG_STICKS {
            for id in 0..2 {
                input = input.with_axis(index, id, poll(DEVICE_ANALOG, index, id));
            }
        }
        input
    }

    fn stick_word(index: u32) -> Option<usize> {
        (index < ANALOG_STICKS).then_some(1 + index as usize)
    }
}

/// The inputs of both ports for one frame, after port flipping has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameInputs {
    /// The frame these inputs drive.
    pub frame: Frame,
    /// Input per logical port.
    pub ports: [InputState; NUM_PORTS],
}

impl FrameInputs {
    /// Inputs for `frame` with every port idle.
    #[must_use]
    pub const fn idle(frame: Frame) -> Self {
        Self {
            frame,
            ports: [InputState::NONE; NUM_PORTS],
        }
    }

    /// Answers a simulation input query. Ports beyond the second read as idle.
    #[must_use]
    pub fn state(&self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        self.ports
            .get(port as usize)
            .map_or(0, |input| input.value(device, index, id))
    }
}

/// Identity of the simulation implementation, folded into the handshake's implementation magic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreInfo {
    /// Interface version of the simulation.
    pub api_version: u32,
    /// Implementation name.
    pub library_name: String,
    /// Implementation version.
    pub library_version: String,
}

/// Receiver for presentation side effects of a step.
pub trait OutputSink {
    /// A rendered frame.
    fn video_frame(&mut self, _data: &[u8], _width: u32, _height: u32) {}

    /// Interleaved audio samples.
    fn audio_samples(&mut self, _samples: &[i16]) {}

    /// Whether effects are presented. Bridges must skip persistent writes (save files)
    /// when this is `false`.
    fn is_live(&self) -> bool {
        true
    }
}

/// Discards all output. Passed to the bridge while frames are replayed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn is_live(&self) -> bool {
        false
    }
}

/// The capability set the engine needs from a deterministic simulation.
///
/// Given bit-identical state and [`FrameInputs`], `step` must produce bit-identical
/// state. The engine assumes this and cannot detect violations.
pub trait SimulationBridge {
    /// Exact size of every snapshot, or `None` if the simulation cannot provide one.
    fn state_size(&self) -> Option<usize>;

    /// Writes a snapshot of the current state into `buf`, returning the bytes written.
    fn serialize(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Restores a snapshot produced by `serialize`.
    fn deserialize(&mut self, buf: &[u8]) -> bool;

    /// Executes exactly one frame.
    fn step(&mut self, inputs: &FrameInputs, sink: &mut dyn OutputSink);

    /// Reads the local controller.
    fn poll_input(&self, port: u32, device: u32, index: u32, id: u32) -> i16;

    /// Identity of the simulation implementation.
    fn core_info(&self) -> CoreInfo {
        CoreInfo::default()
    }

    /// Checksum of the loaded content. Zero means unknown and is never compared.
    fn content_crc(&self) -> u32 {
        0
    }
}
