//! The outgoing input window.
//!
//! Every datagram carries the last `len` local inputs. A receiver that lost some packets
//! recovers the missing frames from any later one, so nothing is ever retransmitted on
//! demand. The window length must be at least twice the ring capacity: a peer that is
//! stalled may be waiting for a frame up to that far behind our newest one.

use crate::bridge::InputState;
use crate::network::messages::{FrameInput, FramePacket};
use crate::Frame;

/// The last `len` (frame, input) pairs produced locally, oldest first.
#[derive(Debug, Clone)]
pub struct RedundancyWindow {
    packet: FramePacket,
    len: usize,
}

impl RedundancyWindow {
    /// A window of `redundancy` frames, widened to `2 * capacity` when that is larger.
    #[must_use]
    pub fn new(redundancy: usize, capacity: usize) -> Self {
        Self {
            packet: FramePacket::empty(),
            len: redundancy.max(2 * capacity).max(1),
        }
    }

    /// Number of frames the window repeats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Records the input of a newly produced frame, evicting the oldest once full.
    pub fn push(&mut self, frame: Frame, input: InputState) {
        if self.packet.inputs.len() == self.len {
            self.packet.inputs.remove(0);
        }
        self.packet.inputs.push(FrameInput { frame, input });
    }

    /// The packet to send: the whole window.
    #[must_use]
    pub fn packet(&self) -> &FramePacket {
        &self.packet
    }
}
