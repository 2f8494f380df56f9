//! Session lifecycle and the frame-scheduled transitions both peers agree on.

use crate::Frame;

/// A session is always in one of these states. You can query the current state with
/// [`NetplaySession::state`](crate::NetplaySession::state).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Exchanging hello, settings and the initial state. No frames are produced.
    Handshake,
    /// Frames are flowing.
    Synchronized,
    /// The session ended. Only the bridge can be taken back out.
    Disconnected,
}

impl SessionState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::Synchronized => "Synchronized",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pause and flip modifiers scheduled for an agreed frame.
///
/// A transition is requested for `frame_count + lead`, far enough ahead that the peer
/// hears about it before reaching that frame. Both peers then apply it when their own
/// `frame_count` reaches the same value. Only one transition may be pending at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transitions {
    pause_frame: Option<Frame>,
    flip_frame: Option<Frame>,
    paused_reported: bool,
}

impl Transitions {
    /// Whether a pause or flip is scheduled but not reached at `now`.
    #[must_use]
    pub fn pending(&self, now: Frame) -> bool {
        self.pause_frame.is_some_and(|f| f > now) || self.flip_frame.is_some_and(|f| f > now)
    }

    /// The scheduled pause frame.
    #[must_use]
    pub fn pause_frame(&self) -> Option<Frame> {
        self.pause_frame
    }

    /// Arms a pause for `frame`. Refused while another transition is pending or a pause
    /// is already in force.
    pub fn schedule_pause(&mut self, frame: Frame, now: Frame) -> bool {
        if self.pending(now) || self.pause_frame.is_some() || frame < now {
            return false;
        }
        self.pause_frame = Some(frame);
        self.paused_reported = false;
        true
    }

    /// Withdraws the pause at `frame` if it has not been reached yet.
    pub fn cancel_pause(&mut self, frame: Frame, now: Frame) -> bool {
        if self.pause_frame == Some(frame) && frame > now {
            self.pause_frame = None;
            return true;
        }
        false
    }

    /// Lifts any pause. Returns whether one was armed.
    pub fn resume(&mut self) -> bool {
        self.paused_reported = false;
        self.pause_frame.take().is_some()
    }

    /// Whether the frame `now` must not be produced.
    #[must_use]
    pub fn is_paused_at(&self, now: Frame) -> bool {
        self.pause_frame.is_some_and(|f| now >= f)
    }

    /// Returns `true` the first time it is called after the pause took effect.
    pub fn take_pause_report(&mut self, now: Frame) -> bool {
        if self.is_paused_at(now) && !self.paused_reported {
            self.paused_reported = true;
            return true;
        }
        false
    }

    /// Remembers a flip scheduled in the port map, so reaching it can be reported.
    pub fn note_flip(&mut self, frame: Frame) {
        self.flip_frame = Some(frame);
    }

    /// Forgets a flip that was withdrawn.
    pub fn forget_flip(&mut self, frame: Frame) {
        if self.flip_frame == Some(frame) {
            self.flip_frame = None;
        }
    }

    /// The flip frame, once `now` reached it. Reported once.
    pub fn take_reached_flip(&mut self, now: Frame) -> Option<Frame> {
        match self.flip_frame {
            Some(frame) if now >= frame => self.flip_frame.take(),
            _ => None,
        }
    }
}
