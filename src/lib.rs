//! # Netplay Rollback
//!
//! A deterministic lockstep rollback engine for two peers running the same
//! simulation, with read-only spectator fan-out.
//!
//! Each peer executes every frame immediately, predicting the remote player's input
//! (the last confirmed input, repeated). Remote input travels over a best-effort
//! datagram channel in which every packet repeats the last sixteen frames, so a lost
//! packet is covered by the next one. When confirmed input shows a prediction was
//! wrong, the engine restores the snapshot taken before that frame and re-executes
//! every frame up to the present with the corrected input.
//!
//! The simulation is reached only through [`SimulationBridge`]. A session is driven by
//! two calls around each simulation step:
//!
//! ```text
//! loop {
//!     match session.pre_step()? {          // arms local input, polls the network
//!         StepStatus::Ready => {
//!             let inputs = session.current_inputs();
//!             session.bridge_mut().step(&inputs, &mut live_output);
//!             session.post_step()?;        // reconciliation and replay
//!         }
//!         _ => { /* handshaking, stalled or paused: render the last frame again */ }
//!     }
//! }
//! ```
//!
//! [`NetplaySession::run_frame`] bundles those three calls.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use bridge::{
    CoreInfo, FrameInputs, InputState, NullSink, OutputSink, SimulationBridge, DEVICE_ANALOG,
    DEVICE_JOYPAD,
};
pub use error::{DisconnectReason, NetplayError};
pub use network::chaos_socket::{ChaosConfig, ChaosConfigBuilder, ChaosSocket, ChaosStats};
pub use network::messages::{CheatCode, Command, ConfigItem, FramePacket};
pub use network::network_stats::NetworkStats;
pub use network::tcp_stream::FramedStream;
pub use network::udp_socket::UdpDatagramSocket;
pub use sessions::broadcast::BroadcastSession;
pub use sessions::builder::{create_session, Role, SessionBuilder};
pub use sessions::config::ProtocolConfig;
pub use sessions::event_drain::EventDrain;
pub use sessions::p2p_session::{P2PSession, PeerInfo};
pub use sessions::session_trait::NetplaySession;
pub use sessions::spectator::{SpectatorHost, SpectatorSession};
pub use sessions::state::SessionState;
pub use sync_layer::{FinalizedFrame, RollbackStats};

pub mod bridge;
#[doc(hidden)]
pub mod error;
pub mod prelude;
/// Small seeded PCG32 generator used by the chaos socket.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[cfg(test)]
mod test_config;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod broadcast;
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod event_drain;
    #[doc(hidden)]
    pub mod p2p_session;
    #[doc(hidden)]
    pub mod session_trait;
    #[doc(hidden)]
    pub mod spectator;
    #[doc(hidden)]
    pub mod state;
}
#[doc(hidden)]
pub mod network {
    pub mod chaos_socket;
    /// Binary codec for wire messages and stream framing.
    pub mod codec;
    #[doc(hidden)]
    pub mod handshake;
    /// In-process transports for tests, benches and local tooling.
    pub mod memory;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod redundancy;
    #[doc(hidden)]
    pub mod tcp_stream;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing and benchmarking.
///
/// **This module is NOT part of the public API.** Nothing here is covered by semver.
#[doc(hidden)]
pub mod __internal {
    pub use crate::network::handshake::{implementation_magic, Handshake};
    pub use crate::network::redundancy::RedundancyWindow;
    pub use crate::sync_layer::{
        Cursor, DeltaFrame, FrameRing, PortMap, ReconcileOutcome, SyncLayer,
    };
}

// #############
// # CONSTANTS #
// #############

/// Upper bound for the negotiated input-delay frames. The ring holds one more slot than this.
pub const MAX_DELAY_FRAMES: u32 = 16;

/// Default number of frames repeated in every outgoing frame packet.
pub const REDUNDANT_FRAMES: usize = 16;

/// Maximum simultaneous spectators per host.
pub const MAX_SPECTATORS: usize = 16;

/// Nicknames are truncated to fit in this many bytes.
pub const MAX_NICKNAME_LEN: usize = 32;

/// Number of players in a two-peer session.
pub const NUM_PORTS: usize = 2;

/// A frame is a single step of simulation.
///
/// Frames start at 0 and increment by one per produced step. Ring slots are addressed
/// separately from frames so that the ordering of cursors never depends on wraparound.
///
/// # Examples
///
/// ```
/// use netplay_rollback::Frame;
///
/// let frame = Frame::new(10);
/// assert_eq!((frame + 5).as_u32(), 15);
/// assert_eq!(frame + 5 - frame, 5);
/// assert!(frame + 1 > frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of every session.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame`.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the frame before this one, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Frame {
        Frame(self.0.saturating_sub(1))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

/// Distance between two frames; zero when `rhs` is the later one.
impl std::ops::Sub<Frame> for Frame {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

// #############
// #   ENUMS   #
// #############

/// What [`pre_step`](NetplaySession::pre_step) decided for the current frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Input is armed: step the simulation once, then call `post_step`.
    Ready,
    /// The handshake with the peer has not completed yet. Do not step.
    Handshaking,
    /// The ring holds as many unconfirmed frames as it can. Do not step.
    Stalled,
    /// Both peers reached the agreed pause frame. Do not step.
    Paused,
}

/// Notifications that you can receive from the session. Handling them is up to the user.
///
/// # Forward Compatibility
///
/// This enum is `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// The handshake completed and frames are flowing.
    Synchronized {
        /// The peer's nickname.
        peer: String,
        /// Negotiated input-delay frames.
        delay_frames: u32,
    },
    /// The peer announced one of its settings.
    PeerConfig(ConfigItem),
    /// A port flip was agreed for the given frame.
    FlipScheduled {
        /// First frame executed with flipped ports.
        frame: Frame,
    },
    /// The agreed flip frame was reached.
    Flipped {
        /// The frame at which the flip applied.
        frame: Frame,
    },
    /// A pause was agreed for the given frame.
    PauseScheduled {
        /// First frame that will not be produced.
        frame: Frame,
    },
    /// The agreed pause frame was reached.
    Paused {
        /// The frame the session stopped at.
        frame: Frame,
    },
    /// A pause was lifted.
    Resumed,
    /// A savestate from the peer was loaded and replayed from the given frame.
    SavestateLoaded {
        /// The frame the savestate belongs to.
        frame: Frame,
    },
    /// The peer switched in or out of spectate mode.
    PeerSpectating {
        /// Whether the peer only watches now.
        enabled: bool,
    },
    /// The peer sent its cheat list.
    CheatsReceived(Vec<CheatCode>),
    /// A spectator connected.
    SpectatorJoined {
        /// The spectator's address.
        addr: std::net::SocketAddr,
    },
    /// A spectator was dropped.
    SpectatorLeft {
        /// The spectator's address.
        addr: std::net::SocketAddr,
    },
    /// The session ended.
    Disconnected {
        /// Why it ended.
        reason: DisconnectReason,
    },
}

// #############
// #  TRAITS   #
// #############

/// Best-effort transport for [`FramePacket`]s.
///
/// Packets may be lost, duplicated or reordered; the engine tolerates all three.
/// Implementations know their single peer.
#[cfg(feature = "sync-send")]
pub trait DatagramSocket: Send {
    /// Sends one packet to the peer. Failures are swallowed.
    fn send_packet(&mut self, packet: &FramePacket);

    /// Returns every packet received since the last call.
    fn receive_packets(&mut self) -> Vec<FramePacket>;
}

/// Best-effort transport for [`FramePacket`]s.
///
/// Packets may be lost, duplicated or reordered; the engine tolerates all three.
/// Implementations know their single peer.
#[cfg(not(feature = "sync-send"))]
pub trait DatagramSocket {
    /// Sends one packet to the peer. Failures are swallowed.
    fn send_packet(&mut self, packet: &FramePacket);

    /// Returns every packet received since the last call.
    fn receive_packets(&mut self) -> Vec<FramePacket>;
}

/// Reliable, ordered, non-blocking transport for [`Command`]s.
///
/// Any `Err` is treated as a hangup and ends the session.
#[cfg(feature = "sync-send")]
pub trait CommandStream: Send {
    /// Queues a command and writes as much as the stream accepts.
    fn send_command(&mut self, command: &Command) -> Result<(), NetplayError>;

    /// Writes any queued bytes the stream did not accept earlier.
    fn flush_commands(&mut self) -> Result<(), NetplayError>;

    /// Returns every complete command received since the last call.
    fn receive_commands(&mut self) -> Result<Vec<Command>, NetplayError>;
}

/// Reliable, ordered, non-blocking transport for [`Command`]s.
///
/// Any `Err` is treated as a hangup and ends the session.
#[cfg(not(feature = "sync-send"))]
pub trait CommandStream {
    /// Queues a command and writes as much as the stream accepts.
    fn send_command(&mut self, command: &Command) -> Result<(), NetplayError>;

    /// Writes any queued bytes the stream did not accept earlier.
    fn flush_commands(&mut self) -> Result<(), NetplayError>;

    /// Returns every complete command received since the last call.
    fn receive_commands(&mut self) -> Result<Vec<Command>, NetplayError>;
}

// ###################
// # UNIT TESTS      #
// ###################
