use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::bridge::{FrameInputs, InputState};
use crate::{Frame, MAX_DELAY_FRAMES, MAX_NICKNAME_LEN, REDUNDANT_FRAMES};

/// Protocol identifier carried by every [`Hello`]. Peers with a different value cannot talk.
pub const PROTOCOL_MAGIC: u32 = 0x4E50_5242;

/// Identity and compatibility data exchanged first on the command stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_magic: u32,
    pub implementation_magic: u32,
    /// Zero when the content checksum is unknown.
    pub content_crc: u32,
    pub state_size: u32,
}

/// One setting announced to the peer during the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigItem {
    /// Display name, shorter than [`MAX_NICKNAME_LEN`] bytes.
    Nickname(String),
    /// The player polls their own physical port instead of port 0.
    SwapInput(bool),
    /// Requested input-delay frames, at most [`MAX_DELAY_FRAMES`].
    DelayFrames(u32),
    /// The sender's player slot (0 for the host, 1 for the client).
    PlayerSlot(u32),
}

impl ConfigItem {
    /// A nickname item, truncated on a character boundary to fit the wire limit.
    #[must_use]
    pub fn nickname(name: &str) -> Self {
        Self::Nickname(truncate_nickname(name))
    }

    /// A delay item, clamped to [`MAX_DELAY_FRAMES`].
    #[must_use]
    pub fn delay_frames(frames: u32) -> Self {
        Self::DelayFrames(frames.min(MAX_DELAY_FRAMES))
    }
}

pub(crate) fn truncate_nickname(name: &str) -> String {
    let mut end = name.len().min(MAX_NICKNAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.get(..end).unwrap_or_default().to_owned()
}

/// A single cheat entry, transferred verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheatCode {
    pub index: u32,
    pub enabled: bool,
    pub code: String,
}

/// Messages on the reliable, ordered command stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Hello(Hello),
    /// The host's serialized state, sent once during the handshake.
    InitialState { state: Vec<u8> },
    Ack,
    Nak,
    /// Ports swap from `frame` on.
    FlipPlayers { frame: Frame },
    Spectate { enabled: bool },
    Disconnect,
    Config(ConfigItem),
    /// Neither peer produces `frame` or anything after it until `Resume`.
    Pause { frame: Frame },
    Resume,
    /// The sender's state at the start of `frame`, every earlier frame confirmed.
    LoadSavestate { frame: Frame, state: Vec<u8> },
    Cheats(Vec<CheatCode>),
}

impl Command {
    /// Whether the receiver answers with `Ack` or `Nak`.
    #[must_use]
    pub const fn needs_ack(&self) -> bool {
        !matches!(self, Self::Ack | Self::Nak | Self::Disconnect)
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::InitialState { .. } => "initial-state",
            Self::Ack => "ack",
            Self::Nak => "nak",
            Self::FlipPlayers { .. } => "flip-players",
            Self::Spectate { .. } => "spectate",
            Self::Disconnect => "disconnect",
            Self::Config(_) => "config",
            Self::Pause { .. } => "pause",
            Self::Resume => "resume",
            Self::LoadSavestate { .. } => "load-savestate",
            Self::Cheats(_) => "cheats",
        }
    }
}

// Snapshots can be megabytes; print their length only.
impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hello(hello) => f.debug_tuple("Hello").field(hello).finish(),
            Self::InitialState { state } => f
                .debug_struct("InitialState")
                .field("state", &StateLen(state))
                .finish(),
            Self::Ack => f.write_str("Ack"),
            Self::Nak => f.write_str("Nak"),
            Self::FlipPlayers { frame } => {
                f.debug_struct("FlipPlayers").field("frame", frame).finish()
            },
            Self::Spectate { enabled } => {
                f.debug_struct("Spectate").field("enabled", enabled).finish()
            },
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Config(item) => f.debug_tuple("Config").field(item).finish(),
            Self::Pause { frame } => f.debug_struct("Pause").field("frame", frame).finish(),
            Self::Resume => f.write_str("Resume"),
            Self::LoadSavestate { frame, state } => f
                .debug_struct("LoadSavestate")
                .field("frame", frame)
                .field("state", &StateLen(state))
                .finish(),
            Self::Cheats(codes) => f.debug_tuple("Cheats").field(codes).finish(),
        }
    }
}

struct StateLen<'a>(&'a [u8]);

impl std::fmt::Debug for StateLen<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} bytes>", self.0.len())
    }
}

/// One frame's local input as sent on the datagram path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInput {
    pub frame: Frame,
    pub input: InputState,
}

/// A datagram: the sender's most recent inputs, oldest first.
///
/// Every packet repeats the whole redundancy window, so losing one packet loses nothing
/// as long as a later one arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePacket {
    pub inputs: SmallVec<[FrameInput; REDUNDANT_FRAMES]>,
}

impl FramePacket {
    /// A packet without inputs. The client sends one so the host learns its address.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the packet carries no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// The newest frame carried.
    #[must_use]
    pub fn last_frame(&self) -> Option<Frame> {
        self.inputs.last().map(|entry| entry.frame)
    }
}

/// Messages on a spectator connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectatorMessage {
    /// Sent by the spectator after connecting. Optional.
    Hello { nickname: String },
    /// Sent by the host once, before any inputs.
    Header {
        nickname: String,
        implementation_magic: u32,
        content_crc: u32,
        /// The frame `state` belongs to; the first batch of inputs starts here.
        start_frame: Frame,
        state: Vec<u8>,
    },
    /// Finalized frames, contiguous and in order.
    Inputs(Vec<FrameInputs>),
}

impl std::fmt::Debug for SpectatorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hello { nickname } => {
                f.debug_struct("Hello").field("nickname", nickname).finish()
            },
            Self::Header {
                nickname,
                implementation_magic,
                content_crc,
                start_frame,
                state,
            } => f
                .debug_struct("Header")
                .field("nickname", nickname)
                .field("implementation_magic", implementation_magic)
                .field("content_crc", content_crc)
                .field("start_frame", start_frame)
                .field("state", &StateLen(state))
                .finish(),
            Self::Inputs(frames) => f.debug_tuple("Inputs").field(&frames.len()).finish(),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::codec;

    #[test]
    fn ack_requirements() {
        assert!(!Command::Ack.needs_ack());
        assert!(!Command::Nak.needs_ack());
        assert!(!Command::Disconnect.needs_ack());
        assert!(Command::Resume.needs_ack());
        assert!(Command::Pause { frame: Frame::new(3) }.needs_ack());
        assert!(Command::Config(ConfigItem::SwapInput(true)).needs_ack());
        assert!(Command::InitialState { state: vec![1] }.needs_ack());
    }

    #[test]
    fn nickname_is_truncated_below_limit() {
        let long = "x".repeat(100);
        let ConfigItem::Nickname(name) = ConfigItem::nickname(&long) else {
            panic!("expected nickname");
        };
        assert_eq!(name.len(), MAX_NICKNAME_LEN - 1);
    }

    #[test]
    fn nickname_truncation_respects_char_boundaries() {
        let name = "é".repeat(20);
        let ConfigItem::Nickname(short) = ConfigItem::nickname(&name) else {
            panic!("expected nickname");
        };
        assert!(short.len() < MAX_NICKNAME_LEN);
        assert!(short.chars().all(|c| c == 'é'));
        assert_eq!(short.chars().count(), 15);
    }

    #[test]
    fn delay_is_clamped() {
        assert_eq!(ConfigItem::delay_frames(3), ConfigItem::DelayFrames(3));
        assert_eq!(
            ConfigItem::delay_frames(99),
            ConfigItem::DelayFrames(MAX_DELAY_FRAMES)
        );
    }

    #[test]
    fn debug_hides_state_bytes() {
        let cmd = Command::LoadSavestate {
            frame: Frame::new(5),
            state: vec![0xAA; 1 << 16],
        };
        let text = format!("{cmd:?}");
        assert!(text.contains("65536 bytes"));
        assert!(text.len() < 128);
    }

    #[test]
    fn full_window_packet_stays_small() {
        let mut packet = FramePacket::empty();
        for frame in 0..REDUNDANT_FRAMES as u32 {
            packet.inputs.push(FrameInput {
                frame: Frame::new(frame),
                input: InputState::NONE.with_button(1, true),
            });
        }
        assert!(!packet.inputs.spilled());
        let bytes = codec::encode(&packet).unwrap();
        assert!(bytes.len() < 512, "packet is {} bytes", bytes.len());
        let decoded: FramePacket = codec::decode_value(&bytes).unwrap();
        assert_eq!(decoded.last_frame(), Some(Frame::new(REDUNDANT_FRAMES as u32 - 1)));
    }
}
