//! Connection setup on the command stream.
//!
//! Both peers open with a [`Hello`] and four [`ConfigItem`]s; the host follows with its
//! serialized state. Every one of those commands is acknowledged, so a side is done once
//! it has heard everything from the peer and the peer has acknowledged everything it sent.
//!
//! ```text
//!   host                                 client
//!    │ Hello, Config x4, InitialState ──►  │
//!    │ ◄────────────── Hello, Config x4    │
//!    │ ◄────────────── Ack x5 (+1)         │
//!    │ Ack x5 ─────────────────────────►   │
//! ```
//!
//! The state machine never touches a transport. The session feeds it received commands and
//! sends what it returns, which keeps it testable without sockets.

use web_time::{Duration, Instant};

use crate::bridge::{CoreInfo, SimulationBridge};
use crate::network::messages::{Command, ConfigItem, Hello, PROTOCOL_MAGIC};
use crate::{Frame, NetplayError, MAX_DELAY_FRAMES};

/// Which side of the connection a peer is.
///
/// The host listens, owns the initial state and plays slot 0. The client connects,
/// adopts the host's state and plays slot 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listens and sends the initial state.
    Host,
    /// Connects and receives the initial state.
    Client,
}

impl Role {
    /// The player slot this side occupies.
    #[must_use]
    pub const fn player_slot(self) -> u32 {
        match self {
            Self::Host => 0,
            Self::Client => 1,
        }
    }

    /// The physical port the other side plays on.
    #[must_use]
    pub const fn remote_port(self) -> usize {
        match self {
            Self::Host => 1,
            Self::Client => 0,
        }
    }
}

/// What this side announces during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSettings {
    /// Display name.
    pub nickname: String,
    /// Poll the player's own physical port instead of port 0.
    pub swap_input: bool,
    /// Requested input delay.
    pub delay_frames: u32,
}

/// Folds the simulation's identity and this crate's version into one word.
///
/// Peers whose values differ run different code and would desync, so the handshake
/// refuses them.
#[must_use]
pub fn implementation_magic(info: &CoreInfo) -> u32 {
    let mut magic = info.api_version;
    for (i, c) in info.library_name.bytes().enumerate() {
        magic ^= u32::from(c) << (i & 0xf);
    }
    for (i, c) in info.library_version.bytes().enumerate() {
        magic ^= u32::from(c) << (i & 0xf);
    }
    for (i, c) in env!("CARGO_PKG_VERSION").bytes().enumerate() {
        magic ^= u32::from(c) << ((i & 0xf) + 16);
    }
    magic
}

/// The [`Hello`] describing `bridge`, whose snapshots are `state_size` bytes.
#[must_use]
pub fn local_hello<B: SimulationBridge + ?Sized>(bridge: &B, state_size: usize) -> Hello {
    Hello {
        protocol_magic: PROTOCOL_MAGIC,
        implementation_magic: implementation_magic(&bridge.core_info()),
        content_crc: bridge.content_crc(),
        state_size: state_size as u32,
    }
}

/// Settings the peer announced. Each field is set when its item arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PeerSettings {
    nickname: Option<String>,
    swap_input: Option<bool>,
    delay_frames: Option<u32>,
    player_slot: Option<u32>,
}

impl PeerSettings {
    fn is_complete(&self) -> bool {
        self.nickname.is_some()
            && self.swap_input.is_some()
            && self.delay_frames.is_some()
            && self.player_slot.is_some()
    }
}

/// Handshake progress for one side.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    local: Hello,
    settings: LocalSettings,
    started: Instant,
    timeout: Duration,
    opened: bool,
    outstanding_acks: usize,
    peer_hello: Option<Hello>,
    peer: PeerSettings,
    initial_state_loaded: bool,
}

impl Handshake {
    /// A handshake that has not sent anything yet. `timeout` counts from `now`.
    #[must_use]
    pub fn new(
        role: Role,
        local: Hello,
        settings: LocalSettings,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            role,
            local,
            settings,
            started: now,
            timeout,
            opened: false,
            outstanding_acks: 0,
            peer_hello: None,
            peer: PeerSettings::default(),
            initial_state_loaded: false,
        }
    }

    /// This side's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The commands this side opens with. The host's list ends with its serialized state.
    pub fn opening<B: SimulationBridge + ?Sized>(
        &mut self,
        bridge: &mut B,
    ) -> Result<Vec<Command>, NetplayError> {
        if self.opened {
            return Err(NetplayError::InvalidRequest {
                info: "handshake already opened".to_owned(),
            });
        }
        let mut commands = vec![
            Command::Hello(self.local),
            Command::Config(ConfigItem::nickname(&self.settings.nickname)),
            Command::Config(ConfigItem::SwapInput(self.settings.swap_input)),
            Command::Config(ConfigItem::delay_frames(self.settings.delay_frames)),
            Command::Config(ConfigItem::PlayerSlot(self.role.player_slot())),
        ];
        if self.role == Role::Host {
            let mut state = vec![0; self.local.state_size as usize];
            match bridge.serialize(&mut state) {
                Some(len) if len == state.len() => commands.push(Command::InitialState { state }),
                _ => {
                    return Err(NetplayError::StateTransfer {
                        frame: Frame::ZERO,
                        context: "bridge failed to serialize the initial state".to_owned(),
                    })
                },
            }
        }
        self.outstanding_acks = commands.iter().filter(|c| c.needs_ack()).count();
        self.opened = true;
        Ok(commands)
    }

    /// Checks the peer's hello against ours.
    ///
    /// On `Err` the caller answers `Nak` before giving up, so the peer learns why.
    pub fn on_hello(&mut self, hello: &Hello) -> Result<(), NetplayError> {
        if self.peer_hello.is_some() {
            return Err(rejected("peer sent a second hello"));
        }
        if hello.protocol_magic != self.local.protocol_magic {
            return Err(rejected(format!(
                "protocol magic {:#010x} does not match {:#010x}",
                hello.protocol_magic, self.local.protocol_magic
            )));
        }
        if hello.implementation_magic != self.local.implementation_magic {
            return Err(rejected(format!(
                "implementation magic {:#010x} does not match {:#010x}",
                hello.implementation_magic, self.local.implementation_magic
            )));
        }
        if hello.content_crc != 0
            && self.local.content_crc != 0
            && hello.content_crc != self.local.content_crc
        {
            return Err(rejected(format!(
                "content checksum {:#010x} does not match {:#010x}",
                hello.content_crc, self.local.content_crc
            )));
        }
        if hello.state_size != self.local.state_size {
            return Err(rejected(format!(
                "state size {} does not match {}",
                hello.state_size, self.local.state_size
            )));
        }
        self.peer_hello = Some(*hello);
        tracing::debug!(role = ?self.role, "peer hello accepted");
        Ok(())
    }

    /// Records one of the peer's settings.
    ///
    /// Returns `false` when the handshake is already complete. The negotiated values are
    /// fixed by then, so a re-announced item is left unapplied.
    pub fn on_config(&mut self, item: &ConfigItem) -> Result<bool, NetplayError> {
        if self.peer_hello.is_none() {
            return Err(rejected("configuration arrived before hello"));
        }
        if self.is_complete() {
            tracing::debug!(role = ?self.role, ?item, "ignoring configuration after handshake");
            return Ok(false);
        }
        match item {
            ConfigItem::Nickname(name) => self.peer.nickname = Some(name.clone()),
            ConfigItem::SwapInput(swap) => self.peer.swap_input = Some(*swap),
            ConfigItem::DelayFrames(frames) => {
                self.peer.delay_frames = Some((*frames).min(MAX_DELAY_FRAMES));
            },
            ConfigItem::PlayerSlot(slot) => {
                if *slot == self.role.player_slot() {
                    return Err(rejected(format!("both peers claim player slot {slot}")));
                }
                self.peer.player_slot = Some(*slot);
            },
        }
        Ok(true)
    }

    /// Loads the host's state into the client's bridge.
    pub fn on_initial_state<B: SimulationBridge + ?Sized>(
        &mut self,
        state: &[u8],
        bridge: &mut B,
    ) -> Result<(), NetplayError> {
        if self.role == Role::Host {
            return Err(rejected("the host never receives an initial state"));
        }
        if self.peer_hello.is_none() {
            return Err(rejected("initial state arrived before hello"));
        }
        if self.initial_state_loaded {
            return Err(rejected("peer sent a second initial state"));
        }
        if state.len() != self.local.state_size as usize {
            return Err(rejected(format!(
                "initial state has {} bytes, expected {}",
                state.len(),
                self.local.state_size
            )));
        }
        if !bridge.deserialize(state) {
            return Err(NetplayError::StateTransfer {
                frame: Frame::ZERO,
                context: "bridge rejected the initial state".to_owned(),
            });
        }
        self.initial_state_loaded = true;
        Ok(())
    }

    /// One of our opening commands was acknowledged.
    pub fn on_ack(&mut self) {
        self.outstanding_acks = self.outstanding_acks.saturating_sub(1);
    }

    /// The peer refused one of our opening commands.
    pub fn on_nak(&mut self, command: &str) -> Result<(), NetplayError> {
        self.outstanding_acks = self.outstanding_acks.saturating_sub(1);
        Err(rejected(format!("peer refused our {command}")))
    }

    /// Whether both directions are settled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.opened
            && self.peer_hello.is_some()
            && self.peer.is_complete()
            && self.outstanding_acks == 0
            && (self.role == Role::Host || self.initial_state_loaded)
    }

    /// Fails once the handshake has run longer than its timeout.
    pub fn check_timeout(&self, now: Instant) -> Result<(), NetplayError> {
        if !self.is_complete() && now.duration_since(self.started) > self.timeout {
            return Err(NetplayError::HandshakeTimeout);
        }
        Ok(())
    }

    /// The larger of both requested delays, once the peer's is known.
    #[must_use]
    pub fn negotiated_delay(&self) -> Option<u32> {
        self.peer
            .delay_frames
            .map(|remote| remote.max(self.settings.delay_frames).min(MAX_DELAY_FRAMES))
    }

    /// The peer's nickname, empty until announced.
    #[must_use]
    pub fn peer_nickname(&self) -> &str {
        self.peer.nickname.as_deref().unwrap_or_default()
    }

    /// Whether the peer polls its own physical port.
    #[must_use]
    pub fn peer_swap_input(&self) -> bool {
        self.peer.swap_input.unwrap_or(false)
    }

    /// Our own announced settings.
    #[must_use]
    pub fn local_settings(&self) -> &LocalSettings {
        &self.settings
    }

    /// Our own hello.
    #[must_use]
    pub fn local_hello(&self) -> &Hello {
        &self.local
    }
}

fn rejected(reason: impl Into<String>) -> NetplayError {
    NetplayError::HandshakeRejected {
        reason: reason.into(),
    }
}
