use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use tracing::info;

use crate::network::handshake::LocalSettings;
use crate::network::messages::truncate_nickname;
use crate::network::tcp_stream::FramedStream;
use crate::network::udp_socket::UdpDatagramSocket;
use crate::sessions::broadcast::BroadcastSession;
use crate::sessions::p2p_session::P2PSession;
use crate::sessions::session_trait::NetplaySession;
use crate::sessions::spectator::{SpectatorHost, SpectatorSession};
use crate::telemetry::ViolationObserver;
use crate::{CommandStream, DatagramSocket, NetplayError, SimulationBridge, MAX_DELAY_FRAMES};

pub use crate::network::handshake::Role;
pub use crate::sessions::config::ProtocolConfig;

const DEFAULT_DELAY_FRAMES: u32 = 0;
const DEFAULT_NICKNAME: &str = "anon";

/// The [`SessionBuilder`] builds all session types.
///
/// Set your preferred values with the `with_*` methods, then consume the builder with one
/// of the `start_*` methods. All settings are optional.
#[must_use = "SessionBuilder must be consumed by calling a start_* method"]
#[derive(Clone)]
pub struct SessionBuilder {
    /// Input delay frames this side asks for. The larger request of both peers wins.
    delay_frames: u32,
    nickname: String,
    /// Poll the physical port matching our player slot instead of port 0.
    swap_input: bool,
    protocol_config: ProtocolConfig,
    /// TCP port for spectators of a two-player session. `None` disables fan-out.
    spectator_port: Option<u16>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            delay_frames,
            nickname,
            swap_input,
            protocol_config,
            spectator_port,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("delay_frames", delay_frames)
            .field("nickname", nickname)
            .field("swap_input", swap_input)
            .field("protocol_config", protocol_config)
            .field("spectator_port", spectator_port)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            delay_frames: DEFAULT_DELAY_FRAMES,
            nickname: DEFAULT_NICKNAME.to_owned(),
            swap_input: false,
            protocol_config: ProtocolConfig::default(),
            spectator_port: None,
            violation_observer: None,
        }
    }

    /// Sets the input delay this side asks for. Both peers run with the larger request.
    ///
    /// A larger delay hides more latency without rollback but makes input feel sluggish.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`] if `delay_frames` exceeds [`MAX_DELAY_FRAMES`].
    ///
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn with_delay_frames(mut self, delay_frames: u32) -> Result<Self, NetplayError> {
        if delay_frames > MAX_DELAY_FRAMES {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "delay of {delay_frames} frames exceeds the maximum of {MAX_DELAY_FRAMES}"
                ),
            });
        }
        self.delay_frames = delay_frames;
        Ok(self)
    }

    /// Sets the nickname announced to the peer and to spectators. Long names are truncated.
    pub fn with_nickname(mut self, nickname: &str) -> Self {
        self.nickname = truncate_nickname(nickname);
        self
    }

    /// Polls the physical port matching this side's player slot instead of port 0.
    pub fn with_swap_input(mut self, swap_input: bool) -> Self {
        self.swap_input = swap_input;
        self
    }

    /// Sets the protocol timing configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use netplay_rollback::{ProtocolConfig, SessionBuilder};
    ///
    /// let builder = SessionBuilder::new().with_protocol_config(ProtocolConfig::competitive());
    /// ```
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Streams the finalized frames of a two-player session to spectators connecting on `port`.
    pub fn with_spectator_port(mut self, port: u16) -> Self {
        self.spectator_port = Some(port);
        self
    }

    /// Sets a custom observer for invariant violations.
    ///
    /// Without one, violations are logged through `tracing`.
    ///
    /// ```
    /// use netplay_rollback::{SessionBuilder, telemetry::CollectingObserver};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new().with_violation_observer(observer.clone());
    ///
    /// // After session operations, check for violations
    /// // assert!(observer.violations().is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder to construct a [`P2PSession`] over already established transports
    /// and sends the opening handshake.
    ///
    /// # Errors
    /// - [`UnsupportedBridge`] if the bridge cannot report a fixed state size.
    /// - [`InvalidRequest`] if the protocol configuration is invalid.
    /// - Whatever binding the spectator port or sending the handshake fails with.
    ///
    /// [`UnsupportedBridge`]: NetplayError::UnsupportedBridge
    /// [`InvalidRequest`]: NetplayError::InvalidRequest
    pub fn start_p2p_session<B: SimulationBridge>(
        self,
        bridge: B,
        commands: impl CommandStream + 'static,
        socket: impl DatagramSocket + 'static,
        role: Role,
    ) -> Result<P2PSession<B>, NetplayError> {
        self.protocol_config.validate()?;
        let spectators = match self.spectator_port {
            Some(port) => Some(SpectatorHost::bind(port, &self.nickname, &bridge)?),
            None => None,
        };
        P2PSession::new(
            bridge,
            role,
            LocalSettings {
                nickname: self.nickname,
                swap_input: self.swap_input,
                delay_frames: self.delay_frames,
            },
            self.protocol_config,
            Box::new(commands),
            Box::new(socket),
            spectators,
            self.violation_observer,
        )
    }

    /// Waits for a client on TCP `port`, then starts the host side of a [`P2PSession`].
    ///
    /// Blocks until a client connects. Datagrams use UDP on the same port; the client's
    /// address is learned from its first packet.
    pub fn host_p2p_session<B: SimulationBridge>(
        self,
        bridge: B,
        port: u16,
    ) -> Result<P2PSession<B>, NetplayError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        let mut socket = UdpDatagramSocket::bind_to_port(port)?;
        socket.set_violation_observer(self.violation_observer.clone());
        info!(port, "waiting for a netplay client");
        let (stream, addr) = listener.accept()?;
        info!(%addr, "netplay client connected");
        self.start_p2p_session(bridge, FramedStream::from_tcp(stream)?, socket, Role::Host)
    }

    /// Connects to the host at `host_addr` and starts the client side of a [`P2PSession`].
    pub fn join_p2p_session<B: SimulationBridge>(
        self,
        bridge: B,
        host_addr: SocketAddr,
    ) -> Result<P2PSession<B>, NetplayError> {
        let stream = TcpStream::connect(host_addr)?;
        let mut socket = UdpDatagramSocket::connect(0, host_addr)?;
        socket.set_violation_observer(self.violation_observer.clone());
        info!(%host_addr, "connected to netplay host");
        self.start_p2p_session(bridge, FramedStream::from_tcp(stream)?, socket, Role::Client)
    }

    /// Consumes the builder to create a [`SpectatorSession`] watching the host at `host_addr`.
    pub fn start_spectator_session<B: SimulationBridge>(
        self,
        bridge: B,
        host_addr: SocketAddr,
    ) -> Result<SpectatorSession<B>, NetplayError> {
        let mut session = SpectatorSession::connect(bridge, host_addr, &self.nickname)?;
        session.set_violation_observer(self.violation_observer);
        Ok(session)
    }

    /// Consumes the builder to create a [`BroadcastSession`]: local play streamed to
    /// spectators connecting on TCP `port`.
    pub fn start_broadcast_session<B: SimulationBridge>(
        self,
        bridge: B,
        port: u16,
    ) -> Result<BroadcastSession<B>, NetplayError> {
        let host = SpectatorHost::bind(port, &self.nickname, &bridge)?;
        info!(port, "broadcasting to spectators");
        BroadcastSession::new(bridge, host, self.violation_observer)
    }
}

/// Creates whichever session the arguments describe:
///
/// | `peer` | `spectate` | Session |
/// |--------|:-:|---------|
/// | `None` | `false` | host of a [`P2PSession`], blocking until a client connects on `port` |
/// | `Some(addr)` | `false` | client of a [`P2PSession`] hosted at `addr` |
/// | `None` | `true` | [`BroadcastSession`] serving spectators on `port` |
/// | `Some(addr)` | `true` | [`SpectatorSession`] watching `addr` |
///
/// Call [`NetplaySession::pre_step`] and [`NetplaySession::post_step`] around every frame,
/// or [`NetplaySession::run_frame`]. Drop the session to destroy it.
///
/// # Errors
/// Fails when `delay_frames` is out of range, the bridge has no fixed state size, or the
/// connection cannot be established.
pub fn create_session<B: SimulationBridge + 'static>(
    peer: Option<SocketAddr>,
    port: u16,
    delay_frames: u32,
    bridge: B,
    spectate: bool,
    nickname: &str,
) -> Result<Box<dyn NetplaySession<B>>, NetplayError> {
    let builder = SessionBuilder::new()
        .with_delay_frames(delay_frames)?
        .with_nickname(nickname);
    Ok(match (peer, spectate) {
        (None, false) => Box::new(builder.host_p2p_session(bridge, port)?),
        (Some(addr), false) => Box::new(builder.join_p2p_session(bridge, addr)?),
        (None, true) => Box::new(builder.start_broadcast_session(bridge, port)?),
        (Some(addr), true) => Box::new(builder.start_spectator_session(bridge, addr)?),
    })
}
