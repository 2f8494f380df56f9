//! Read-only spectators.
//!
//! A [`SpectatorHost`] runs inside a playing session and streams every finalized frame to
//! the TCP clients it accepted. A client first receives a [`SpectatorMessage::Header`] with
//! the trusted snapshot the stream starts from, then batches of finalized inputs. A
//! [`SpectatorSession`] on the other end loads that snapshot and replays the inputs.
//!
//! Spectator failures never affect the game: a client whose stream breaks or falls too far
//! behind is dropped and reported as [`NetplayEvent::SpectatorLeft`].

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use crate::bridge::{FrameInputs, SimulationBridge};
use crate::network::handshake::implementation_magic;
use crate::network::messages::{truncate_nickname, SpectatorMessage};
use crate::network::tcp_stream::FramedStream;
use crate::report_violation_to;
use crate::sessions::event_drain::EventDrain;
use crate::sessions::session_trait::NetplaySession;
use crate::sync_layer::FinalizedFrame;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    DisconnectReason, Frame, NetplayError, NetplayEvent, SessionState, StepStatus,
    MAX_SPECTATORS,
};

/// A spectator that cannot drain this many queued bytes is dropped.
const MAX_SPECTATOR_BACKLOG: usize = 8 * 1024 * 1024;

/// What every header carries besides the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HostIdentity {
    nickname: String,
    implementation_magic: u32,
    content_crc: u32,
}

#[derive(Debug)]
struct SpectatorClient {
    addr: SocketAddr,
    stream: FramedStream<TcpStream>,
    nickname: Option<String>,
    /// Accepted but not sent a header yet.
    awaiting_header: bool,
}

/// Accepts spectators and streams finalized frames to them.
///
/// Everything here is non-blocking and driven from the owning session's step path.
pub struct SpectatorHost {
    listener: TcpListener,
    clients: Vec<SpectatorClient>,
    identity: HostIdentity,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SpectatorHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectatorHost")
            .field("listener", &self.listener)
            .field("clients", &self.clients)
            .field("identity", &self.identity)
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish()
    }
}

impl SpectatorHost {
    /// Listens on `0.0.0.0:port`. Headers will describe `bridge` and carry `nickname`.
    pub fn bind<B: SimulationBridge + ?Sized>(
        port: u16,
        nickname: &str,
        bridge: &B,
    ) -> Result<Self, NetplayError> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        Self::from_listener(listener, nickname, bridge)
    }

    /// Uses an already bound listener.
    pub fn from_listener<B: SimulationBridge + ?Sized>(
        listener: TcpListener,
        nickname: &str,
        bridge: &B,
    ) -> Result<Self, NetplayError> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            clients: Vec::new(),
            identity: HostIdentity {
                nickname: truncate_nickname(nickname),
                implementation_magic: implementation_magic(&bridge.core_info()),
                content_crc: bridge.content_crc(),
            },
            violation_observer: None,
        })
    }

    /// Routes spectator violations to `observer` instead of the tracing log.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.violation_observer = observer;
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetplayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Connected spectators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no spectator is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Nicknames spectators announced, in connection order.
    #[must_use]
    pub fn nicknames(&self) -> Vec<String> {
        self.clients.iter().filter_map(|c| c.nickname.clone()).collect()
    }

    /// Accepts every waiting connection. Returns whether any of them still needs a header,
    /// in which case the caller follows up with [`send_headers`](Self::send_headers).
    pub fn poll_accept(&mut self, events: &mut VecDeque<NetplayEvent>) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.clients.len() >= MAX_SPECTATORS {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Warning,
                            ViolationKind::Spectator,
                            "refusing spectator {}: already serving {}",
                            addr,
                            MAX_SPECTATORS
                        );
                        continue;
                    }
                    match FramedStream::from_tcp(stream) {
                        Ok(stream) => {
                            tracing::info!(%addr, "spectator joined");
                            self.clients.push(SpectatorClient {
                                addr,
                                stream,
                                nickname: None,
                                awaiting_header: true,
                            });
                            events.push_back(NetplayEvent::SpectatorJoined { addr });
                        },
                        Err(e) => tracing::debug!(%addr, error = %e, "could not set up spectator"),
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(error = %e, "spectator accept failed");
                    break;
                },
            }
        }
        self.clients.iter().any(|c| c.awaiting_header)
    }

    /// Sends the header to every newly accepted spectator. Their stream starts at `start_frame`,
    /// whose initial simulation state is `state`.
    pub fn send_headers(
        &mut self,
        start_frame: Frame,
        state: &[u8],
        events: &mut VecDeque<NetplayEvent>,
    ) {
        let header = SpectatorMessage::Header {
            nickname: self.identity.nickname.clone(),
            implementation_magic: self.identity.implementation_magic,
            content_crc: self.identity.content_crc,
            start_frame,
            state: state.to_vec(),
        };
        for client in self.clients.iter_mut().filter(|c| c.awaiting_header) {
            client.awaiting_header = false;
            if let Err(e) = client.stream.send(&header) {
                tracing::debug!(addr = %client.addr, error = %e, "spectator header failed");
            }
        }
        self.drop_broken(events);
    }

    /// Streams `frames` to every spectator that already has its header, and reads whatever
    /// spectators sent. Broken or hopelessly slow spectators are dropped.
    pub fn broadcast(&mut self, frames: &[FinalizedFrame], events: &mut VecDeque<NetplayEvent>) {
        let batch = (!frames.is_empty()).then(|| SpectatorMessage::Inputs(frames.to_vec()));
        for client in &mut self.clients {
            if client.awaiting_header {
                continue;
            }
            if let Some(batch) = &batch {
                if let Err(e) = client.stream.send(batch) {
                    tracing::debug!(addr = %client.addr, error = %e, "spectator send failed");
                }
            } else if let Err(e) = client.stream.flush() {
                tracing::debug!(addr = %client.addr, error = %e, "spectator flush failed");
            }
        }
        self.drop_broken(events);
    }

    fn drop_broken(&mut self, events: &mut VecDeque<NetplayEvent>) {
        self.clients.retain_mut(|client| {
            let alive = match client.stream.receive::<SpectatorMessage>() {
                Ok(messages) => {
                    for message in messages {
                        if let SpectatorMessage::Hello { nickname } = message {
                            tracing::debug!(addr = %client.addr, %nickname, "spectator hello");
                            client.nickname = Some(truncate_nickname(&nickname));
                        }
                    }
                    client.stream.pending_bytes() <= MAX_SPECTATOR_BACKLOG
                },
                Err(_) => false,
            };
            if !alive {
                tracing::info!(addr = %client.addr, "spectator left");
                events.push_back(NetplayEvent::SpectatorLeft { addr: client.addr });
            }
            alive
        });
    }
}

/// Plays back a stream of finalized frames from a [`SpectatorHost`].
///
/// The session contributes no input. [`pre_step`](NetplaySession::pre_step) reports
/// [`StepStatus::Handshaking`] until the header arrived and [`StepStatus::Stalled`] whenever
/// the next frame has not.
pub struct SpectatorSession<B: SimulationBridge> {
    bridge: B,
    stream: FramedStream<TcpStream>,
    state: SessionState,
    frame_count: Frame,
    queue: VecDeque<FrameInputs>,
    events: VecDeque<NetplayEvent>,
    host_nickname: String,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<B: SimulationBridge> std::fmt::Debug for SpectatorSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectatorSession")
            .field("state", &self.state)
            .field("frame_count", &self.frame_count)
            .field("frames_behind", &self.queue.len())
            .field("host_nickname", &self.host_nickname)
            .finish_non_exhaustive()
    }
}

impl<B: SimulationBridge> SpectatorSession<B> {
    /// Connects to a spectator host at `addr`.
    pub fn connect(bridge: B, addr: SocketAddr, nickname: &str) -> Result<Self, NetplayError> {
        let stream = TcpStream::connect(addr)?;
        Self::new(bridge, FramedStream::from_tcp(stream)?, nickname)
    }

    /// Wraps an established connection and introduces itself with `nickname`.
    pub fn new(
        bridge: B,
        mut stream: FramedStream<TcpStream>,
        nickname: &str,
    ) -> Result<Self, NetplayError> {
        stream.send(&SpectatorMessage::Hello {
            nickname: truncate_nickname(nickname),
        })?;
        Ok(Self {
            bridge,
            stream,
            state: SessionState::Handshake,
            frame_count: Frame::ZERO,
            queue: VecDeque::new(),
            events: VecDeque::new(),
            host_nickname: String::new(),
            violation_observer: None,
        })
    }

    /// Routes violations in the received stream to `observer` instead of the tracing log.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.violation_observer = observer;
    }

    /// The host's nickname, empty until the header arrived.
    #[must_use]
    pub fn host_nickname(&self) -> &str {
        &self.host_nickname
    }

    /// Frames received but not played yet.
    #[must_use]
    pub fn frames_behind(&self) -> usize {
        self.queue.len()
    }

    /// Ends the session and returns the bridge.
    #[must_use]
    pub fn into_bridge(self) -> B {
        self.bridge
    }

    fn lose_connection(&mut self, reason: DisconnectReason) -> NetplayError {
        if self.state != SessionState::Disconnected {
            self.state = SessionState::Disconnected;
            self.events.push_back(NetplayEvent::Disconnected { reason });
        }
        NetplayError::ConnectionLost { reason }
    }

    fn on_message(&mut self, message: SpectatorMessage) -> Result<(), NetplayError> {
        match message {
            SpectatorMessage::Header {
                nickname,
                implementation_magic: magic,
                content_crc,
                start_frame,
                state,
            } => {
                if self.state != SessionState::Handshake {
                    return Err(rejected("host sent a second header"));
                }
                let local_magic = implementation_magic(&self.bridge.core_info());
                if magic != local_magic {
                    return Err(rejected(format!(
                        "implementation magic {magic:#010x} does not match {local_magic:#010x}"
                    )));
                }
                let local_crc = self.bridge.content_crc();
                if content_crc != 0 && local_crc != 0 && content_crc != local_crc {
                    return Err(rejected(format!(
                        "content checksum {content_crc:#010x} does not match {local_crc:#010x}"
                    )));
                }
                if self.bridge.state_size() != Some(state.len()) {
                    return Err(rejected(format!(
                        "state of {} bytes does not fit this simulation",
                        state.len()
                    )));
                }
                if !self.bridge.deserialize(&state) {
                    return Err(NetplayError::StateTransfer {
                        frame: start_frame,
                        context: "bridge rejected the spectator header state".to_owned(),
                    });
                }
                self.frame_count = start_frame;
                self.host_nickname = nickname;
                self.state = SessionState::Synchronized;
                tracing::info!(host = %self.host_nickname, frame = %start_frame, "spectating");
                self.events.push_back(NetplayEvent::Synchronized {
                    peer: self.host_nickname.clone(),
                    delay_frames: 0,
                });
            },
            SpectatorMessage::Inputs(frames) => {
                if self.state != SessionState::Synchronized {
                    return Err(rejected("inputs arrived before the header"));
                }
                for inputs in frames {
                    let expected = self.frame_count + self.queue.len() as u32;
                    if inputs.frame != expected {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Error,
                            ViolationKind::Spectator,
                            "spectator stream skipped from frame {} to {}",
                            expected,
                            inputs.frame
                        );
                        return Err(NetplayError::ConnectionLost {
                            reason: DisconnectReason::StreamClosed,
                        });
                    }
                    self.queue.push_back(inputs);
                }
            },
            SpectatorMessage::Hello { .. } => {
                tracing::debug!("ignoring hello from spectator host");
            },
        }
        Ok(())
    }
}

impl<B: SimulationBridge> NetplaySession<B> for SpectatorSession<B> {
    fn pre_step(&mut self) -> Result<StepStatus, NetplayError> {
        if self.state == SessionState::Disconnected {
            return Err(NetplayError::ConnectionLost {
                reason: DisconnectReason::StreamClosed,
            });
        }
        let messages = match self.stream.receive::<SpectatorMessage>() {
            Ok(messages) => messages,
            Err(NetplayError::ConnectionLost { reason }) => return Err(self.lose_connection(reason)),
            Err(e) => {
                self.lose_connection(DisconnectReason::StreamClosed);
                return Err(e);
            },
        };
        for message in messages {
            if let Err(e) = self.on_message(message) {
                if let NetplayError::HandshakeRejected { reason } = &e {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Handshake,
                        "spectator header rejected: {}",
                        reason
                    );
                }
                self.lose_connection(DisconnectReason::StreamClosed);
                return Err(e);
            }
        }
        Ok(match self.state {
            SessionState::Handshake => StepStatus::Handshaking,
            _ if self.queue.is_empty() => StepStatus::Stalled,
            _ => StepStatus::Ready,
        })
    }

    fn current_inputs(&self) -> FrameInputs {
        self.queue
            .front()
            .copied()
            .unwrap_or_else(|| FrameInputs::idle(self.frame_count))
    }

    fn post_step(&mut self) -> Result<(), NetplayError> {
        if self.queue.pop_front().is_none() {
            return Err(NetplayError::InvalidRequest {
                info: "post_step without a played frame".to_owned(),
            });
        }
        self.frame_count += 1;
        Ok(())
    }

    fn bridge(&self) -> &B {
        &self.bridge
    }

    fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.events.drain(..))
    }

    fn frame_count(&self) -> Frame {
        self.frame_count
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

fn rejected(reason: impl Into<String>) -> NetplayError {
    NetplayError::HandshakeRejected {
        reason: reason.into(),
    }
}
