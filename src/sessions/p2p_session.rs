use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::Instant;

use crate::bridge::{FrameInputs, InputState, SimulationBridge};
use crate::network::handshake::{local_hello, Handshake, LocalSettings, Role};
use crate::network::messages::{CheatCode, Command, FramePacket};
use crate::network::network_stats::NetworkStats;
use crate::network::redundancy::RedundancyWindow;
use crate::report_violation_to;
use crate::sessions::config::ProtocolConfig;
use crate::sessions::event_drain::EventDrain;
use crate::sessions::session_trait::NetplaySession;
use crate::sessions::spectator::SpectatorHost;
use crate::sessions::state::{SessionState, Transitions};
use crate::sync_layer::{
    FinalizedFrame, PortMap, ReconcileOutcome, RollbackStats, SavestateOutcome, SyncLayer,
};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    CommandStream, DatagramSocket, DisconnectReason, Frame, NetplayError, NetplayEvent,
    StepStatus,
};

/// Maximum number of events to queue before oldest are dropped.
///
/// Keeps memory bounded when the application never drains events.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A command we sent that still waits for `Ack` or `Nak`.
///
/// The command stream is ordered and the peer answers in order, so every answer belongs
/// to the oldest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outstanding {
    Handshake(&'static str),
    Flip(Frame),
    Pause(Frame),
    Savestate(Frame),
    Notice(&'static str),
}

/// What the peer announced about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's nickname.
    pub nickname: String,
    /// Whether the peer polls its own physical port.
    pub swap_input: bool,
    /// Whether the peer only watches.
    pub spectating: bool,
    /// Input delay both sides agreed on.
    pub delay_frames: u32,
}

/// A [`P2PSession`] plays one simulation in lockstep with exactly one remote peer.
///
/// Remote input arrives over the [`DatagramSocket`] and is predicted until it does;
/// everything else (handshake, pause, flip, savestates) travels over the
/// [`CommandStream`]. The session owns the bridge for its whole life and hands it back
/// through [`disconnect`](Self::disconnect) or [`into_bridge`](Self::into_bridge).
pub struct P2PSession<B: SimulationBridge> {
    bridge: B,
    role: Role,
    config: ProtocolConfig,
    commands: Box<dyn CommandStream>,
    socket: Box<dyn DatagramSocket>,
    handshake: Handshake,
    /// Created once the delay is negotiated; its capacity depends on it.
    sync_layer: Option<SyncLayer>,
    window: RedundancyWindow,
    state: SessionState,
    /// The error every call returns once the session is over.
    terminal: Option<NetplayError>,
    transitions: Transitions,
    outstanding: VecDeque<Outstanding>,
    pending_savestate: Option<(Frame, Vec<u8>)>,
    /// `pre_step` returned `Ready` and `post_step` has not run yet.
    ready: bool,
    events: VecDeque<NetplayEvent>,
    stats: NetworkStats,
    stall_started: Option<Instant>,
    last_resend: Instant,
    spectators: Option<SpectatorHost>,
    finalized_from: Frame,
    finalized: Vec<FinalizedFrame>,
    peer_spectating: bool,
    state_size: usize,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<B: SimulationBridge> std::fmt::Debug for P2PSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("frame_count", &self.frame_count())
            .field("outstanding", &self.outstanding)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<B: SimulationBridge> P2PSession<B> {
    /// Creates the session and sends the opening handshake.
    pub(crate) fn new(
        mut bridge: B,
        role: Role,
        settings: LocalSettings,
        config: ProtocolConfig,
        commands: Box<dyn CommandStream>,
        socket: Box<dyn DatagramSocket>,
        mut spectators: Option<SpectatorHost>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Result<Self, NetplayError> {
        config.validate()?;
        if let Some(host) = spectators.as_mut() {
            host.set_violation_observer(violation_observer.clone());
        }
        let state_size = match bridge.state_size() {
            Some(size) if size > 0 => size,
            other => {
                return Err(NetplayError::UnsupportedBridge {
                    info: format!("bridge reported state size {other:?}"),
                })
            },
        };
        let now = Instant::now();
        let mut handshake = Handshake::new(
            role,
            local_hello(&bridge, state_size),
            settings,
            config.handshake_timeout,
            now,
        );
        let opening = handshake.opening(&mut bridge)?;

        let mut session = Self {
            bridge,
            role,
            config,
            commands,
            socket,
            handshake,
            sync_layer: None,
            window: RedundancyWindow::new(config.redundancy, 1),
            state: SessionState::Handshake,
            terminal: None,
            transitions: Transitions::default(),
            outstanding: VecDeque::new(),
            pending_savestate: None,
            ready: false,
            events: VecDeque::new(),
            stats: NetworkStats::new(),
            stall_started: None,
            last_resend: now,
            spectators,
            finalized_from: Frame::ZERO,
            finalized: Vec::new(),
            peer_spectating: false,
            state_size,
            violation_observer,
        };
        for command in opening {
            let name = command.name();
            session.send(&command, Some(Outstanding::Handshake(name)))?;
        }
        debug!(role = ?role, "handshake opened");
        Ok(session)
    }

    /// Prepares the next frame.
    ///
    /// Drives the handshake, applies agreed transitions, captures and sends local input,
    /// and folds in whatever remote input arrived. Step the simulation only on
    /// [`StepStatus::Ready`], with [`current_inputs`](Self::current_inputs), then call
    /// [`post_step`](Self::post_step).
    pub fn pre_step(&mut self) -> Result<StepStatus, NetplayError> {
        self.check_alive()?;
        if self.ready {
            return Err(NetplayError::InvalidRequest {
                info: "pre_step called twice without post_step".to_owned(),
            });
        }
        self.poll_commands()?;

        if self.state == SessionState::Handshake {
            if let Err(e) = self.handshake.check_timeout(Instant::now()) {
                return Err(self.fail(e));
            }
            return Ok(StepStatus::Handshaking);
        }

        let (can_poll, frame_count) = match &self.sync_layer {
            Some(sync) => (sync.can_poll(), sync.frame_count()),
            None => return Err(self.internal_failure("synchronized without a sync layer")),
        };

        if can_poll {
            if self.transitions.is_paused_at(frame_count) {
                // The peer may still be missing our last frames.
                self.resend_if_due(Instant::now());
                self.receive_packets();
                self.settle()?;
                self.try_apply_savestate()?;
                self.feed_spectators();
                if self.transitions.take_pause_report(frame_count) {
                    info!(frame = %frame_count, "paused");
                    self.push_event(NetplayEvent::Paused { frame: frame_count });
                }
                return Ok(StepStatus::Paused);
            }
            self.try_apply_savestate()?;
            self.arm()?;
        }

        self.receive_packets();

        let must_stall = self.sync_layer.as_ref().is_some_and(SyncLayer::must_stall);
        if must_stall {
            return self.on_stall(Instant::now());
        }
        self.end_stall();

        if let Some(sync) = self.sync_layer.as_mut() {
            sync.predict_current();
        }
        self.ready = true;
        Ok(StepStatus::Ready)
    }

    /// The inputs for the prepared frame.
    #[must_use]
    pub fn current_inputs(&self) -> FrameInputs {
        self.sync_layer
            .as_ref()
            .map_or(FrameInputs::idle(Frame::ZERO), SyncLayer::current_inputs)
    }

    /// Completes the frame the simulation just stepped: moves the trust frontier, replays
    /// mispredicted frames and streams finalized frames to spectators.
    pub fn post_step(&mut self) -> Result<(), NetplayError> {
        self.check_alive()?;
        if !self.ready {
            return Err(NetplayError::InvalidRequest {
                info: "post_step called without a ready frame".to_owned(),
            });
        }
        self.ready = false;
        let Some(sync) = self.sync_layer.as_mut() else {
            return Err(self.internal_failure("post_step without a sync layer"));
        };
        match sync.post_step(&mut self.bridge) {
            Ok(ReconcileOutcome::Replayed { skipped, depth }) => {
                debug!(skipped, depth, frame = %sync.frame_count(), "rolled back");
            },
            Ok(outcome) => trace!(?outcome, frame = %sync.frame_count(), "frame complete"),
            Err(e) => return Err(self.fail(e)),
        }
        let frame_count = sync.frame_count();
        if let Some(frame) = self.transitions.take_reached_flip(frame_count) {
            info!(frame = %frame, "ports flipped");
            self.push_event(NetplayEvent::Flipped { frame });
        }
        self.feed_spectators();
        Ok(())
    }

    /// Schedules a port flip `2 * K` frames ahead (K being the redundancy window length).
    ///
    /// Only the host may flip, and only while no other transition is pending.
    pub fn request_flip(&mut self) -> Result<Frame, NetplayError> {
        self.check_alive()?;
        if self.role != Role::Host {
            return Err(NetplayError::InvalidRequest {
                info: "only the host may flip players".to_owned(),
            });
        }
        let now = self.synchronized_frame()?;
        if self.transitions.pending(now) {
            return Err(transition_pending());
        }
        let frame = now + self.transition_lead();
        let scheduled = self
            .sync_layer
            .as_mut()
            .is_some_and(|sync| sync.ports_mut().schedule_flip(frame, now));
        if !scheduled {
            return Err(transition_pending());
        }
        self.transitions.note_flip(frame);
        self.send(&Command::FlipPlayers { frame }, Some(Outstanding::Flip(frame)))?;
        info!(frame = %frame, "flip scheduled");
        self.push_event(NetplayEvent::FlipScheduled { frame });
        Ok(frame)
    }

    /// Schedules a pause `2 * K` frames ahead. Either side may pause.
    pub fn request_pause(&mut self) -> Result<Frame, NetplayError> {
        self.check_alive()?;
        let now = self.synchronized_frame()?;
        let frame = now + self.transition_lead();
        if !self.transitions.schedule_pause(frame, now) {
            return Err(transition_pending());
        }
        self.send(&Command::Pause { frame }, Some(Outstanding::Pause(frame)))?;
        info!(frame = %frame, "pause scheduled");
        self.push_event(NetplayEvent::PauseScheduled { frame });
        Ok(frame)
    }

    /// Lifts a pause on both sides.
    pub fn request_resume(&mut self) -> Result<(), NetplayError> {
        self.check_alive()?;
        self.synchronized_frame()?;
        if !self.transitions.resume() {
            return Err(NetplayError::InvalidRequest {
                info: "no pause to resume from".to_owned(),
            });
        }
        self.send(&Command::Resume, Some(Outstanding::Notice("resume")))?;
        info!("resumed");
        self.push_event(NetplayEvent::Resumed);
        Ok(())
    }

    /// Sends the live state to the peer, which continues from it.
    ///
    /// Only possible between frames while every produced frame is confirmed, which holds
    /// reliably once both sides are paused.
    pub fn load_savestate(&mut self) -> Result<Frame, NetplayError> {
        self.check_alive()?;
        self.synchronized_frame()?;
        self.settle()?;
        let Some(sync) = self.sync_layer.as_ref() else {
            return Err(not_synchronized());
        };
        let (frame, state) = sync.capture_savestate(&mut self.bridge)?;
        self.send(
            &Command::LoadSavestate { frame, state },
            Some(Outstanding::Savestate(frame)),
        )?;
        info!(frame = %frame, "savestate sent");
        Ok(frame)
    }

    /// Tells the peer whether this side only watches from now on.
    pub fn set_spectate(&mut self, enabled: bool) -> Result<(), NetplayError> {
        self.check_alive()?;
        self.send(
            &Command::Spectate { enabled },
            Some(Outstanding::Notice("spectate")),
        )
    }

    /// Sends the cheat list to the peer.
    pub fn sync_cheats(&mut self, codes: Vec<CheatCode>) -> Result<(), NetplayError> {
        self.check_alive()?;
        self.send(&Command::Cheats(codes), Some(Outstanding::Notice("cheats")))
    }

    /// Ends the session with an orderly goodbye and returns the bridge.
    #[must_use]
    pub fn disconnect(mut self) -> B {
        if self.terminal.is_none() {
            // Best effort: the peer detects a hangup anyway.
            if self.commands.send_command(&Command::Disconnect).is_ok() {
                let _ = self.commands.flush_commands();
            }
            info!("disconnected");
        }
        self.bridge
    }

    /// Ends the session without notifying the peer and returns the bridge.
    #[must_use]
    pub fn into_bridge(self) -> B {
        self.bridge
    }

    /// Drains pending events.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.events.drain(..))
    }

    /// The simulation.
    #[must_use]
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// The simulation, for stepping it.
    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    /// This side's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// Frames produced so far.
    #[must_use]
    pub fn frame_count(&self) -> Frame {
        self.sync_layer
            .as_ref()
            .map_or(Frame::ZERO, SyncLayer::frame_count)
    }

    /// The trust frontier: every earlier frame ran with confirmed input.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer
            .as_ref()
            .map_or(Frame::ZERO, SyncLayer::other_frame)
    }

    /// The negotiated delay, once known.
    #[must_use]
    pub fn delay_frames(&self) -> Option<u32> {
        self.handshake.negotiated_delay()
    }

    /// The agreed pause frame, if one is armed.
    #[must_use]
    pub fn pause_frame(&self) -> Option<Frame> {
        self.transitions.pause_frame()
    }

    /// What the peer announced, once synchronized.
    #[must_use]
    pub fn peer_info(&self) -> Option<PeerInfo> {
        (self.state != SessionState::Handshake).then(|| PeerInfo {
            nickname: self.handshake.peer_nickname().to_owned(),
            swap_input: self.handshake.peer_swap_input(),
            spectating: self.peer_spectating,
            delay_frames: self.handshake.negotiated_delay().unwrap_or_default(),
        })
    }

    /// Rollback counters.
    #[must_use]
    pub fn rollback_stats(&self) -> RollbackStats {
        self.sync_layer
            .as_ref()
            .map(SyncLayer::stats)
            .unwrap_or_default()
    }

    /// Transport counters.
    #[must_use]
    pub fn network_stats(&self) -> NetworkStats {
        self.stats
    }

    /// Connected spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.spectators.as_ref().map_or(0, SpectatorHost::len)
    }

    /// The spectator listener's address, when spectators are enabled.
    #[must_use]
    pub fn spectator_addr(&self) -> Option<std::net::SocketAddr> {
        self.spectators
            .as_ref()
            .and_then(|host| host.local_addr().ok())
    }

    /// Returns a reference to the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    /// The rollback core, for inspection in tests and tools.
    #[doc(hidden)]
    #[must_use]
    pub fn sync_layer(&self) -> Option<&SyncLayer> {
        self.sync_layer.as_ref()
    }

    // ##########################
    // #  COMMAND STREAM        #
    // ##########################

    fn send(
        &mut self,
        command: &Command,
        outstanding: Option<Outstanding>,
    ) -> Result<(), NetplayError> {
        if let Err(e) = self.commands.send_command(command) {
            debug!(error = %e, command = command.name(), "command send failed");
            return Err(self.lose_connection(DisconnectReason::StreamClosed));
        }
        self.stats.commands_sent += 1;
        trace!(command = command.name(), "sent command");
        if let Some(outstanding) = outstanding {
            self.outstanding.push_back(outstanding);
        }
        Ok(())
    }

    fn reply(&mut self, accepted: bool) -> Result<(), NetplayError> {
        let answer = if accepted { Command::Ack } else { Command::Nak };
        self.send(&answer, None)
    }

    fn poll_commands(&mut self) -> Result<(), NetplayError> {
        if self.commands.flush_commands().is_err() {
            return Err(self.lose_connection(DisconnectReason::StreamClosed));
        }
        let received = match self.commands.receive_commands() {
            Ok(received) => received,
            Err(NetplayError::ConnectionLost { reason }) => return Err(self.lose_connection(reason)),
            Err(e) => {
                debug!(error = %e, "command stream failed");
                return Err(self.lose_connection(DisconnectReason::StreamClosed));
            },
        };
        for command in received {
            self.stats.commands_received += 1;
            trace!(command = command.name(), "received command");
            self.handle_command(command)?;
            if self.state == SessionState::Handshake && self.handshake.is_complete() {
                self.on_synchronized()?;
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<(), NetplayError> {
        match command {
            Command::Hello(hello) => {
                let result = self.handshake.on_hello(&hello);
                self.answer_handshake(result)
            },
            Command::Config(item) => match self.handshake.on_config(&item) {
                Ok(true) => {
                    self.reply(true)?;
                    self.push_event(NetplayEvent::PeerConfig(item));
                    Ok(())
                },
                Ok(false) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Configuration,
                        "peer re-announced {:?} after the handshake; keeping negotiated settings",
                        item
                    );
                    self.reply(true)
                },
                Err(e) => self.answer_handshake(Err(e)),
            },
            Command::InitialState { state } => {
                let result = self.handshake.on_initial_state(&state, &mut self.bridge);
                self.answer_handshake(result)
            },
            Command::Ack => self.on_answer(true),
            Command::Nak => self.on_answer(false),
            Command::FlipPlayers { frame } => self.on_flip(frame),
            Command::Pause { frame } => self.on_pause(frame),
            Command::Resume => {
                if self.transitions.resume() {
                    info!("peer resumed");
                    self.push_event(NetplayEvent::Resumed);
                }
                self.reply(true)
            },
            Command::LoadSavestate { frame, state } => self.on_savestate(frame, state),
            Command::Spectate { enabled } => {
                self.peer_spectating = enabled;
                self.push_event(NetplayEvent::PeerSpectating { enabled });
                self.reply(true)
            },
            Command::Cheats(codes) => {
                debug!(count = codes.len(), "peer sent cheats");
                self.push_event(NetplayEvent::CheatsReceived(codes));
                self.reply(true)
            },
            Command::Disconnect => {
                info!("peer disconnected");
                Err(self.lose_connection(DisconnectReason::PeerDisconnected))
            },
        }
    }

    /// Acks an accepted handshake command; naks a refused one and ends the session.
    fn answer_handshake(&mut self, result: Result<(), NetplayError>) -> Result<(), NetplayError> {
        match result {
            Ok(()) => self.reply(true),
            Err(e) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Handshake,
                    "refusing peer: {}",
                    e
                );
                let _ = self.reply(false);
                let _ = self.commands.flush_commands();
                Err(self.fail(e))
            },
        }
    }

    fn on_answer(&mut self, accepted: bool) -> Result<(), NetplayError> {
        let Some(outstanding) = self.outstanding.pop_front() else {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Command,
                "peer answered a command that was never sent"
            );
            return Ok(());
        };
        let now = self.frame_count();
        match (outstanding, accepted) {
            (Outstanding::Handshake(_), true) => self.handshake.on_ack(),
            (Outstanding::Handshake(name), false) => {
                if let Err(e) = self.handshake.on_nak(name) {
                    return Err(self.fail(e));
                }
            },
            (Outstanding::Flip(frame), false) => {
                let cancelled = self
                    .sync_layer
                    .as_mut()
                    .is_some_and(|sync| sync.ports_mut().cancel_flip(frame, now));
                if cancelled {
                    self.transitions.forget_flip(frame);
                    info!(frame = %frame, "peer refused flip");
                } else {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Command,
                        "peer refused flip at frame {} after it took effect",
                        frame
                    );
                }
            },
            (Outstanding::Pause(frame), false) => {
                if self.transitions.cancel_pause(frame, now) {
                    info!(frame = %frame, "peer refused pause");
                } else {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Command,
                        "peer refused pause at frame {} after it took effect",
                        frame
                    );
                }
            },
            (Outstanding::Savestate(frame), false) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Command,
                    "peer refused savestate for frame {}",
                    frame
                );
            },
            (Outstanding::Notice(name), false) => debug!(command = name, "peer refused command"),
            (_, true) => {},
        }
        Ok(())
    }

    fn on_flip(&mut self, frame: Frame) -> Result<(), NetplayError> {
        let now = self.frame_count();
        // The peer is the client when we host, and clients never flip.
        let accepted = self.role == Role::Client
            && frame >= now
            && !self.transitions.pending(now)
            && self
                .sync_layer
                .as_mut()
                .is_some_and(|sync| sync.ports_mut().schedule_flip(frame, now));
        if accepted {
            self.transitions.note_flip(frame);
            info!(frame = %frame, "peer scheduled flip");
            self.push_event(NetplayEvent::FlipScheduled { frame });
        } else {
            debug!(frame = %frame, now = %now, "refusing flip");
        }
        self.reply(accepted)
    }

    fn on_pause(&mut self, frame: Frame) -> Result<(), NetplayError> {
        let now = self.frame_count();
        let accepted = self.sync_layer.is_some() && self.transitions.schedule_pause(frame, now);
        if accepted {
            info!(frame = %frame, "peer scheduled pause");
            self.push_event(NetplayEvent::PauseScheduled { frame });
        } else {
            debug!(frame = %frame, now = %now, "refusing pause");
        }
        self.reply(accepted)
    }

    fn on_savestate(&mut self, frame: Frame, state: Vec<u8>) -> Result<(), NetplayError> {
        let accepted = match &self.sync_layer {
            Some(sync) => {
                let capacity = sync.capacity() as u32;
                state.len() == self.state_size
                    && frame <= sync.frame_count()
                    && frame + capacity > sync.frame_count()
                    && self.pending_savestate.is_none()
            },
            None => false,
        };
        if accepted {
            debug!(frame = %frame, "savestate received");
            self.pending_savestate = Some((frame, state));
        } else {
            debug!(frame = %frame, len = state.len(), "refusing savestate");
        }
        self.reply(accepted)
    }

    fn on_synchronized(&mut self) -> Result<(), NetplayError> {
        let Some(delay) = self.handshake.negotiated_delay() else {
            return Err(self.internal_failure("handshake completed without a delay"));
        };
        let capacity = delay as usize + 1;
        let mut sync =
            match SyncLayer::new(capacity, &self.bridge, PortMap::new(self.role.remote_port())) {
                Ok(sync) => sync,
                Err(e) => return Err(self.fail(e)),
            };
        sync.set_violation_observer(self.violation_observer.clone());
        self.sync_layer = Some(sync);
        self.window = RedundancyWindow::new(self.config.redundancy, capacity);
        self.state = SessionState::Synchronized;
        let peer = self.handshake.peer_nickname().to_owned();
        info!(peer = %peer, delay, role = ?self.role, "synchronized");
        self.push_event(NetplayEvent::Synchronized {
            peer,
            delay_frames: delay,
        });
        if self.role == Role::Client {
            // The host learns our datagram address from this.
            self.socket.send_packet(&FramePacket::empty());
            self.stats.packets_sent += 1;
        }
        Ok(())
    }

    // ##########################
    // #  FRAME STREAM          #
    // ##########################

    fn arm(&mut self) -> Result<(), NetplayError> {
        let settings = self.handshake.local_settings();
        let poll_port = if settings.swap_input {
            self.role.player_slot()
        } else {
            0
        };
        let bridge = &self.bridge;
        let local = InputState::capture(|device, index, id| {
            bridge.poll_input(poll_port, device, index, id)
        });
        let Some(sync) = self.sync_layer.as_mut() else {
            return Err(not_synchronized());
        };
        let frame = match sync.arm_frame(&mut self.bridge, local) {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(e)),
        };
        let sent = if frame == Frame::ZERO {
            InputState::NONE
        } else {
            local
        };
        self.window.push(frame, sent);
        self.socket.send_packet(self.window.packet());
        self.stats.packets_sent += 1;
        trace!(frame = %frame, "armed");
        Ok(())
    }

    fn receive_packets(&mut self) {
        let Some(sync) = self.sync_layer.as_mut() else {
            return;
        };
        for packet in self.socket.receive_packets() {
            self.stats.packets_received += 1;
            for entry in &packet.inputs {
                if sync.confirm_remote(entry.frame, entry.input) {
                    self.stats.inputs_accepted += 1;
                } else {
                    self.stats.inputs_ignored += 1;
                }
            }
        }
    }

    fn settle(&mut self) -> Result<(), NetplayError> {
        let Some(sync) = self.sync_layer.as_mut() else {
            return Ok(());
        };
        match sync.settle(&mut self.bridge) {
            Ok(ReconcileOutcome::Replayed { depth, .. }) => {
                debug!(depth, "rolled back between frames");
                Ok(())
            },
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn try_apply_savestate(&mut self) -> Result<(), NetplayError> {
        let Some((frame, state)) = self.pending_savestate.take() else {
            return Ok(());
        };
        let Some(sync) = self.sync_layer.as_mut() else {
            return Ok(());
        };
        match sync.apply_savestate(frame, &state, &mut self.bridge) {
            Ok(SavestateOutcome::Applied) => {
                info!(frame = %frame, "savestate loaded");
                self.push_event(NetplayEvent::SavestateLoaded { frame });
            },
            Ok(SavestateOutcome::Deferred) => self.pending_savestate = Some((frame, state)),
            Ok(SavestateOutcome::Rejected) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Command,
                    "acknowledged savestate for frame {} could not be applied",
                    frame
                );
            },
            Err(e) => return Err(self.fail(e)),
        }
        Ok(())
    }

    fn on_stall(&mut self, now: Instant) -> Result<StepStatus, NetplayError> {
        let started = match self.stall_started {
            Some(started) => started,
            None => {
                self.stall_started = Some(now);
                self.last_resend = now;
                self.stats.stalls += 1;
                debug!(frame = %self.frame_count(), "stalled waiting for remote input");
                now
            },
        };
        self.resend_if_due(now);
        self.stats.current_stall = now.duration_since(started);
        if self.stats.current_stall >= self.config.stall_timeout {
            let frame = self
                .sync_layer
                .as_ref()
                .map_or(Frame::ZERO, SyncLayer::read_frame);
            return Err(self.fail(NetplayError::StallTimeout { frame }));
        }
        Ok(StepStatus::Stalled)
    }

    fn resend_if_due(&mut self, now: Instant) {
        if self.window.is_empty()
            || now.duration_since(self.last_resend) < self.config.resend_interval
        {
            return;
        }
        self.socket.send_packet(self.window.packet());
        self.stats.packets_sent += 1;
        self.stats.resends += 1;
        self.last_resend = now;
    }

    fn end_stall(&mut self) {
        if let Some(started) = self.stall_started.take() {
            debug!(lasted_ms = started.elapsed().as_millis() as u64, "stall over");
        }
        self.stats.current_stall = web_time::Duration::ZERO;
    }

    fn feed_spectators(&mut self) {
        let (Some(host), Some(sync)) = (self.spectators.as_mut(), self.sync_layer.as_ref()) else {
            return;
        };
        self.finalized.clear();
        self.finalized_from = sync.collect_finalized(self.finalized_from, &mut self.finalized);
        host.broadcast(&self.finalized, &mut self.events);
        if host.poll_accept(&mut self.events) {
            match sync.trusted_state() {
                Some((frame, state)) => host.send_headers(frame, state, &mut self.events),
                None => {
                    let mut state = vec![0; self.state_size];
                    if self.bridge.serialize(&mut state) == Some(state.len()) {
                        host.send_headers(sync.frame_count(), &state, &mut self.events);
                    } else {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Error,
                            ViolationKind::Spectator,
                            "could not serialize state for new spectators"
                        );
                    }
                },
            }
        }
        self.trim_events();
    }

    // ##########################
    // #  LIFECYCLE             #
    // ##########################

    fn check_alive(&self) -> Result<(), NetplayError> {
        match &self.terminal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn synchronized_frame(&self) -> Result<Frame, NetplayError> {
        match (&self.sync_layer, self.state) {
            (Some(sync), SessionState::Synchronized) => Ok(sync.frame_count()),
            _ => Err(not_synchronized()),
        }
    }

    fn transition_lead(&self) -> u32 {
        2 * self.window.len() as u32
    }

    /// Marks the session as over because the connection went away.
    fn lose_connection(&mut self, reason: DisconnectReason) -> NetplayError {
        let err = NetplayError::ConnectionLost { reason };
        if self.terminal.is_none() {
            self.state = SessionState::Disconnected;
            self.terminal = Some(err.clone());
            self.push_event(NetplayEvent::Disconnected { reason });
        }
        err
    }

    /// Reports a broken internal invariant and ends the session over it.
    fn internal_failure(&mut self, context: &str) -> NetplayError {
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Critical,
            ViolationKind::InternalError,
            "{}",
            context
        );
        self.fail(internal(context))
    }

    /// Marks the session as over because of `err`, telling the peer when it is still there.
    fn fail(&mut self, err: NetplayError) -> NetplayError {
        if let NetplayError::ConnectionLost { reason } = err {
            return self.lose_connection(reason);
        }
        if self.terminal.is_none() {
            info!(error = %err, "session failed");
            if self.commands.send_command(&Command::Disconnect).is_ok() {
                let _ = self.commands.flush_commands();
            }
            self.state = SessionState::Disconnected;
            self.terminal = Some(err.clone());
            self.push_event(NetplayEvent::Disconnected {
                reason: DisconnectReason::LocalRequest,
            });
        }
        err
    }

    fn push_event(&mut self, event: NetplayEvent) {
        self.events.push_back(event);
        self.trim_events();
    }

    fn trim_events(&mut self) {
        while self.events.len() > MAX_EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
    }
}

impl<B: SimulationBridge> NetplaySession<B> for P2PSession<B> {
    fn pre_step(&mut self) -> Result<StepStatus, NetplayError> {
        Self::pre_step(self)
    }

    fn current_inputs(&self) -> FrameInputs {
        Self::current_inputs(self)
    }

    fn post_step(&mut self) -> Result<(), NetplayError> {
        Self::post_step(self)
    }

    fn bridge(&self) -> &B {
        &self.bridge
    }

    fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    fn events(&mut self) -> EventDrain<'_> {
        Self::events(self)
    }

    fn frame_count(&self) -> Frame {
        Self::frame_count(self)
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

fn not_synchronized() -> NetplayError {
    NetplayError::InvalidRequest {
        info: "the session is not synchronized".to_owned(),
    }
}

fn transition_pending() -> NetplayError {
    NetplayError::InvalidRequest {
        info: "another pause or flip is still pending".to_owned(),
    }
}

fn internal(context: &str) -> NetplayError {
    NetplayError::InvalidRequest {
        info: format!("internal error: {context}"),
    }
}

// Sessions live in a game loop and are commonly handed to another thread.
#[cfg(feature = "sync-send")]
const _: () = {
    const fn assert_send<T: Send>() {}
    struct Probe;
    impl SimulationBridge for Probe {
        fn state_size(&self) -> Option<usize> {
            None
        }
        fn serialize(&mut self, _buf: &mut [u8]) -> Option<usize> {
            None
        }
        fn deserialize(&mut self, _buf: &[u8]) -> bool {
            false
        }
        fn step(&mut self, _inputs: &FrameInputs, _sink: &mut dyn crate::OutputSink) {}
        fn poll_input(&self, _port: u32, _device: u32, _index: u32, _id: u32) -> i16 {
            0
        }
    }
    assert_send::<P2PSession<Probe>>();
};
