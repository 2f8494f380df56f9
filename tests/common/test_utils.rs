//! Shared test utilities for integration tests.
//!
//! Sessions here talk over in-memory transports unless a test says otherwise, so they run
//! deterministically in a single thread: each side only makes progress when the test calls
//! into it.

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netplay_rollback::network::memory::{memory_command_pair, memory_datagram_pair};
use netplay_rollback::{
    ChaosConfig, ChaosSocket, Frame, FrameInputs, NetplayEvent, NetplaySession, NullSink,
    P2PSession, Role, SessionBuilder, SessionState, SimulationBridge, StepStatus,
};

use super::stubs::GameStub;

/// Maximum iterations to wait for synchronization before giving up.
pub const MAX_SYNC_ITERATIONS: usize = 50;

/// Two sessions wired to each other, plus blackout switches for their datagram paths.
pub struct SessionPair {
    pub host: P2PSession<GameStub>,
    pub client: P2PSession<GameStub>,
    pub host_blackout: Arc<AtomicBool>,
    pub client_blackout: Arc<AtomicBool>,
}

impl SessionPair {
    /// Cuts (or restores) datagrams in both directions.
    pub fn set_blackout(&self, blackout: bool) {
        self.host_blackout.store(blackout, Ordering::Relaxed);
        self.client_blackout.store(blackout, Ordering::Relaxed);
    }
}

/// Builds a host and a client over in-memory transports, each datagram path wrapped in a
/// [`ChaosSocket`] with the given configuration.
pub fn chaos_sessions(
    host_bridge: GameStub,
    client_bridge: GameStub,
    host_builder: SessionBuilder,
    client_builder: SessionBuilder,
    host_chaos: ChaosConfig,
    client_chaos: ChaosConfig,
) -> SessionPair {
    let (host_cmd, client_cmd) = memory_command_pair();
    let (host_dgram, client_dgram) = memory_datagram_pair();
    let host_socket = ChaosSocket::new(host_dgram, host_chaos);
    let client_socket = ChaosSocket::new(client_dgram, client_chaos);
    let host_blackout = host_socket.blackout_switch();
    let client_blackout = client_socket.blackout_switch();
    let host = host_builder
        .start_p2p_session(host_bridge, host_cmd, host_socket, Role::Host)
        .unwrap();
    let client = client_builder
        .start_p2p_session(client_bridge, client_cmd, client_socket, Role::Client)
        .unwrap();
    SessionPair {
        host,
        client,
        host_blackout,
        client_blackout,
    }
}

/// Builds a host and a client over lossless in-memory transports.
pub fn memory_sessions(
    host_bridge: GameStub,
    client_bridge: GameStub,
    delay_frames: u32,
) -> SessionPair {
    chaos_sessions(
        host_bridge,
        client_bridge,
        SessionBuilder::new()
            .with_nickname("host")
            .with_delay_frames(delay_frames)
            .unwrap(),
        SessionBuilder::new().with_nickname("client"),
        ChaosConfig::passthrough(),
        ChaosConfig::passthrough(),
    )
}

/// Runs frames on both sides until both report `Synchronized`.
pub fn synchronize_sessions(
    host: &mut dyn NetplaySession<GameStub>,
    client: &mut dyn NetplaySession<GameStub>,
) {
    for _ in 0..MAX_SYNC_ITERATIONS {
        if host.state() == SessionState::Synchronized
            && client.state() == SessionState::Synchronized
        {
            return;
        }
        host.run_frame(&mut NullSink).unwrap();
        client.run_frame(&mut NullSink).unwrap();
    }
    panic!(
        "synchronization timed out: host {}, client {}",
        host.state(),
        client.state()
    );
}

/// Calls `run_frame` on both sessions `iterations` times.
pub fn run_both(
    host: &mut dyn NetplaySession<GameStub>,
    client: &mut dyn NetplaySession<GameStub>,
    iterations: usize,
) {
    for _ in 0..iterations {
        host.run_frame(&mut NullSink).unwrap();
        client.run_frame(&mut NullSink).unwrap();
    }
}

/// Runs both sessions until both report [`StepStatus::Paused`], returning how many
/// iterations that took.
pub fn run_until_paused(
    host: &mut dyn NetplaySession<GameStub>,
    client: &mut dyn NetplaySession<GameStub>,
    max_iterations: usize,
) -> usize {
    for i in 0..max_iterations {
        let host_status = host.run_frame(&mut NullSink).unwrap();
        let client_status = client.run_frame(&mut NullSink).unwrap();
        if host_status == StepStatus::Paused && client_status == StepStatus::Paused {
            // The last frames before the pause may still be in flight; paused sessions
            // keep folding them in.
            run_both(host, client, 3);
            return i;
        }
    }
    panic!(
        "sessions never paused: host at {}, client at {}",
        host.frame_count(),
        client.frame_count()
    );
}

/// Runs both sessions over an unreliable path, sleeping a little whenever either one could
/// not advance so that time-based resends get a chance to fire.
pub fn run_lossy(pair: &mut SessionPair, iterations: usize) {
    for _ in 0..iterations {
        let host_status = pair.host.run_frame(&mut NullSink).unwrap();
        let client_status = pair.client.run_frame(&mut NullSink).unwrap();
        if host_status != StepStatus::Ready || client_status != StepStatus::Ready {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Runs an unreliable pair until both sides stand on `pause` with every earlier frame
/// confirmed.
pub fn settle_at_pause(pair: &mut SessionPair, pause: Frame, max_iterations: usize) {
    for _ in 0..max_iterations {
        let settled = [&pair.host, &pair.client]
            .iter()
            .all(|s| s.frame_count() == pause && s.confirmed_frame() == pause);
        if settled {
            return;
        }
        run_lossy(pair, 1);
    }
    panic!(
        "never settled at {pause}: host {}/{}, client {}/{}",
        pair.host.frame_count(),
        pair.host.confirmed_frame(),
        pair.client.frame_count(),
        pair.client.confirmed_frame()
    );
}

/// Steps one frame by hand, returning the inputs it ran with when the session was ready.
pub fn step_once(session: &mut dyn NetplaySession<GameStub>) -> Option<FrameInputs> {
    if session.pre_step().unwrap() != StepStatus::Ready {
        return None;
    }
    let inputs = session.current_inputs();
    session.bridge_mut().step(&inputs, &mut NullSink);
    session.post_step().unwrap();
    Some(inputs)
}

/// Drains all events.
pub fn drain_events(session: &mut dyn NetplaySession<GameStub>) -> Vec<NetplayEvent> {
    session.events().collect()
}

/// A TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
