//! A headless netplay session around a tiny counting simulation.
//!
//! Start a host, then a client (and optionally spectators) in other terminals:
//!
//! ```text
//! cargo run --example netplay_counter -- --port 7000
//! cargo run --example netplay_counter -- --peer 127.0.0.1:7000 --port 0
//! cargo run --example netplay_counter -- --spectate --port 7001
//! cargo run --example netplay_counter -- --spectate --peer 127.0.0.1:7001 --port 0
//! ```
//!
//! Every five seconds of play each side logs its frame and state hash; once a frame is
//! confirmed, its hash is the same on every peer and spectator.

use clap::Parser;
use netplay_rollback::{
    create_session, FrameInputs, NetplaySession, OutputSink, SimulationBridge, StepStatus,
    DEVICE_JOYPAD,
};
use std::net::SocketAddr;
use tracing::info;
use web_time::{Duration, Instant};

const FPS: u32 = 60;

#[derive(Parser)]
struct Opt {
    /// TCP/UDP port to listen on (hosts and broadcasters).
    #[arg(short, long)]
    port: u16,
    /// Address of the host (or broadcaster) to join.
    #[arg(long)]
    peer: Option<SocketAddr>,
    /// Broadcast (without `--peer`) or watch (with `--peer`) instead of playing.
    #[arg(long)]
    spectate: bool,
    /// Input delay frames.
    #[arg(short, long, default_value_t = 2)]
    delay: u32,
    /// Frames to play before stopping.
    #[arg(short, long, default_value_t = 1_200)]
    frames: u32,
    #[arg(short, long, default_value = "anon")]
    nickname: String,
}

/// Hashes every input it is stepped with. The local pad walks through the buttons, one per
/// second.
#[derive(Default)]
struct Counter {
    frame: u32,
    hash: u64,
}

impl SimulationBridge for Counter {
    fn state_size(&self) -> Option<usize> {
        Some(12)
    }

    fn serialize(&mut self, buf: &mut [u8]) -> Option<usize> {
        let (frame, hash) = buf.split_at_mut(4);
        frame.copy_from_slice(&self.frame.to_le_bytes());
        hash.copy_from_slice(&self.hash.to_le_bytes());
        Some(12)
    }

    fn deserialize(&mut self, buf: &[u8]) -> bool {
        let (Some(frame), Some(hash)) = (buf.get(..4), buf.get(4..12)) else {
            return false;
        };
        let (Ok(frame), Ok(hash)) = (frame.try_into(), hash.try_into()) else {
            return false;
        };
        self.frame = u32::from_le_bytes(frame);
        self.hash = u64::from_le_bytes(hash);
        true
    }

    fn step(&mut self, inputs: &FrameInputs, sink: &mut dyn OutputSink) {
        for port in &inputs.ports {
            for word in port.words() {
                self.hash = (self.hash ^ u64::from(word)).wrapping_mul(0x0100_0000_01b3);
            }
        }
        self.frame += 1;
        if sink.is_live() && self.frame % (FPS * 5) == 0 {
            info!(frame = self.frame, hash = format_args!("{:016x}", self.hash), "tick");
        }
    }

    fn poll_input(&self, _port: u32, device: u32, _index: u32, id: u32) -> i16 {
        i16::from(device == DEVICE_JOYPAD && id == (self.frame / FPS) % 12)
    }
}

/// Presents nothing, but unlike replays it is live.
struct Headless;

impl OutputSink for Headless {}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // configure logging: output netplay and demo logs to standard out
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .finish(),
    )?;

    let opt = Opt::parse();
    let mut session = create_session(
        opt.peer,
        opt.port,
        opt.delay,
        Counter::default(),
        opt.spectate,
        &opt.nickname,
    )?;

    let frame_time = Duration::from_secs(1) / FPS;
    let mut next_frame = Instant::now();
    while session.frame_count().as_u32() < opt.frames {
        if session.run_frame(&mut Headless)? == StepStatus::Stalled {
            tracing::debug!(frame = %session.frame_count(), "waiting on the network");
        }
        for event in session.events() {
            info!(?event, "netplay event");
        }

        next_frame += frame_time;
        let now = Instant::now();
        if next_frame > now {
            std::thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }
    }

    let bridge = session.bridge();
    info!(
        frame = bridge.frame,
        hash = format_args!("{:016x}", bridge.hash),
        "done"
    );
    Ok(())
}
