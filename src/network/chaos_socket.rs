//! A configurable datagram wrapper for fault injection.
//!
//! [`ChaosSocket`] wraps any [`DatagramSocket`] and loses, duplicates, reorders or delays
//! packets. Everything is driven by a seeded [`Pcg32`], and delay is counted in receive
//! polls rather than wall-clock time, so a scenario replays identically from its seed.
//!
//! # Example
//!
//! ```
//! use netplay_rollback::network::memory::memory_datagram_pair;
//! use netplay_rollback::{ChaosConfig, ChaosSocket};
//!
//! let (inner, _peer) = memory_datagram_pair();
//! let config = ChaosConfig::builder()
//!     .packet_loss_rate(0.05)
//!     .delay_polls(3)
//!     .seed(42)
//!     .build();
//! let socket = ChaosSocket::new(inner, config);
//! assert_eq!(socket.stats().packets_sent, 0);
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::network::messages::FramePacket;
use crate::rng::Pcg32;
use crate::DatagramSocket;

/// Fault-injection settings. Everything defaults to "no effect".
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Probability of dropping a packet on send.
    pub send_loss_rate: f64,
    /// Probability of dropping a packet on receive.
    pub receive_loss_rate: f64,
    /// Probability of sending a packet twice.
    pub duplication_rate: f64,
    /// Probability of swapping a received packet with its successor.
    pub reorder_rate: f64,
    /// Probability of starting a burst loss on send.
    pub burst_loss_probability: f64,
    /// Consecutive sends dropped per burst.
    pub burst_loss_length: usize,
    /// Zero-based indices of sends to drop, regardless of the rates.
    pub drop_sends: BTreeSet<u64>,
    /// Receive polls a packet is held back before delivery.
    pub delay_polls: u32,
    /// Seed for every random decision.
    pub seed: u64,
}

impl ChaosConfig {
    /// Creates a new builder for fluent configuration.
    #[must_use]
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::new()
    }

    /// No faults at all.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Symmetric random loss.
    #[must_use]
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self::builder().packet_loss_rate(loss_rate).seed(seed).build()
    }

    /// Loss, duplication, reordering and a few polls of delay.
    #[must_use]
    pub fn terrible_network(seed: u64) -> Self {
        Self::builder()
            .packet_loss_rate(0.15)
            .duplication_rate(0.02)
            .reorder_rate(0.1)
            .delay_polls(4)
            .seed(seed)
            .build()
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Creates a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets packet loss rate for both send and receive.
    #[must_use]
    pub fn packet_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets packet loss rate for sending only.
    #[must_use]
    pub fn send_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets packet loss rate for receiving only.
    #[must_use]
    pub fn receive_loss_rate(mut self, rate: f64) -> Self {
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the packet duplication rate.
    #[must_use]
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the reorder rate.
    #[must_use]
    pub fn reorder_rate(mut self, rate: f64) -> Self {
        self.config.reorder_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// When a burst is triggered (with `probability`), `length` consecutive sends are dropped.
    #[must_use]
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Drops the send with this zero-based index.
    #[must_use]
    pub fn drop_send(mut self, index: u64) -> Self {
        self.config.drop_sends.insert(index);
        self
    }

    /// Holds every received packet back for `polls` receive calls.
    #[must_use]
    pub fn delay_polls(mut self, polls: u32) -> Self {
        self.config.delay_polls = polls;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters of what the chaos socket did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Sends requested by the session.
    pub packets_sent: u64,
    /// Sends dropped by random loss.
    pub packets_dropped_send: u64,
    /// Sends dropped because their index was listed.
    pub packets_dropped_targeted: u64,
    /// Sends dropped by burst loss.
    pub packets_dropped_burst: u64,
    /// Bursts started.
    pub burst_loss_events: u64,
    /// Extra copies sent.
    pub packets_duplicated: u64,
    /// Packets handed to the session.
    pub packets_received: u64,
    /// Packets dropped on receive.
    pub packets_dropped_receive: u64,
    /// Adjacent swaps performed on receive.
    pub packets_reordered: u64,
}

/// A [`DatagramSocket`] that injects configurable faults.
pub struct ChaosSocket<S> {
    inner: S,
    config: ChaosConfig,
    rng: Pcg32,
    held: VecDeque<(u32, FramePacket)>,
    burst_loss_remaining: usize,
    blackout: Arc<AtomicBool>,
    stats: ChaosStats,
}

impl<S> std::fmt::Debug for ChaosSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosSocket")
            .field("config", &self.config)
            .field("held", &self.held.len())
            .field("blackout", &self.blackout.load(Ordering::Relaxed))
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<S: DatagramSocket> ChaosSocket<S> {
    /// Wraps `inner`.
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        Self {
            inner,
            rng: Pcg32::seed_from_u64(config.seed),
            config,
            held: VecDeque::new(),
            burst_loss_remaining: 0,
            blackout: Arc::new(AtomicBool::new(false)),
            stats: ChaosStats::default(),
        }
    }

    /// Returns a reference to the inner socket.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Consumes the chaos socket and returns the inner socket.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Returns statistics about chaos behavior.
    #[must_use]
    pub fn stats(&self) -> ChaosStats {
        self.stats
    }

    /// While set, every packet in both directions is lost.
    pub fn set_blackout(&self, blackout: bool) {
        self.blackout.store(blackout, Ordering::Relaxed);
    }

    /// A handle that toggles the blackout after the socket was moved into a session.
    #[must_use]
    pub fn blackout_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.blackout)
    }

    fn blacked_out(&self) -> bool {
        self.blackout.load(Ordering::Relaxed)
    }

    fn drop_on_send(&mut self, index: u64) -> bool {
        if self.blacked_out() {
            return true;
        }
        if self.config.drop_sends.contains(&index) {
            self.stats.packets_dropped_targeted += 1;
            return true;
        }
        if self.burst_loss_remaining > 0 {
            self.burst_loss_remaining -= 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        if self.config.burst_loss_length > 0 && self.rng.chance(self.config.burst_loss_probability)
        {
            self.stats.burst_loss_events += 1;
            self.burst_loss_remaining = self.config.burst_loss_length - 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        if self.rng.chance(self.config.send_loss_rate) {
            self.stats.packets_dropped_send += 1;
            return true;
        }
        false
    }

    fn send(&mut self, packet: &FramePacket) {
        let index = self.stats.packets_sent;
        self.stats.packets_sent += 1;
        if self.drop_on_send(index) {
            return;
        }
        self.inner.send_packet(packet);
        if self.rng.chance(self.config.duplication_rate) {
            self.stats.packets_duplicated += 1;
            self.inner.send_packet(packet);
        }
    }

    fn receive(&mut self) -> Vec<FramePacket> {
        for packet in self.inner.receive_packets() {
            if self.blacked_out() || self.rng.chance(self.config.receive_loss_rate) {
                self.stats.packets_dropped_receive += 1;
                continue;
            }
            self.held.push_back((self.config.delay_polls, packet));
        }

        let mut ready = Vec::new();
        while let Some((0, _)) = self.held.front() {
            if let Some((_, packet)) = self.held.pop_front() {
                ready.push(packet);
            }
        }
        for (polls, _) in &mut self.held {
            *polls = polls.saturating_sub(1);
        }

        for i in 1..ready.len() {
            if self.rng.chance(self.config.reorder_rate) {
                ready.swap(i - 1, i);
                self.stats.packets_reordered += 1;
            }
        }
        self.stats.packets_received += ready.len() as u64;
        ready
    }
}

#[cfg(feature = "sync-send")]
impl<S: DatagramSocket + Send> DatagramSocket for ChaosSocket<S> {
    fn send_packet(&mut self, packet: &FramePacket) {
        self.send(packet);
    }

    fn receive_packets(&mut self) -> Vec<FramePacket> {
        self.receive()
    }
}

#[cfg(not(feature = "sync-send"))]
impl<S: DatagramSocket> DatagramSocket for ChaosSocket<S> {
    fn send_packet(&mut self, packet: &FramePacket) {
        self.send(packet);
    }

    fn receive_packets(&mut self) -> Vec<FramePacket> {
        self.receive()
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
    use crate::network::memory::{memory_datagram_pair, MemoryDatagramSocket};
    use crate::network::messages::FrameInput;
    use crate::{Frame, InputState};

    fn packet(frame: u32) -> FramePacket {
        let mut packet = FramePacket::empty();
        packet.inputs.push(FrameInput {
            frame: Frame::new(frame),
            input: InputState::NONE,
        });
        packet
    }

    fn frames(packets: &[FramePacket]) -> Vec<u32> {
        packets
            .iter()
            .filter_map(FramePacket::last_frame)
            .map(Frame::as_u32)
            .collect()
    }

    fn pair(config: ChaosConfig) -> (ChaosSocket<MemoryDatagramSocket>, MemoryDatagramSocket) {
        let (a, b) = memory_datagram_pair();
        (ChaosSocket::new(a, config), b)
    }

    #[test]
    fn passthrough_changes_nothing() {
        let (mut chaos, mut peer) = pair(ChaosConfig::passthrough());
        for frame in 0..5 {
            chaos.send_packet(&packet(frame));
        }
        assert_eq!(frames(&peer.receive_packets()), vec![0, 1, 2, 3, 4]);
        assert_eq!(chaos.stats().packets_sent, 5);
    }

    #[test]
    fn targeted_drop_hits_exact_send() {
        let (mut chaos, mut peer) = pair(ChaosConfig::builder().drop_send(2).build());
        for frame in 0..5 {
            chaos.send_packet(&packet(frame));
        }
        assert_eq!(frames(&peer.receive_packets()), vec![0, 1, 3, 4]);
        assert_eq!(chaos.stats().packets_dropped_targeted, 1);
    }

    #[test]
    fn full_loss_drops_everything() {
        let (mut chaos, mut peer) = pair(ChaosConfig::lossy(1.0, 3));
        for frame in 0..10 {
            chaos.send_packet(&packet(frame));
        }
        assert!(peer.receive_packets().is_empty());
        assert_eq!(chaos.stats().packets_dropped_send, 10);
    }

    #[test]
    fn same_seed_same_losses() {
        let run = || {
            let (mut chaos, mut peer) = pair(ChaosConfig::lossy(0.3, 77));
            for frame in 0..100 {
                chaos.send_packet(&packet(frame));
            }
            frames(&peer.receive_packets())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn delay_counts_receive_polls() {
        let (mut peer, chaos_inner) = memory_datagram_pair();
        let mut chaos = ChaosSocket::new(chaos_inner, ChaosConfig::builder().delay_polls(2).build());
        peer.send_packet(&packet(9));
        assert!(chaos.receive_packets().is_empty());
        assert!(chaos.receive_packets().is_empty());
        assert_eq!(frames(&chaos.receive_packets()), vec![9]);
    }

    #[test]
    fn blackout_drops_both_directions() {
        let (mut peer, chaos_inner) = memory_datagram_pair();
        let mut chaos = ChaosSocket::new(chaos_inner, ChaosConfig::passthrough());
        let switch = chaos.blackout_switch();
        switch.store(true, std::sync::atomic::Ordering::Relaxed);
        chaos.send_packet(&packet(1));
        peer.send_packet(&packet(2));
        assert!(chaos.receive_packets().is_empty());
        assert!(peer.receive_packets().is_empty());
        chaos.set_blackout(false);
        peer.send_packet(&packet(3));
        assert_eq!(frames(&chaos.receive_packets()), vec![3]);
    }

    #[test]
    fn duplication_sends_twice() {
        let (mut chaos, mut peer) = pair(ChaosConfig::builder().duplication_rate(1.0).build());
        chaos.send_packet(&packet(4));
        assert_eq!(frames(&peer.receive_packets()), vec![4, 4]);
        assert_eq!(chaos.stats().packets_duplicated, 1);
    }
}
