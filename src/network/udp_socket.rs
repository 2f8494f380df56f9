use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::Arc,
};

use crate::network::codec;
use crate::network::messages::FramePacket;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::DatagramSocket;

const RECV_BUFFER_SIZE: usize = 4096;
/// Size of the pre-allocated send buffer. A full redundancy window of 34 frames fits easily.
const SEND_BUFFER_SIZE: usize = 1024;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP socket talking to exactly one peer.
///
/// The host binds without knowing the client and adopts the source address of the first
/// datagram it receives; the client is created with the host's address. Once the peer is
/// known, datagrams from any other address are ignored.
///
/// # Performance
///
/// Both directions use preallocated buffers, so the per-frame path does not allocate
/// except for the returned packet list.
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    send_buffer: [u8; SEND_BUFFER_SIZE],
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    oversize_reported: bool,
}

impl std::fmt::Debug for UdpDatagramSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpDatagramSocket")
            .field("socket", &self.socket)
            .field("peer", &self.peer)
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl UdpDatagramSocket {
    /// Binds to `0.0.0.0:port` in non-blocking mode. The peer is learned from the first datagram.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer: None,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: [0; SEND_BUFFER_SIZE],
            violation_observer: None,
            oversize_reported: false,
        })
    }

    /// Routes transport violations to `observer` instead of the tracing log.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.violation_observer = observer;
    }

    /// Binds to `0.0.0.0:port` and talks to `peer` from the start.
    pub fn connect(port: u16, peer: SocketAddr) -> Result<Self, std::io::Error> {
        let mut socket = Self::bind_to_port(port)?;
        socket.peer = Some(peer);
        Ok(socket)
    }

    /// The peer's address, once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Reports the first packet above the fragmentation threshold. A large window makes
    /// every later packet just as large, so repeating the warning adds nothing.
    fn note_packet_size(&mut self, len: usize) {
        if len <= IDEAL_MAX_UDP_PACKET_SIZE || self.oversize_reported {
            return;
        }
        self.oversize_reported = true;
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "Sending UDP packet of size {} bytes, which is larger than ideal ({}); further oversized packets are not reported",
            len,
            IDEAL_MAX_UDP_PACKET_SIZE
        );
    }

    fn send_encoded_packet(&self, buf: &[u8], addr: SocketAddr) {
        // Best effort: a later packet repeats everything this one carried.
        if let Err(e) = self.socket.send_to(buf, addr) {
            tracing::trace!(%addr, error = %e, "datagram send failed");
        }
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_packet(&mut self, packet: &FramePacket) {
        let Some(addr) = self.peer else {
            tracing::trace!("peer address not known yet, dropping datagram");
            return;
        };
        match codec::encode_into(packet, &mut self.send_buffer) {
            Ok(len) => {
                self.note_packet_size(len);
                let buf = self.send_buffer.get(..len).unwrap_or_default();
                self.send_encoded_packet(buf, addr);
            },
            Err(_) => match codec::encode(packet) {
                Ok(buf) => {
                    self.note_packet_size(buf.len());
                    self.send_encoded_packet(&buf, addr);
                },
                Err(e) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "Failed to serialize frame packet: {}",
                        e
                    );
                },
            },
        }
    }

    fn receive_packets(&mut self) -> Vec<FramePacket> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, src_addr)) => {
                    match self.peer {
                        None => {
                            tracing::debug!(peer = %src_addr, "learned datagram peer address");
                            self.peer = Some(src_addr);
                        },
                        Some(peer) if peer != src_addr => {
                            tracing::trace!(%src_addr, "ignoring datagram from unknown address");
                            continue;
                        },
                        Some(_) => {},
                    }
                    let Some(bytes) = self.recv_buffer.get(..len) else {
                        continue;
                    };
                    match codec::decode_value(bytes) {
                        Ok(packet) => received.push(packet),
                        Err(e) => tracing::trace!(error = %e, "dropping undecodable datagram"),
                    }
                },
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram socket sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                },
            }
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
    use crate::network::messages::FrameInput;
    use crate::{Frame, InputState};

    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for_packets(socket: &mut UdpDatagramSocket, expected: usize) -> Vec<FramePacket> {
        let mut all = Vec::new();
        for _ in 0..20 {
            all.extend(socket.receive_packets());
            if all.len() >= expected {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all
    }

    // Sockets bind to 0.0.0.0, which cannot be used as a destination on every platform.
    #[cfg(not(miri))]
    fn loopback(socket: &UdpDatagramSocket) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket.local_addr().unwrap().port(),
        )
    }

    fn packet(frame: u32) -> FramePacket {
        let mut packet = FramePacket::empty();
        packet.inputs.push(FrameInput {
            frame: Frame::new(frame),
            input: InputState::NONE.with_button(0, true),
        });
        packet
    }

    #[test]
    #[cfg(not(miri))]
    fn host_learns_peer_from_first_datagram() {
        let mut host = UdpDatagramSocket::bind_to_port(0).unwrap();
        let mut client = UdpDatagramSocket::connect(0, loopback(&host)).unwrap();
        assert!(host.peer_addr().is_none());

        host.send_packet(&packet(0));
        client.send_packet(&FramePacket::empty());
        let received = wait_for_packets(&mut host, 1);
        assert_eq!(received.len(), 1);
        assert!(received[0].is_empty());
        assert_eq!(host.peer_addr().unwrap().port(), client.local_addr().unwrap().port());

        host.send_packet(&packet(7));
        let received = wait_for_packets(&mut client, 1);
        assert_eq!(received[0].last_frame(), Some(Frame::new(7)));
    }

    #[test]
    #[cfg(not(miri))]
    fn datagrams_from_strangers_are_ignored() {
        let mut host = UdpDatagramSocket::bind_to_port(0).unwrap();
        let mut client = UdpDatagramSocket::connect(0, loopback(&host)).unwrap();
        let mut stranger = UdpDatagramSocket::connect(0, loopback(&host)).unwrap();

        client.send_packet(&packet(1));
        assert_eq!(wait_for_packets(&mut host, 1).len(), 1);
        stranger.send_packet(&packet(2));
        client.send_packet(&packet(3));
        let received = wait_for_packets(&mut host, 1);
        assert!(received.iter().all(|p| p.last_frame() != Some(Frame::new(2))));
    }

    #[test]
    #[cfg(not(miri))]
    fn receive_is_non_blocking() {
        let mut socket = UdpDatagramSocket::bind_to_port(0).unwrap();
        assert!(socket.receive_packets().is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn oversized_packets_are_reported_once() {
        use crate::telemetry::CollectingObserver;

        let target = UdpDatagramSocket::bind_to_port(0).unwrap();
        let mut socket = UdpDatagramSocket::connect(0, loopback(&target)).unwrap();
        let observer = Arc::new(CollectingObserver::new());
        socket.set_violation_observer(Some(observer.clone()));

        // 40 entries of 16 bytes each: above the 508 byte threshold, within the send buffer.
        let mut large = FramePacket::empty();
        for frame in 0..40 {
            large.inputs.push(FrameInput {
                frame: Frame::new(frame),
                input: InputState::NONE,
            });
        }
        socket.send_packet(&packet(1));
        assert!(observer.is_empty());
        for _ in 0..5 {
            socket.send_packet(&large);
        }
        assert_eq!(observer.len(), 1);
        assert_eq!(observer.violations()[0].kind, ViolationKind::Transport);
        assert_eq!(observer.violations()[0].severity, ViolationSeverity::Warning);
    }

    #[test]
    fn buffer_sizes_relationship() {
        const _: () = assert!(SEND_BUFFER_SIZE > IDEAL_MAX_UDP_PACKET_SIZE);
        const _: () = assert!(RECV_BUFFER_SIZE >= SEND_BUFFER_SIZE);
    }
}
