use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::codec;
use crate::network::messages::FramePacket;
use crate::network::tcp_stream::FramedStream;
use crate::DatagramSocket;

#[derive(Debug, Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-process byte stream with non-blocking semantics.
///
/// Reading an empty pipe fails with `WouldBlock`; once the other end is dropped, reads
/// drain what is left and then return `Ok(0)`, and writes fail with `BrokenPipe`.
#[derive(Debug)]
pub struct MemoryStream {
    incoming: Arc<Mutex<Pipe>>,
    outgoing: Arc<Mutex<Pipe>>,
}

/// Two connected [`MemoryStream`] ends.
#[must_use]
pub fn memory_stream_pair() -> (MemoryStream, MemoryStream) {
    let a_to_b = Arc::new(Mutex::new(Pipe::default()));
    let b_to_a = Arc::new(Mutex::new(Pipe::default()));
    (
        MemoryStream {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
        },
        MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
        },
    )
}

/// Two connected command channels.
#[must_use]
pub fn memory_command_pair() -> (FramedStream<MemoryStream>, FramedStream<MemoryStream>) {
    let (a, b) = memory_stream_pair();
    (FramedStream::new(a), FramedStream::new(b))
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.incoming.lock();
        if pipe.bytes.is_empty() {
            return if pipe.closed {
                Ok(0)
            } else {
                Err(ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(pipe.bytes.len());
        for (dst, src) in buf.iter_mut().zip(pipe.bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outgoing.lock();
        if pipe.closed {
            return Err(ErrorKind::BrokenPipe.into());
        }
        pipe.bytes.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.incoming.lock().closed = true;
        self.outgoing.lock().closed = true;
    }
}

/// One end of an in-process datagram link. Packets travel encoded, as they would on UDP.
#[derive(Debug)]
pub struct MemoryDatagramSocket {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    sent: usize,
}

/// Two connected [`MemoryDatagramSocket`]s.
#[must_use]
pub fn memory_datagram_pair() -> (MemoryDatagramSocket, MemoryDatagramSocket) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (
        MemoryDatagramSocket {
            tx: tx_a,
            rx: rx_a,
            sent: 0,
        },
        MemoryDatagramSocket {
            tx: tx_b,
            rx: rx_b,
            sent: 0,
        },
    )
}

impl MemoryDatagramSocket {
    /// Packets sent so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl DatagramSocket for MemoryDatagramSocket {
    fn send_packet(&mut self, packet: &FramePacket) {
        match codec::encode(packet) {
            Ok(bytes) => {
                self.sent += 1;
                // A dropped receiver behaves like an unreachable host.
                let _ = self.tx.send(bytes);
            },
            Err(e) => tracing::warn!(error = %e, "failed to encode frame packet"),
        }
    }

    fn receive_packets(&mut self) -> Vec<FramePacket> {
        self.rx
            .try_iter()
            .filter_map(|bytes| codec::decode_value(&bytes).ok())
            .collect()
    }
}
