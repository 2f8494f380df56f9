//! Length-prefixed message framing over a non-blocking byte stream.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::network::codec::{self, FrameDecoder};
use crate::network::messages::Command;
use crate::{CommandStream, DisconnectReason, NetplayError};

const READ_CHUNK: usize = 16 * 1024;

/// A reliable message channel over any non-blocking `Read + Write` stream.
///
/// Writes that the stream cannot take right now stay in an outbox and go out on the next
/// [`flush`](Self::flush). Reads never block; a read of zero bytes means the peer hung up,
/// which is reported once every message that arrived before it was handed out.
#[derive(Debug)]
pub struct FramedStream<S> {
    stream: S,
    outbox: Vec<u8>,
    decoder: FrameDecoder,
    read_buf: Box<[u8]>,
    closed: bool,
}

impl FramedStream<TcpStream> {
    /// Wraps a connected TCP stream, switching it to non-blocking mode with Nagle disabled.
    pub fn from_tcp(stream: TcpStream) -> Result<Self, NetplayError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> Result<SocketAddr, NetplayError> {
        Ok(self.stream.peer_addr()?)
    }
}

impl<S: Read + Write> FramedStream<S> {
    /// Wraps an already non-blocking stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            outbox: Vec::new(),
            decoder: FrameDecoder::new(),
            read_buf: vec![0; READ_CHUNK].into_boxed_slice(),
            closed: false,
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Bytes queued but not yet accepted by the stream.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.outbox.len()
    }

    /// Queues one message and writes as much as the stream accepts.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), NetplayError> {
        codec::write_frame(message, &mut self.outbox)?;
        self.flush()
    }

    /// Writes queued bytes until the stream would block.
    pub fn flush(&mut self) -> Result<(), NetplayError> {
        let mut written = 0;
        let result = loop {
            let Some(rest) = self.outbox.get(written..) else {
                break Ok(());
            };
            if rest.is_empty() {
                break Ok(());
            }
            match self.stream.write(rest) {
                Ok(0) => break Err(hangup()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => {
                    tracing::debug!(error = %e, "stream write failed");
                    break Err(hangup());
                },
            }
        };
        self.outbox.drain(..written);
        result
    }

    /// Returns every complete message received so far.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<Vec<T>, NetplayError> {
        while !self.closed {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => self.closed = true,
                Ok(n) => self.decoder.push(self.read_buf.get(..n).unwrap_or_default()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => {
                    tracing::debug!(error = %e, "stream read failed");
                    self.closed = true;
                },
            }
        }
        let mut messages = Vec::new();
        while let Some(message) = self.decoder.next_frame()? {
            messages.push(message);
        }
        if self.closed && messages.is_empty() {
            return Err(hangup());
        }
        Ok(messages)
    }
}

fn hangup() -> NetplayError {
    NetplayError::ConnectionLost {
        reason: DisconnectReason::StreamClosed,
    }
}

#[cfg(feature = "sync-send")]
impl<S: Read + Write + Send> CommandStream for FramedStream<S> {
    fn send_command(&mut self, command: &Command) -> Result<(), NetplayError> {
        self.send(command)
    }

    fn flush_commands(&mut self) -> Result<(), NetplayError> {
        self.flush()
    }

    fn receive_commands(&mut self) -> Result<Vec<Command>, NetplayError> {
        self.receive()
    }
}

#[cfg(not(feature = "sync-send"))]
impl<S: Read + Write> CommandStream for FramedStream<S> {
    fn send_command(&mut self, command: &Command) -> Result<(), NetplayError> {
        self.send(command)
    }

    fn flush_commands(&mut self) -> Result<(), NetplayError> {
        self.flush()
    }

    fn receive_commands(&mut self) -> Result<Vec<Command>, NetplayError> {
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
    use crate::network::memory::memory_stream_pair;
    use crate::network::messages::ConfigItem;
    use crate::Frame;

    #[test]
    fn commands_arrive_in_order() {
        let (a, b) = memory_stream_pair();
        let mut a = FramedStream::new(a);
        let mut b = FramedStream::new(b);
        a.send_command(&Command::Config(ConfigItem::SwapInput(true))).unwrap();
        a.send_command(&Command::Pause { frame: Frame::new(40) }).unwrap();
        a.send_command(&Command::Resume).unwrap();
        assert_eq!(
            b.receive_commands().unwrap(),
            vec![
                Command::Config(ConfigItem::SwapInput(true)),
                Command::Pause { frame: Frame::new(40) },
                Command::Resume,
            ]
        );
        assert!(b.receive_commands().unwrap().is_empty());
    }

    #[test]
    fn hangup_reported_after_last_message() {
        let (a, b) = memory_stream_pair();
        let mut a = FramedStream::new(a);
        let mut b = FramedStream::new(b);
        a.send_command(&Command::Disconnect).unwrap();
        drop(a);
        assert_eq!(b.receive_commands().unwrap(), vec![Command::Disconnect]);
        assert_eq!(
            b.receive_commands(),
            Err(NetplayError::ConnectionLost {
                reason: DisconnectReason::StreamClosed
            })
        );
    }

    #[test]
    fn write_to_closed_peer_fails() {
        let (a, b) = memory_stream_pair();
        let mut a = FramedStream::new(a);
        drop(b);
        assert!(a.send_command(&Command::Ack).is_err());
    }

    #[test]
    #[cfg(not(miri))]
    fn tcp_round_trip() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut client = FramedStream::from_tcp(client).unwrap();
        let mut server = FramedStream::from_tcp(server).unwrap();

        let state = vec![7u8; 200_000];
        client
            .send_command(&Command::InitialState { state: state.clone() })
            .unwrap();
        let mut received = Vec::new();
        for _ in 0..200 {
            client.flush_commands().unwrap();
            received.extend(server.receive_commands().unwrap());
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(received, vec![Command::InitialState { state }]);
        assert_eq!(client.pending_bytes(), 0);
    }
}
