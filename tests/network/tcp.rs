//! Sessions over real localhost sockets: a TCP command stream plus UDP frame packets.
//!
//! Both peers live in this thread. The listener's backlog completes the TCP connection
//! before `accept`, so nothing here blocks.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use serial_test::serial;

use crate::common::stubs::{reference_state, GameStub, InputScript};
use netplay_rollback::{
    FramedStream, NetplayEvent, NetplaySession, NullSink, P2PSession, ProtocolConfig, Role,
    SessionBuilder, SessionState, StepStatus, UdpDatagramSocket,
};

fn builder(nickname: &str) -> SessionBuilder {
    SessionBuilder::new()
        .with_nickname(nickname)
        .with_delay_frames(2)
        .unwrap()
        .with_protocol_config(ProtocolConfig {
            resend_interval: Duration::from_millis(5),
            ..ProtocolConfig::default()
        })
}

fn localhost_pair() -> (P2PSession<GameStub>, P2PSession<GameStub>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let client_stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (host_stream, _) = listener.accept().unwrap();

    let host_socket = UdpDatagramSocket::bind_to_port(0).unwrap();
    let host_udp = SocketAddr::from((
        Ipv4Addr::LOCALHOST,
        host_socket.local_addr().unwrap().port(),
    ));
    let client_socket = UdpDatagramSocket::connect(0, host_udp).unwrap();
    assert!(host_socket.peer_addr().is_none(), "host learns the peer later");

    let host = builder("host")
        .start_p2p_session(
            GameStub::new(InputScript::Pattern(51)),
            FramedStream::from_tcp(host_stream).unwrap(),
            host_socket,
            Role::Host,
        )
        .unwrap();
    let client = builder("client")
        .start_p2p_session(
            GameStub::new(InputScript::Pattern(52)),
            FramedStream::from_tcp(client_stream).unwrap(),
            client_socket,
            Role::Client,
        )
        .unwrap();
    (host, client)
}

/// Runs both sides once, sleeping briefly when either is waiting on the network.
fn tick(host: &mut P2PSession<GameStub>, client: &mut P2PSession<GameStub>) {
    let host_status = host.run_frame(&mut NullSink).unwrap();
    let client_status = client.run_frame(&mut NullSink).unwrap();
    if host_status != StepStatus::Ready || client_status != StepStatus::Ready {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
#[cfg(not(miri))]
#[serial]
fn test_localhost_session_converges() {
    let (mut host, mut client) = localhost_pair();
    for _ in 0..1_000 {
        if host.state() == SessionState::Synchronized
            && client.state() == SessionState::Synchronized
        {
            break;
        }
        tick(&mut host, &mut client);
    }
    assert_eq!(host.state(), SessionState::Synchronized);
    assert_eq!(client.state(), SessionState::Synchronized);

    for _ in 0..200 {
        tick(&mut host, &mut client);
    }
    assert!(host.frame_count().as_u32() > 20, "host barely advanced");

    let pause = client.request_pause().unwrap();
    for _ in 0..5_000 {
        let settled = host.frame_count() == pause
            && client.frame_count() == pause
            && host.confirmed_frame() == pause
            && client.confirmed_frame() == pause;
        if settled {
            break;
        }
        tick(&mut host, &mut client);
    }
    let expected = reference_state(
        0,
        InputScript::Pattern(51),
        InputScript::Pattern(52),
        pause.as_u32(),
    );
    assert_eq!(host.bridge().gs, expected);
    assert_eq!(client.bridge().gs, expected);
    assert!(host.network_stats().packets_received > 0);
    assert!(client.network_stats().commands_received > 0);
}

#[test]
#[cfg(not(miri))]
#[serial]
fn test_dropping_the_peer_closes_the_stream() {
    let (mut host, mut client) = localhost_pair();
    for _ in 0..1_000 {
        if host.state() == SessionState::Synchronized {
            break;
        }
        tick(&mut host, &mut client);
    }
    drop(client);

    let mut result = Ok(StepStatus::Ready);
    for _ in 0..1_000 {
        result = host.run_frame(&mut NullSink);
        if result.is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(result.is_err(), "host never noticed the closed stream");
    assert_eq!(host.state(), SessionState::Disconnected);
    assert!(host
        .events()
        .any(|e| matches!(e, NetplayEvent::Disconnected { .. })));
}
