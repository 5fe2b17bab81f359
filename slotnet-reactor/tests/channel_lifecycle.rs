//! Lifecycle tests over real loopback sockets: connect, bind, close ordering,
//! transport failures and implicit closes.

mod common;

use common::{echo_server, length_frame, loopback, pool, WAIT};
use slotnet_core::codec::CodecKind;
use slotnet_core::error::SlotError;
use slotnet_core::options::ChannelOptions;
use slotnet_reactor::{Channel, ChannelState, ServerChannel, ServerState};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn length_options() -> ChannelOptions {
    ChannelOptions::new().with_codec(CodecKind::Length).with_message_length(256)
}

#[test]
fn test_connect_refused_fails_completion() {
    let pool = pool("refused", 1);
    let port = portpicker::pick_unused_port().expect("no free port");
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let channel = Channel::open(&pool, ChannelOptions::new()).unwrap();
    let err = channel.connect(addr).get_timeout(WAIT).unwrap_err();
    assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused), "{err}");

    channel.close_completion().get_timeout(WAIT).unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.is_open());
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_server_bind_in_use() {
    let pool = pool("bind-in-use", 1);
    let first = ServerChannel::open(&pool, ChannelOptions::new()).unwrap();
    first.bind(loopback()).get_timeout(WAIT).unwrap();
    assert_eq!(first.state(), ServerState::Listening);
    let taken = first.local_addr().unwrap();

    let second = ServerChannel::open(&pool, ChannelOptions::new()).unwrap();
    let err = second.bind(taken).get_timeout(WAIT).unwrap_err();
    assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse), "{err}");
    assert_eq!(second.state(), ServerState::Closed);

    // Client-side local bind reports the same failure through its own completion.
    let client = Channel::open(&pool, ChannelOptions::new()).unwrap();
    let err = client.bind(taken).get_timeout(WAIT).unwrap_err();
    assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse), "{err}");
    assert_eq!(client.state(), ChannelState::Unconnected);

    first.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_client_local_bind_then_connect() {
    let pool = pool("local-bind", 1);
    let (server, addr) = echo_server(&pool, length_options());

    let channel = Channel::open(&pool, length_options()).unwrap();
    channel.bind(loopback()).get_timeout(WAIT).unwrap();
    let local = channel.local_addr().unwrap();
    assert!(matches!(
        channel.bind(loopback()).get_timeout(WAIT),
        Err(SlotError::IllegalState(_))
    ));

    channel.connect(addr).get_timeout(WAIT).unwrap();
    assert_eq!(channel.local_addr(), Some(local));
    assert_eq!(channel.peer_addr(), Some(addr));

    channel.close().get_timeout(WAIT).unwrap();
    server.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_connect_twice_and_after_close_fails() {
    let pool = pool("connect-twice", 1);
    let (server, addr) = echo_server(&pool, ChannelOptions::new());

    let channel = Channel::open(&pool, ChannelOptions::new()).unwrap();
    channel.connect(addr).get_timeout(WAIT).unwrap();
    assert!(channel.is_open());
    assert!(matches!(
        channel.connect(addr).get_timeout(WAIT),
        Err(SlotError::IllegalState(_))
    ));

    channel.close().get_timeout(WAIT).unwrap();
    assert!(matches!(
        channel.connect(addr).get_timeout(WAIT),
        Err(SlotError::IllegalState(_))
    ));

    server.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_close_from_many_threads_closes_once() {
    let pool = pool("close-many", 2);
    let (server, addr) = echo_server(&pool, ChannelOptions::new());
    let channel = Channel::open(&pool, ChannelOptions::new()).unwrap();
    channel.connect(addr).get_timeout(WAIT).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let channel = channel.clone();
            thread::spawn(move || channel.close())
        })
        .collect();
    let completions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for completion in &completions {
        assert!(completion.same(&channel.close_completion()));
        completion.get_timeout(WAIT).unwrap();
    }
    assert_eq!(channel.state(), ChannelState::Closed);

    server.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_close_unblocks_full_output_ring() {
    let pool = pool("close-unblocks", 1);
    let channel = Channel::open(&pool, ChannelOptions::new().with_capacity(2)).unwrap();
    let mut output = channel.output_buffer().unwrap();
    output.send(b"one").unwrap();
    output.send(b"two").unwrap();
    assert!(output.is_full());

    let blocked = thread::spawn(move || output.acquire().map(|_| ()));
    thread::sleep(Duration::from_millis(50));
    channel.close().get_timeout(WAIT).unwrap();
    assert!(matches!(blocked.join().unwrap(), Err(SlotError::Closed)));
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_buffers_are_taken_once() {
    let pool = pool("take-once", 1);
    let channel = Channel::open(&pool, ChannelOptions::new()).unwrap();
    assert!(channel.output_buffer().is_ok());
    assert!(matches!(channel.output_buffer(), Err(SlotError::IllegalState(_))));
    assert!(channel.input_buffer().is_ok());
    assert!(matches!(channel.input_buffer(), Err(SlotError::IllegalState(_))));
    channel.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_invalid_codec_configuration_fails_fast() {
    let pool = pool("bad-config", 1);
    let too_long = ChannelOptions::new().with_message_length(70_000);
    assert!(matches!(Channel::open(&pool, too_long.clone()), Err(SlotError::InvalidConfig(_))));
    assert!(matches!(ServerChannel::open(&pool, too_long), Err(SlotError::InvalidConfig(_))));
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_pool_closed_before_channel() {
    let server_pool = pool("server-side", 1);
    let (server, addr) = echo_server(&server_pool, ChannelOptions::new());

    let client_pool = pool("client-side", 1);
    let channel = Channel::open(&client_pool, ChannelOptions::new()).unwrap();
    channel.connect(addr).get_timeout(WAIT).unwrap();

    client_pool.close().get_timeout(WAIT).unwrap();
    assert!(!client_pool.is_open());
    // The channel outlives its reactor until it is closed explicitly.
    assert!(channel.is_open());
    assert!(!channel.close_completion().is_done());

    channel.close().get_timeout(WAIT).unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);

    server.close().get_timeout(WAIT).unwrap();
    server_pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_channel_closed_before_pool() {
    let pool = pool("channel-first", 1);
    let (server, addr) = echo_server(&pool, ChannelOptions::new());

    let first = Channel::open(&pool, ChannelOptions::new()).unwrap();
    first.connect(addr).get_timeout(WAIT).unwrap();
    first.close().get_timeout(WAIT).unwrap();
    assert!(pool.is_open());

    let second = Channel::open(&pool, ChannelOptions::new()).unwrap();
    second.connect(addr).get_timeout(WAIT).unwrap();
    let mut output = second.output_buffer().unwrap();
    let mut input = second.input_buffer().unwrap();
    output.send(b"still serving").unwrap();
    assert_eq!(&input.recv().unwrap()[..], b"still serving");

    second.close().get_timeout(WAIT).unwrap();
    server.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_connect_on_closed_pool_fails() {
    let pool = pool("closed-pool", 1);
    pool.close().get_timeout(WAIT).unwrap();
    let channel = Channel::open(&pool, ChannelOptions::new()).unwrap();
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(matches!(channel.connect(addr).get_timeout(WAIT), Err(SlotError::Closed)));
    channel.close_completion().get_timeout(WAIT).unwrap();
}

#[test]
fn test_peer_close_keeps_decoded_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for i in 0..5u8 {
            stream.write_all(&length_frame(&[i; 32])).unwrap();
        }
        // Dropping the stream closes the connection.
    });

    let pool = pool("peer-close", 1);
    let channel = Channel::open(&pool, length_options()).unwrap();
    channel.connect(addr).get_timeout(WAIT).unwrap();
    peer.join().unwrap();
    channel.close_completion().get_timeout(WAIT).unwrap();

    let mut input = channel.input_buffer().unwrap();
    for i in 0..5u8 {
        assert_eq!(&input.recv().unwrap()[..], &[i; 32][..]);
    }
    assert!(matches!(input.recv(), Err(SlotError::Closed)));
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_framing_error_closes_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&length_frame(b"fine")).unwrap();
        // Declares a body larger than the channel's message length.
        stream.write_all(&10_000u32.to_be_bytes()).unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let pool = pool("framing-error", 1);
    let channel = Channel::open(&pool, length_options()).unwrap();
    let mut input = channel.input_buffer().unwrap();
    channel.connect(addr).get_timeout(WAIT).unwrap();

    assert_eq!(&input.recv().unwrap()[..], b"fine");
    channel.close_completion().get_timeout(WAIT).unwrap();
    assert!(matches!(input.recv(), Err(SlotError::Closed)));
    peer.join().unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_slow_consumer_pauses_reads() {
    const COUNT: usize = 200;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let done = Arc::new(std::sync::Barrier::new(2));
    let peer_done = Arc::clone(&done);
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for i in 0..COUNT {
            stream.write_all(&length_frame(&(i as u32).to_be_bytes())).unwrap();
        }
        peer_done.wait();
    });

    let pool = pool("slow-consumer", 1);
    let channel = Channel::open(&pool, length_options().with_capacity(4)).unwrap();
    let mut input = channel.input_buffer().unwrap();
    channel.connect(addr).get_timeout(WAIT).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(input.len() <= 4);
    for i in 0..COUNT {
        let message = input.acquire_timeout(WAIT).unwrap();
        assert_eq!(&message[..], &(i as u32).to_be_bytes());
        message.release();
    }
    done.wait();
    peer.join().unwrap();
    channel.close().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_accept_timeout_and_closed_server() {
    let pool = pool("accept", 1);
    let server = ServerChannel::open(&pool, ChannelOptions::new()).unwrap();
    server.bind(loopback()).get_timeout(WAIT).unwrap();
    assert!(server.is_open());
    assert!(matches!(server.try_accept(), Ok(None)));
    assert!(matches!(
        server.accept_timeout(Duration::from_millis(20)),
        Err(SlotError::Timeout)
    ));

    server.close().get_timeout(WAIT).unwrap();
    assert_eq!(server.state(), ServerState::Closed);
    assert!(matches!(server.accept(), Err(SlotError::Closed)));
    assert!(matches!(
        server.bind(loopback()).get_timeout(WAIT),
        Err(SlotError::IllegalState(_))
    ));
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_server_close_releases_unclaimed_connections() {
    let pool = pool("unclaimed", 1);
    let server = ServerChannel::open(&pool, ChannelOptions::new()).unwrap();
    server.bind(loopback()).get_timeout(WAIT).unwrap();
    let addr = server.local_addr().unwrap();

    let client = Channel::open(&pool, ChannelOptions::new()).unwrap();
    client.connect(addr).get_timeout(WAIT).unwrap();
    let mut input = client.input_buffer().unwrap();
    let deadline = std::time::Instant::now() + WAIT;
    while server.pending() == 0 {
        assert!(std::time::Instant::now() < deadline, "connection never queued");
        thread::sleep(Duration::from_millis(5));
    }

    server.close().get_timeout(WAIT).unwrap();
    assert_eq!(server.pending(), 0);
    assert!(matches!(input.acquire_timeout(WAIT), Err(SlotError::Closed)));
    client.close_completion().get_timeout(WAIT).unwrap();
    pool.close().get_timeout(WAIT).unwrap();
}

#[test]
fn test_close_counts_discarded_output() {
    let pool = pool("discarded", 1);
    let channel = Channel::open(&pool, ChannelOptions::new()).unwrap();
    let mut output = channel.output_buffer().unwrap();
    for message in [&b"one"[..], b"two", b"three"] {
        output.send(message).unwrap();
    }
    assert_eq!(channel.discarded(), 0);
    channel.close().get_timeout(WAIT).unwrap();
    assert_eq!(channel.discarded(), 3);
    pool.close().get_timeout(WAIT).unwrap();
}
