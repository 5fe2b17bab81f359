//! Shared fixtures for the reactor integration tests.

#![allow(dead_code)]

use slotnet_core::options::{ChannelOptions, PoolOptions};
use slotnet_reactor::{SelectorPool, ServerChannel};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn pool(name: &str, threads: usize) -> SelectorPool {
    SelectorPool::open(
        PoolOptions::new()
            .with_name(name)
            .with_threads(threads)
            .with_poll_timeout(Duration::from_millis(20)),
    )
    .unwrap()
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Bind a server that echoes every message on every accepted connection.
pub fn echo_server(pool: &SelectorPool, options: ChannelOptions) -> (ServerChannel, SocketAddr) {
    let server = ServerChannel::open(pool, options).unwrap();
    server.bind(loopback()).get_timeout(WAIT).unwrap();
    let addr = server.local_addr().unwrap();

    let acceptor = server.clone();
    thread::spawn(move || {
        while let Ok(channel) = acceptor.accept() {
            thread::spawn(move || {
                let mut input = channel.input_buffer().unwrap();
                let mut output = channel.output_buffer().unwrap();
                while let Ok(message) = input.recv() {
                    if output.send(&message).is_err() {
                        break;
                    }
                }
            });
        }
    });
    (server, addr)
}

/// `[u32 BE length][body]`, as written by the length codec.
pub fn length_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(body);
    frame
}
