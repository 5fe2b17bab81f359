//! Echo every message back on every accepted connection.
//!
//! Usage: `cargo run --example echo_server -- [addr] [base-port count]`
//!
//! With a second argument, binds that many consecutive ports starting at
//! `addr`, which is what `group_echo_client` connects to.

use slotnet::prelude::*;
use std::net::SocketAddr;
use std::thread;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let mut args = std::env::args().skip(1);
    let base: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7000".to_string())
        .parse::<SocketAddr>()
        .map_err(|e| SlotError::config(format!("bad address: {e}")))?;
    let count = match args.next() {
        Some(n) => n
            .parse::<usize>()
            .map_err(|e| SlotError::config(format!("bad port count: {e}")))?,
        None => 1,
    };

    let pool = SelectorPool::open(PoolOptions::new().with_name("echo"))?;
    let addresses = GroupAddress::consecutive(base, count)?;
    let mut acceptors = Vec::with_capacity(count);
    for addr in addresses.iter() {
        let server = ServerChannel::open(&pool, ChannelOptions::new())?;
        server.bind(addr).get()?;
        info!("listening on {}", addr);
        acceptors.push(thread::spawn(move || serve(server)));
    }
    for acceptor in acceptors {
        let _ = acceptor.join();
    }
    pool.close().get()
}

fn serve(server: ServerChannel) {
    let mut workers = 0usize;
    while let Ok(channel) = server.accept() {
        workers += 1;
        let peer = channel.peer_addr();
        let (input, output) = match (channel.input_buffer(), channel.output_buffer()) {
            (Ok(input), Ok(output)) => (input, output),
            _ => continue,
        };
        match spawn_echo(format!("echo-{workers}"), input, output) {
            Ok(_) => info!("echoing for {:?}", peer),
            Err(e) => info!("could not start echo for {:?}: {}", peer, e),
        }
    }
}
