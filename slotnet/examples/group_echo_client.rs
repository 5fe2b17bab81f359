//! Send messages through a group channel to several echo servers at once
//! and count the replies coming back from every member.
//!
//! Start `echo_server 127.0.0.1:7000 3` first, then:
//! `cargo run --example group_echo_client -- 127.0.0.1:7000 3 1000`

use slotnet::prelude::*;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
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
    let members: usize = parse_or(args.next(), 3)?;
    let messages: usize = parse_or(args.next(), 1000)?;

    let pool = SelectorPool::open(PoolOptions::new().with_name("group-client").with_threads(2))?;
    let group = GroupChannel::open(&pool, GroupOptions::new(members))?;
    let address = GroupAddress::consecutive(base, members)?;
    group.connect(&address).get_timeout(Duration::from_secs(10))?;
    info!("connected to {}", address);

    let mut next = 0usize;
    let started = Instant::now();
    let producer = spawn_producer("group-requests", group.output_buffer()?, move |slot| {
        if next == messages {
            return Ok(false);
        }
        slot.extend_from_slice(format!("message {next}").as_bytes());
        next += 1;
        Ok(true)
    })?;

    // Every member echoes every message; duplicates are expected.
    let mut input = group.input_buffer()?;
    let expected = messages * members;
    for received in 1..=expected {
        input.recv()?;
        if received % 1000 == 0 {
            info!("{} / {} replies", received, expected);
        }
    }
    let sent = producer.join().map_err(|_| SlotError::bug("producer panicked"))??;
    info!(
        "{} messages to {} members, {} replies in {:?}",
        sent,
        members,
        expected,
        started.elapsed()
    );

    group.close().get()?;
    pool.close().get()
}

fn parse_or(arg: Option<String>, default: usize) -> Result<usize> {
    match arg {
        Some(value) => value
            .parse::<usize>()
            .map_err(|e| SlotError::config(format!("bad number {value:?}: {e}"))),
        None => Ok(default),
    }
}
