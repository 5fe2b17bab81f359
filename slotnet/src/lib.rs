//! # Slotnet
//!
//! Non-blocking, length-framed message channels over a small pool of
//! reactor threads.
//!
//! ## Architecture
//!
//! - **`slotnet-core`**: frame codecs, the SPSC message ring, completion
//!   cells, options and addresses (sans-IO)
//! - **`slotnet-reactor`**: the selector pool, TCP/TLS channels, server
//!   channels and group channels
//! - **`slotnet`**: public API surface (this crate)
//!
//! Applications never touch sockets. They write messages into a channel's
//! output ring and read decoded messages from its input ring; the reactor
//! thread that owns the channel moves bytes between the rings and the wire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slotnet::prelude::*;
//!
//! # fn example() -> slotnet::Result<()> {
//! let pool = SelectorPool::open(PoolOptions::new().with_threads(2))?;
//! let channel = Channel::open(&pool, ChannelOptions::new())?;
//! channel.connect("127.0.0.1:5555".parse().unwrap()).get()?;
//!
//! let mut output = channel.output_buffer()?;
//! let mut input = channel.input_buffer()?;
//! output.send(b"hello")?;
//! let reply = input.recv()?;
//! println!("{:?}", reply);
//!
//! channel.close().get()?;
//! pool.close().get()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Framing
//!
//! Every message travels as one frame. The default codec compresses each
//! message with deflate behind a 4-byte big-endian length header, and keeps
//! the whole frame under 65,499 bytes. [`CodecKind`] also offers plain
//! length framing and length framing with a CRC-32C footer.
//!
//! ## Backpressure
//!
//! Both rings are bounded. A full output ring blocks the writing thread; a
//! full input ring pauses reads from the socket until the application drains
//! a slot. Closing a channel wakes every blocked thread with
//! [`SlotError::Closed`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;
pub mod handler;

pub use bytes::Bytes;

pub use slotnet_core::address::{ChannelAddress, GroupAddress, GroupAddressBuilder};
pub use slotnet_core::buffer::{
    BufferConsumer, BufferHandle, BufferProducer, MessageBuffer, ReadSlot, Sink, WriteSlot,
};
pub use slotnet_core::codec::{
    max_compressed_length, max_uncompressed_length, ChecksumCodec, CodecKind, DeflateCodec,
    LengthCodec, MessageCodec,
};
pub use slotnet_core::completion::Completion;
pub use slotnet_core::error::{Result, SlotError};
pub use slotnet_core::options::{
    Assignment, ChannelOptions, DeliveryPolicy, GroupOptions, PoolOptions,
};
pub use slotnet_reactor::{
    Channel, ChannelState, GroupChannel, HandshakeStatus, MessageChannel, SelectorPool,
    ServerChannel, ServerState, TlsContext, TlsEngine,
};

/// Everything needed to open a pool, connect channels and move messages.
pub mod prelude {
    pub use crate::handler::{spawn_consumer, spawn_echo, spawn_producer};
    pub use crate::{
        BufferConsumer, BufferProducer, Channel, ChannelAddress, ChannelOptions, CodecKind,
        Completion, DeliveryPolicy, GroupAddress, GroupChannel, GroupOptions, MessageChannel,
        PoolOptions, Result, SelectorPool, ServerChannel, SlotError,
    };
}
