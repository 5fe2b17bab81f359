//! Slotnet Core
//!
//! This crate contains the sans-IO building blocks:
//! - Frame codecs: length, checksum and deflate framing (`codec`)
//! - Bounded SPSC message ring (`buffer`)
//! - Single-assignment completion cells (`completion`)
//! - Pool, channel and group options (`options`)
//! - Channel and group addresses (`address`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::len_without_is_empty)]
pub mod address;
pub mod buffer;
pub mod codec;
pub mod completion;
pub mod error;
pub mod options;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::address::{ChannelAddress, GroupAddress};
    pub use crate::buffer::{
        BufferConsumer, BufferHandle, BufferProducer, MessageBuffer, ReadSlot, WriteSlot,
    };
    pub use crate::codec::{ChecksumCodec, CodecKind, DeflateCodec, LengthCodec, MessageCodec};
    pub use crate::completion::Completion;
    pub use crate::error::{Result, SlotError};
    pub use crate::options::{Assignment, ChannelOptions, DeliveryPolicy, GroupOptions, PoolOptions};
}
