//! Slotnet Reactor
//!
//! The I/O engine on top of `slotnet-core`:
//! - Selector pool of mio reactor threads (`pool`)
//! - TCP and TLS message channels (`channel`)
//! - Listening server channels (`server`)
//! - Group channels replicated over several connections (`group`)
//! - The external TLS engine interface (`tls`)

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::new_ret_no_self)]

pub mod channel;
pub mod group;
pub mod pool;
pub mod server;
pub mod tls;

pub use channel::{Channel, ChannelState, MessageChannel};
pub use group::GroupChannel;
pub use pool::SelectorPool;
pub use server::{ServerChannel, ServerState};
pub use tls::{HandshakeStatus, TlsContext, TlsEngine};
