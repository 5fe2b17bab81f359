//! TLS collaborator interface.
//!
//! Slotnet does not ship a TLS implementation. A channel opened with a
//! [`TlsContext`] asks it for one [`TlsEngine`] per connection and then only
//! feeds and drains that engine: ciphertext read from the socket goes to
//! [`unwrap`](TlsEngine::unwrap), encoded frames go to
//! [`wrap`](TlsEngine::wrap) before they are written.
//!
//! The channel sits in [`ChannelState::Handshaking`](crate::ChannelState)
//! until the engine reports [`HandshakeStatus::Finished`].

use bytes::BytesMut;
use slotnet_core::error::Result;
use std::net::SocketAddr;

/// What the engine needs next to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has handshake bytes to send; call `wrap` with no plaintext.
    NeedWrap,
    /// The engine is waiting for bytes from the peer.
    NeedUnwrap,
    /// Application data may flow.
    Finished,
}

/// Per-connection encryption state machine.
pub trait TlsEngine: Send {
    fn handshake_status(&self) -> HandshakeStatus;

    /// Encrypt from `plaintext`, appending ciphertext (or pending handshake
    /// records) to `out`. Returns how many plaintext bytes were consumed.
    fn wrap(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<usize>;

    /// Consume whole records from the front of `ciphertext`, appending any
    /// decrypted application data to `out`. Partial records stay in
    /// `ciphertext` until more bytes arrive.
    fn unwrap(&mut self, ciphertext: &mut BytesMut, out: &mut BytesMut) -> Result<()>;

    /// Called once when the channel closes.
    fn close(&mut self) {}
}

/// Factory for engines, shared by every channel of a client or server.
pub trait TlsContext: Send + Sync {
    fn client_engine(&self, peer: SocketAddr) -> Result<Box<dyn TlsEngine>>;

    fn server_engine(&self, peer: SocketAddr) -> Result<Box<dyn TlsEngine>>;
}

/// Engine plus its ciphertext buffers.
pub(crate) struct TlsLayer {
    pub(crate) engine: Box<dyn TlsEngine>,
    pub(crate) raw_rx: BytesMut,
    pub(crate) raw_tx: BytesMut,
}

impl TlsLayer {
    pub(crate) fn new(engine: Box<dyn TlsEngine>, buffer_size: usize) -> Self {
        Self {
            engine,
            raw_rx: BytesMut::with_capacity(buffer_size),
            raw_tx: BytesMut::with_capacity(buffer_size),
        }
    }
}
