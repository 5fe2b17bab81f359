//! Server (acceptor) channels.
//!
//! A [`ServerChannel`] owns a listening socket registered with one pool
//! worker. Every accepted connection becomes a [`Channel`] that is assigned
//! to a worker of the same pool and handed out through [`accept`].
//!
//! Lifecycle: `Unbound → Binding → Listening → Closing → Closed`.
//!
//! [`accept`]: ServerChannel::accept

use crate::channel::{new_socket, Channel};
use crate::pool::{Command, Detachable, Driver, Reactor, SelectorPool, Step};
use crate::tls::TlsContext;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use slotnet_core::completion::Completion;
use slotnet_core::error::{Result, SlotError};
use slotnet_core::options::ChannelOptions;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Unbound = 0,
    Binding = 1,
    Listening = 2,
    Closing = 3,
    Closed = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unbound,
            1 => Self::Binding,
            2 => Self::Listening,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn is_closing(self) -> bool {
        self >= Self::Closing
    }
}

struct ServerShared {
    pool: SelectorPool,
    options: ChannelOptions,
    tls: Option<Arc<dyn TlsContext>>,
    state: AtomicU8,
    attachment: OnceLock<(Token, Reactor)>,
    accept_rx: flume::Receiver<Channel>,
    /// Moved into the listener driver at bind.
    accept_tx: Mutex<Option<flume::Sender<Channel>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    bound: Completion,
    closed: Completion,
    parked: Mutex<Option<Box<dyn Driver>>>,
}

impl ServerShared {
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn close(self: &Arc<Self>) -> Completion {
        loop {
            let current = self.state();
            if current.is_closing() {
                return self.closed.clone();
            }
            if self.transition(current, ServerState::Closing) {
                break;
            }
        }
        debug!(addr = ?*self.local_addr.lock(), "[SERVER] Closing");
        self.bound.fail(SlotError::Cancelled);

        let mut parked = self.parked.lock();
        if let Some(driver) = parked.take() {
            drop(parked);
            driver.fail(SlotError::Cancelled);
            return self.closed.clone();
        }
        match self.attachment.get() {
            Some((token, reactor)) => {
                let target: Arc<dyn Detachable> = Arc::clone(self) as Arc<dyn Detachable>;
                if reactor.submit(Command::Close(*token, target)).is_err() {
                    drop(parked);
                    self.finish_close();
                }
            }
            None => {
                drop(parked);
                self.finish_close();
            }
        }
        self.closed.clone()
    }

    fn finish_close(&self) {
        self.state.store(ServerState::Closed as u8, Ordering::Release);
        self.accept_tx.lock().take();
        self.bound.fail(SlotError::Cancelled);
        // Accepted but never handed out.
        let mut unclaimed = 0usize;
        for channel in self.accept_rx.drain() {
            channel.close();
            unclaimed += 1;
        }
        if self.closed.succeed() {
            debug!(addr = ?*self.local_addr.lock(), unclaimed, "[SERVER] Closed");
        }
    }
}

impl Detachable for ServerShared {
    fn close_detached(&self) {
        let parked = self.parked.lock().take();
        match parked {
            Some(driver) => driver.fail(SlotError::Cancelled),
            None => self.finish_close(),
        }
    }
}

/// Listening channel producing one [`Channel`] per accepted connection.
#[derive(Clone)]
pub struct ServerChannel {
    shared: Arc<ServerShared>,
}

impl ServerChannel {
    /// Create an unbound server. `options` apply to every accepted channel
    /// (and `backlog` to the listener).
    pub fn open(pool: &SelectorPool, options: ChannelOptions) -> Result<Self> {
        Self::build(pool, options, None)
    }

    /// Like [`open`](Self::open), with accepted connections wrapped by `tls`.
    pub fn open_tls(
        pool: &SelectorPool,
        options: ChannelOptions,
        tls: Arc<dyn TlsContext>,
    ) -> Result<Self> {
        Self::build(pool, options, Some(tls))
    }

    fn build(
        pool: &SelectorPool,
        options: ChannelOptions,
        tls: Option<Arc<dyn TlsContext>>,
    ) -> Result<Self> {
        options.validate()?;
        // Surface codec configuration errors here rather than per accept.
        options.codec.build(options.message_length)?;
        let (accept_tx, accept_rx) = flume::unbounded();
        Ok(Self {
            shared: Arc::new(ServerShared {
                pool: pool.clone(),
                options,
                tls,
                state: AtomicU8::new(ServerState::Unbound as u8),
                attachment: OnceLock::new(),
                accept_rx,
                accept_tx: Mutex::new(Some(accept_tx)),
                local_addr: Mutex::new(None),
                bound: Completion::new(),
                closed: Completion::new(),
                parked: Mutex::new(None),
            }),
        })
    }

    /// Bind and listen on `addr`.
    ///
    /// Returns immediately; the completion succeeds once the listener is
    /// registered and fails with the transport error otherwise (for example
    /// `AddrInUse`).
    pub fn bind(&self, addr: SocketAddr) -> Completion {
        let shared = &self.shared;
        if !shared.transition(ServerState::Unbound, ServerState::Binding) {
            return Completion::failed(SlotError::illegal_state(format!(
                "bind while {:?}",
                shared.state()
            )));
        }
        if let Err(e) = self.start_bind(addr) {
            debug!(%addr, "[SERVER] Bind failed: {}", e);
            shared.bound.fail(e);
            shared.finish_close();
        }
        shared.bound.clone()
    }

    fn start_bind(&self, addr: SocketAddr) -> Result<()> {
        let shared = &self.shared;
        let socket = new_socket(addr, &shared.options)?;
        socket.bind(&addr.into())?;
        socket.listen(shared.options.backlog)?;
        let listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        *shared.local_addr.lock() = Some(local);

        let accepted = shared
            .accept_tx
            .lock()
            .take()
            .ok_or_else(|| SlotError::illegal_state("server already bound"))?;
        let (token, reactor) = shared.pool.assign()?;
        if shared.attachment.set((token, reactor.clone())).is_err() {
            return Err(SlotError::bug("server attached twice"));
        }
        let driver = ListenerDriver {
            shared: Arc::clone(shared),
            listener,
            token,
            accepted,
        };
        reactor.register(token, Box::new(driver));
        Ok(())
    }

    /// Block until a connection is accepted. Fails with
    /// [`SlotError::Closed`] once the server is closed and the queue is empty.
    pub fn accept(&self) -> Result<Channel> {
        self.shared.accept_rx.recv().map_err(|_| SlotError::Closed)
    }

    pub fn try_accept(&self) -> Result<Option<Channel>> {
        match self.shared.accept_rx.try_recv() {
            Ok(channel) => Ok(Some(channel)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(SlotError::Closed),
        }
    }

    pub fn accept_timeout(&self, timeout: Duration) -> Result<Channel> {
        self.shared.accept_rx.recv_timeout(timeout).map_err(|e| match e {
            flume::RecvTimeoutError::Timeout => SlotError::Timeout,
            flume::RecvTimeoutError::Disconnected => SlotError::Closed,
        })
    }

    /// Accepted connections waiting for [`accept`](Self::accept).
    pub fn pending(&self) -> usize {
        self.shared.accept_rx.len()
    }

    pub fn close(&self) -> Completion {
        self.shared.close()
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ServerState::Listening
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn bind_completion(&self) -> Completion {
        self.shared.bound.clone()
    }

    pub fn close_completion(&self) -> Completion {
        self.shared.closed.clone()
    }
}

impl fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChannel")
            .field("state", &self.state())
            .field("local", &self.local_addr())
            .finish()
    }
}

struct ListenerDriver {
    shared: Arc<ServerShared>,
    listener: TcpListener,
    token: Token,
    accepted: flume::Sender<Channel>,
}

impl ListenerDriver {
    fn accept_all(&mut self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Per-connection failures (reset before accept) do not stop the listener.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    trace!(token = self.token.0, "[SERVER] Connection aborted before accept");
                    continue;
                }
                // Out of descriptors or memory: the pending connection stays in
                // the backlog and is retried on the next readiness event.
                Err(e) if resource_exhausted(&e) => {
                    warn!(token = self.token.0, "[SERVER] Accept deferred: {}", e);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let channel = match Channel::accepted(
                &self.shared.pool,
                self.shared.options.clone(),
                self.shared.tls.clone(),
                stream,
                peer,
            ) {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(token = self.token.0, %peer, "[SERVER] Dropping accepted connection: {}", e);
                    continue;
                }
            };
            debug!(token = self.token.0, %peer, "[SERVER] Accepted");
            if let Err(flume::SendError(channel)) = self.accepted.send(channel) {
                channel.close();
            }
        }
    }

    fn finish(self) {
        let shared = Arc::clone(&self.shared);
        drop(self);
        shared.finish_close();
    }
}

#[cfg(unix)]
fn resource_exhausted(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn resource_exhausted(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
}

impl Driver for ListenerDriver {
    fn register(&mut self, registry: &Registry, token: Token) -> Result<Step> {
        if self.shared.state().is_closing() {
            return Ok(Step::Done);
        }
        registry.register(&mut self.listener, token, Interest::READABLE)?;
        if self.shared.transition(ServerState::Binding, ServerState::Listening) {
            debug!(token = token.0, addr = ?*self.shared.local_addr.lock(), "[SERVER] Listening");
            self.shared.bound.succeed();
        }
        Ok(Step::Keep)
    }

    fn ready(&mut self, _registry: &Registry, _event: &Event) -> Step {
        match self.accept_all() {
            Ok(()) => Step::Keep,
            Err(e) => {
                warn!(token = self.token.0, "[SERVER] Accept failed, closing: {}", e);
                Step::Done
            }
        }
    }

    fn wake(&mut self, _registry: &Registry) -> Step {
        Step::Keep
    }

    fn close(self: Box<Self>, registry: &Registry) {
        let mut this = *self;
        if let Err(e) = registry.deregister(&mut this.listener) {
            trace!(token = this.token.0, "[SERVER] Deregister failed: {}", e);
        }
        this.finish();
    }

    fn detach(self: Box<Self>, registry: &Registry) {
        let mut this = self;
        if let Err(e) = registry.deregister(&mut this.listener) {
            trace!(token = this.token.0, "[SERVER] Deregister failed: {}", e);
        }
        debug!(token = this.token.0, "[SERVER] Detached from stopped pool");
        let shared = Arc::clone(&this.shared);
        let mut parked = shared.parked.lock();
        *parked = Some(this);
    }

    fn fail(self: Box<Self>, error: SlotError) {
        self.shared.bound.fail(error);
        (*self).finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_does_not_stop_the_listener() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(resource_exhausted(&io::Error::from_raw_os_error(code)), "{code}");
        }
        assert!(!resource_exhausted(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!resource_exhausted(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
