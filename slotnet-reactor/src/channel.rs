//! TCP message channels.
//!
//! A [`Channel`] is one non-blocking socket, one frame codec and two message
//! rings. The application owns the outer halves of the rings (it produces
//! into the output ring and consumes from the input ring); the channel's
//! driver owns the inner halves and runs only on the worker the channel was
//! assigned to.
//!
//! ```text
//!  app ──▶ output ring ──▶ codec.encode ──▶ [tls.wrap] ──▶ socket
//!  app ◀── input ring  ◀── codec.decode ◀── [tls.unwrap] ◀── socket
//! ```
//!
//! Lifecycle: `Unconnected → Connecting → [Handshaking →] Open → Closing →
//! Closed`. Connect, bind and close each report through a [`Completion`].

use crate::pool::{Command, Detachable, Driver, Reactor, SelectorPool, Step};
use crate::tls::{HandshakeStatus, TlsContext, TlsLayer};
use bytes::{Buf, BytesMut};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use slotnet_core::address::ChannelAddress;
use slotnet_core::buffer::{BufferConsumer, BufferHandle, BufferProducer, MessageBuffer};
use slotnet_core::codec::MessageCodec;
use slotnet_core::completion::Completion;
use slotnet_core::error::{Result, SlotError};
use slotnet_core::options::ChannelOptions;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

/// Lifecycle of a client or accepted channel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Unconnected = 0,
    Connecting = 1,
    Handshaking = 2,
    Open = 3,
    Closing = 4,
    Closed = 5,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unconnected,
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::Open,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn is_closing(self) -> bool {
        self >= Self::Closing
    }
}

/// The capability surface shared by plain and group channels.
pub trait MessageChannel: Send + Sync {
    /// Start connecting; the completion reports the outcome.
    fn connect_to(&self, address: ChannelAddress) -> Completion;

    /// Idempotent close from any thread.
    fn close(&self) -> Completion;

    fn is_open(&self) -> bool;

    /// Take the application's producer half of the output ring. Only the
    /// first call succeeds.
    fn output_buffer(&self) -> Result<BufferProducer>;

    /// Take the application's consumer half of the input ring. Only the
    /// first call succeeds.
    fn input_buffer(&self) -> Result<BufferConsumer>;

    fn connect_completion(&self) -> Completion;

    fn close_completion(&self) -> Completion;
}

/// Reactor-side pieces, handed to the driver once.
struct IoParts {
    codec: Box<dyn MessageCodec>,
    outbound: BufferConsumer,
    inbound: BufferProducer,
}

pub(crate) struct ChannelShared {
    options: ChannelOptions,
    pool: SelectorPool,
    tls: Option<Arc<dyn TlsContext>>,
    state: AtomicU8,
    attachment: OnceLock<(Token, Reactor)>,
    output: Mutex<Option<BufferProducer>>,
    input: Mutex<Option<BufferConsumer>>,
    output_ring: BufferHandle,
    input_ring: BufferHandle,
    io: Mutex<Option<IoParts>>,
    /// Locally bound socket waiting for `connect`.
    local: Mutex<Option<Socket>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    connected: Completion,
    bound: Completion,
    closed: Completion,
    /// Driver parked here when the pool shut down under it.
    parked: Mutex<Option<Box<dyn Driver>>>,
    /// Output messages still queued when the channel closed.
    discarded: AtomicUsize,
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` unless the channel is already closing.
    fn advance(&self, to: ChannelState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ChannelState::from_u8(current).is_closing() {
                return false;
            }
            match self.state.compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn token(&self) -> Option<usize> {
        self.attachment.get().map(|(token, _)| token.0)
    }

    fn close(self: &Arc<Self>) -> Completion {
        loop {
            let current = self.state();
            if current.is_closing() {
                return self.closed.clone();
            }
            if self.transition(current, ChannelState::Closing) {
                break;
            }
        }
        debug!(token = ?self.token(), "[CHANNEL] Closing");
        self.output_ring.close();
        self.input_ring.close();
        self.connected.fail(SlotError::Cancelled);
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

    /// Final transition. Idempotent.
    fn finish_close(&self) {
        self.state.store(ChannelState::Closed as u8, Ordering::Release);
        self.output_ring.close();
        self.input_ring.close();
        self.connected.fail(SlotError::Cancelled);
        self.bound.fail(SlotError::Cancelled);
        self.local.lock().take();
        let discarded = self.output_ring.len();
        self.discarded.store(discarded, Ordering::Release);
        if self.closed.succeed() {
            if discarded > 0 {
                debug!(token = ?self.token(), discarded, "[CHANNEL] Closed, unsent output dropped");
            } else {
                debug!(token = ?self.token(), "[CHANNEL] Closed");
            }
        }
    }
}

impl Detachable for ChannelShared {
    fn close_detached(&self) {
        let parked = self.parked.lock().take();
        match parked {
            Some(driver) => driver.fail(SlotError::Cancelled),
            None => self.finish_close(),
        }
    }
}

/// A message channel over one TCP connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Create an unconnected client channel served by `pool`.
    pub fn open(pool: &SelectorPool, options: ChannelOptions) -> Result<Self> {
        Self::build(pool, options, None, ChannelState::Unconnected)
    }

    /// Like [`open`](Self::open), with every connection wrapped by `tls`.
    pub fn open_tls(
        pool: &SelectorPool,
        options: ChannelOptions,
        tls: Arc<dyn TlsContext>,
    ) -> Result<Self> {
        Self::build(pool, options, Some(tls), ChannelState::Unconnected)
    }

    fn build(
        pool: &SelectorPool,
        options: ChannelOptions,
        tls: Option<Arc<dyn TlsContext>>,
        state: ChannelState,
    ) -> Result<Self> {
        options.validate()?;
        let codec = options.codec.build(options.message_length)?;
        let (output, outbound) = MessageBuffer::bounded(options.capacity, options.message_length)?;
        let (inbound, input) = MessageBuffer::bounded(options.capacity, options.message_length)?;
        let shared = ChannelShared {
            pool: pool.clone(),
            tls,
            state: AtomicU8::new(state as u8),
            attachment: OnceLock::new(),
            output_ring: output.handle(),
            input_ring: input.handle(),
            output: Mutex::new(Some(output)),
            input: Mutex::new(Some(input)),
            io: Mutex::new(Some(IoParts { codec, outbound, inbound })),
            local: Mutex::new(None),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            connected: Completion::new(),
            bound: Completion::new(),
            closed: Completion::new(),
            parked: Mutex::new(None),
            discarded: AtomicUsize::new(0),
            options,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    /// Wrap a connection accepted by a server channel and register it.
    pub(crate) fn accepted(
        pool: &SelectorPool,
        options: ChannelOptions,
        tls: Option<Arc<dyn TlsContext>>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Self> {
        stream.set_nodelay(options.nodelay)?;
        let channel = Self::build(pool, options, tls, ChannelState::Connecting)?;
        let shared = &channel.shared;
        *shared.local_addr.lock() = stream.local_addr().ok();
        *shared.peer_addr.lock() = Some(peer);

        let layer = match &shared.tls {
            Some(ctx) => Some(TlsLayer::new(ctx.server_engine(peer)?, shared.options.read_buffer_size)),
            None => None,
        };
        let phase = if layer.is_some() { Phase::Handshaking } else { Phase::Open };
        channel.attach(stream, phase, layer)?;
        Ok(channel)
    }

    /// Connect to `addr`.
    ///
    /// Returns immediately. Fails with [`SlotError::IllegalState`] when the
    /// channel is not unconnected; transport failures (refused, unreachable)
    /// fail the completion and close the channel.
    pub fn connect(&self, addr: SocketAddr) -> Completion {
        let shared = &self.shared;
        if !shared.transition(ChannelState::Unconnected, ChannelState::Connecting) {
            return Completion::failed(SlotError::illegal_state(format!(
                "connect while {:?}",
                shared.state()
            )));
        }
        debug!(%addr, "[CHANNEL] Connecting");
        if let Err(e) = self.start_connect(addr) {
            debug!(%addr, "[CHANNEL] Connect failed: {}", e);
            shared.connected.fail(e);
            shared.finish_close();
        }
        shared.connected.clone()
    }

    fn start_connect(&self, addr: SocketAddr) -> Result<()> {
        let shared = &self.shared;
        if !shared.pool.is_open() {
            return Err(SlotError::Closed);
        }
        let local = shared.local.lock().take();
        let socket = match local {
            Some(socket) => socket,
            None => new_socket(addr, &shared.options)?,
        };
        socket.set_nodelay(shared.options.nodelay)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let stream = TcpStream::from_std(socket.into());
        self.attach(stream, Phase::Connecting, None)
    }

    /// Assign a worker and hand it a driver for `stream`.
    fn attach(&self, stream: TcpStream, phase: Phase, tls: Option<TlsLayer>) -> Result<()> {
        let shared = &self.shared;
        let io = shared
            .io
            .lock()
            .take()
            .ok_or_else(|| SlotError::illegal_state("channel already attached"))?;
        let (token, reactor) = shared.pool.assign()?;
        trace!(token = token.0, worker = reactor.index(), "[CHANNEL] Attaching");
        let driver = StreamDriver::new(Arc::clone(shared), stream, io, token, &reactor, phase, tls)?;
        if shared.attachment.set((token, reactor.clone())).is_err() {
            return Err(SlotError::bug("channel attached twice"));
        }
        reactor.register(token, Box::new(driver));
        Ok(())
    }

    /// Bind the local side of the connection before connecting.
    ///
    /// Failures such as an address already in use fail the completion; the
    /// channel stays unconnected.
    pub fn bind(&self, local: SocketAddr) -> Completion {
        let shared = &self.shared;
        if shared.state() != ChannelState::Unconnected {
            return Completion::failed(SlotError::illegal_state(format!(
                "bind while {:?}",
                shared.state()
            )));
        }
        let mut slot = shared.local.lock();
        if shared.bound.is_done() {
            return Completion::failed(SlotError::illegal_state("channel already bound"));
        }
        let outcome = new_socket(local, &shared.options).and_then(|socket| {
            socket.bind(&local.into())?;
            Ok(socket)
        });
        match outcome {
            Ok(socket) => {
                *shared.local_addr.lock() = socket.local_addr().ok().and_then(|a| a.as_socket());
                *slot = Some(socket);
                debug!(%local, "[CHANNEL] Bound");
                shared.bound.succeed();
            }
            Err(e) => {
                debug!(%local, "[CHANNEL] Bind failed: {}", e);
                shared.bound.fail(e.into());
            }
        }
        shared.bound.clone()
    }

    pub fn close(&self) -> Completion {
        self.shared.close()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn output_buffer(&self) -> Result<BufferProducer> {
        self.shared
            .output
            .lock()
            .take()
            .ok_or_else(|| SlotError::illegal_state("output buffer already taken"))
    }

    pub fn input_buffer(&self) -> Result<BufferConsumer> {
        self.shared
            .input
            .lock()
            .take()
            .ok_or_else(|| SlotError::illegal_state("input buffer already taken"))
    }

    pub fn connect_completion(&self) -> Completion {
        self.shared.connected.clone()
    }

    pub fn bind_completion(&self) -> Completion {
        self.shared.bound.clone()
    }

    pub fn close_completion(&self) -> Completion {
        self.shared.closed.clone()
    }

    /// Messages left unsent in the output ring when the channel closed.
    pub fn discarded(&self) -> usize {
        self.shared.discarded.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.peer_addr.lock()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.shared.options
    }

    pub fn is_tls(&self) -> bool {
        self.shared.tls.is_some()
    }
}

impl MessageChannel for Channel {
    fn connect_to(&self, address: ChannelAddress) -> Completion {
        match address {
            ChannelAddress::Socket(addr) => self.connect(addr),
            ChannelAddress::Group(group) if group.len() == 1 => match group.get(0) {
                Some(addr) => self.connect(addr),
                None => Completion::failed(SlotError::bug("single-member group without member")),
            },
            ChannelAddress::Group(group) => Completion::failed(SlotError::config(format!(
                "a single channel cannot connect to {} addresses",
                group.len()
            ))),
        }
    }

    fn close(&self) -> Completion {
        Channel::close(self)
    }

    fn is_open(&self) -> bool {
        Channel::is_open(self)
    }

    fn output_buffer(&self) -> Result<BufferProducer> {
        Channel::output_buffer(self)
    }

    fn input_buffer(&self) -> Result<BufferConsumer> {
        Channel::input_buffer(self)
    }

    fn connect_completion(&self) -> Completion {
        Channel::connect_completion(self)
    }

    fn close_completion(&self) -> Completion {
        Channel::close_completion(self)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("token", &self.shared.token())
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

pub(crate) fn new_socket(addr: SocketAddr, options: &ChannelOptions) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if options.reuse_address {
        socket.set_reuse_address(true)?;
    }
    Ok(socket)
}

fn connect_in_progress(e: &io::Error) -> bool {
    in_progress_code(e) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(unix)]
fn in_progress_code(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn in_progress_code(_: &io::Error) -> bool {
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Handshaking,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Eof,
}

enum Received {
    Data,
    Blocked,
    Eof,
}

/// Coalesces ring notifications into one [`Command::Wake`] per drain.
struct Wakeup {
    token: Token,
    reactor: Reactor,
    pending: AtomicBool,
    input_paused: AtomicBool,
}

impl Wakeup {
    fn notify(&self) {
        if !self.pending.swap(true, Ordering::SeqCst) && self.reactor.submit(Command::Wake(self.token)).is_err() {
            trace!(token = self.token.0, "[CHANNEL] Wake dropped, worker gone");
        }
    }
}

struct StreamDriver {
    shared: Arc<ChannelShared>,
    stream: TcpStream,
    token: Token,
    codec: Box<dyn MessageCodec>,
    outbound: BufferConsumer,
    inbound: BufferProducer,
    /// Plaintext read from the wire, not yet decoded.
    rx: BytesMut,
    /// Encoded frames not yet written (or wrapped).
    tx: BytesMut,
    scratch: Box<[u8]>,
    tls: Option<TlsLayer>,
    phase: Phase,
    interest: Interest,
    /// Input ring was full; reading is suspended until the consumer frees a slot.
    paused: bool,
    wakeup: Arc<Wakeup>,
}

impl StreamDriver {
    fn new(
        shared: Arc<ChannelShared>,
        stream: TcpStream,
        io: IoParts,
        token: Token,
        reactor: &Reactor,
        phase: Phase,
        tls: Option<TlsLayer>,
    ) -> Result<Self> {
        let wakeup = Arc::new(Wakeup {
            token,
            reactor: reactor.clone(),
            pending: AtomicBool::new(false),
            input_paused: AtomicBool::new(false),
        });
        let hook = Arc::clone(&wakeup);
        io.outbound.on_available(Arc::new(move || hook.notify()))?;
        let hook = Arc::clone(&wakeup);
        io.inbound.on_space(Arc::new(move || {
            if hook.input_paused.load(Ordering::SeqCst) {
                hook.notify();
            }
        }))?;

        let read_size = shared.options.read_buffer_size;
        let write_size = shared.options.write_buffer_size;
        Ok(Self {
            stream,
            token,
            codec: io.codec,
            outbound: io.outbound,
            inbound: io.inbound,
            rx: BytesMut::with_capacity(read_size),
            tx: BytesMut::with_capacity(write_size),
            scratch: vec![0u8; read_size].into_boxed_slice(),
            tls,
            phase,
            interest: Interest::READABLE | Interest::WRITABLE,
            paused: false,
            wakeup,
            shared,
        })
    }

    fn finish_connect(&mut self, registry: &Registry) -> Result<Flow> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e.into());
        }
        let peer = match self.stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(Flow::Continue),
            Err(e) => return Err(e.into()),
        };
        *self.shared.local_addr.lock() = self.stream.local_addr().ok();
        *self.shared.peer_addr.lock() = Some(peer);
        debug!(token = self.token.0, %peer, "[CHANNEL] Connected");

        let engine = match &self.shared.tls {
            Some(ctx) => Some(ctx.client_engine(peer)?),
            None => None,
        };
        match engine {
            Some(engine) => {
                self.tls = Some(TlsLayer::new(engine, self.shared.options.read_buffer_size));
                self.phase = Phase::Handshaking;
                self.shared.advance(ChannelState::Handshaking);
                self.handshake(registry)
            }
            None => self.open(registry),
        }
    }

    fn handshake(&mut self, registry: &Registry) -> Result<Flow> {
        loop {
            let Some(tls) = self.tls.as_mut() else {
                return self.open(registry);
            };
            match tls.engine.handshake_status() {
                HandshakeStatus::Finished => {
                    trace!(token = self.token.0, "[CHANNEL] Handshake finished");
                    return self.open(registry);
                }
                HandshakeStatus::NeedWrap => {
                    tls.engine.wrap(&[], &mut tls.raw_tx)?;
                    if !self.write_out()? {
                        self.set_interest(registry, true)?;
                        return Ok(Flow::Continue);
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    if !tls.raw_rx.is_empty() {
                        let before = tls.raw_rx.len();
                        tls.engine.unwrap(&mut tls.raw_rx, &mut self.rx)?;
                        if tls.raw_rx.len() != before
                            || tls.engine.handshake_status() != HandshakeStatus::NeedUnwrap
                        {
                            continue;
                        }
                    }
                    match self.read_socket()? {
                        Received::Data => {}
                        Received::Blocked => {
                            self.set_interest(registry, false)?;
                            return Ok(Flow::Continue);
                        }
                        Received::Eof => return Ok(Flow::Eof),
                    }
                }
            }
        }
    }

    fn open(&mut self, registry: &Registry) -> Result<Flow> {
        self.phase = Phase::Open;
        if self.shared.advance(ChannelState::Open) && self.shared.connected.succeed() {
            debug!(token = self.token.0, "[CHANNEL] Open");
        }
        self.service(registry, true, true)
    }

    fn service(&mut self, registry: &Registry, readable: bool, writable: bool) -> Result<Flow> {
        if readable && self.read()? == Flow::Eof {
            return Ok(Flow::Eof);
        }
        if writable {
            self.flush(registry)?;
        }
        Ok(Flow::Continue)
    }

    /// Read and decode until the socket would block or the input ring fills.
    fn read(&mut self) -> Result<Flow> {
        loop {
            self.unseal()?;
            self.deliver()?;
            if self.paused {
                return Ok(Flow::Continue);
            }
            match self.read_socket()? {
                Received::Data => {}
                Received::Blocked => return Ok(Flow::Continue),
                Received::Eof => return Ok(Flow::Eof),
            }
        }
    }

    fn read_socket(&mut self) -> Result<Received> {
        loop {
            match self.stream.read(&mut self.scratch) {
                Ok(0) => return Ok(Received::Eof),
                Ok(n) => {
                    let chunk = &self.scratch[..n];
                    match &mut self.tls {
                        Some(tls) => tls.raw_rx.extend_from_slice(chunk),
                        None => self.rx.extend_from_slice(chunk),
                    }
                    trace!(token = self.token.0, bytes = n, "[CHANNEL] Read");
                    return Ok(Received::Data);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn unseal(&mut self) -> Result<()> {
        if let Some(tls) = &mut self.tls {
            if !tls.raw_rx.is_empty() {
                tls.engine.unwrap(&mut tls.raw_rx, &mut self.rx)?;
            }
        }
        Ok(())
    }

    /// Decode every complete frame into the input ring.
    fn deliver(&mut self) -> Result<()> {
        while self.codec.has_complete_frame(&self.rx)? {
            if self.inbound.is_full() {
                // Publish the pause before the re-check so a concurrent
                // release either sees it or leaves space we see.
                self.wakeup.input_paused.store(true, Ordering::SeqCst);
                if self.inbound.is_full() {
                    trace!(token = self.token.0, "[CHANNEL] Input ring full, pausing reads");
                    self.paused = true;
                    return Ok(());
                }
                self.wakeup.input_paused.store(false, Ordering::SeqCst);
            }
            let Some(mut slot) = self.inbound.try_acquire()? else {
                return Err(SlotError::bug("input ring full after space check"));
            };
            self.codec.decode(&mut self.rx, &mut slot)?;
            slot.release()?;
        }
        self.paused = false;
        Ok(())
    }

    /// Encode, wrap and write until the output ring is empty or the socket
    /// would block, then track write interest accordingly.
    fn flush(&mut self, registry: &Registry) -> Result<()> {
        loop {
            self.fill()?;
            self.seal()?;
            if !self.write_out()? || self.outbound.is_empty() {
                break;
            }
        }
        let pending = match &self.tls {
            Some(tls) => !tls.raw_tx.is_empty() || !self.tx.is_empty(),
            None => !self.tx.is_empty(),
        };
        self.set_interest(registry, pending)
    }

    fn fill(&mut self) -> Result<()> {
        let limit = self.shared.options.write_buffer_size.max(1);
        while self.tx.len() < limit {
            let slot = match self.outbound.try_acquire() {
                Ok(Some(slot)) => slot,
                Ok(None) | Err(SlotError::Closed) => break,
                Err(e) => return Err(e),
            };
            self.codec.encode(&slot, &mut self.tx)?;
            slot.release();
        }
        Ok(())
    }

    fn seal(&mut self) -> Result<()> {
        if let Some(tls) = &mut self.tls {
            while !self.tx.is_empty() {
                let consumed = tls.engine.wrap(&self.tx, &mut tls.raw_tx)?;
                if consumed == 0 {
                    break;
                }
                self.tx.advance(consumed);
            }
        }
        Ok(())
    }

    /// Write the wire buffer. Returns `true` once it is empty.
    fn write_out(&mut self) -> Result<bool> {
        let out = match &mut self.tls {
            Some(tls) => &mut tls.raw_tx,
            None => &mut self.tx,
        };
        while !out.is_empty() {
            match self.stream.write(&out[..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    trace!(token = self.token.0, bytes = n, "[CHANNEL] Wrote");
                    out.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn set_interest(&mut self, registry: &Registry, want_write: bool) -> Result<()> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest != self.interest {
            registry.reregister(&mut self.stream, self.token, interest)?;
            self.interest = interest;
            trace!(token = self.token.0, want_write, "[CHANNEL] Interest changed");
        }
        Ok(())
    }

    fn settle(&mut self, outcome: Result<Flow>) -> Step {
        match outcome {
            Ok(Flow::Continue) => Step::Keep,
            Ok(Flow::Eof) => {
                debug!(token = self.token.0, "[CHANNEL] Peer closed connection");
                if self.phase != Phase::Open {
                    self.shared
                        .connected
                        .fail(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                Step::Done
            }
            Err(e) => {
                if e.is_closed() && self.shared.state().is_closing() {
                    trace!(token = self.token.0, "[CHANNEL] Rings closed under driver");
                } else if self.phase == Phase::Connecting {
                    debug!(token = self.token.0, "[CHANNEL] Connect failed: {}", e);
                } else if e.is_framing_error() {
                    warn!(token = self.token.0, "[CHANNEL] Framing error, closing: {}", e);
                } else {
                    warn!(token = self.token.0, "[CHANNEL] Connection lost: {}", e);
                }
                self.shared.connected.fail(e);
                Step::Done
            }
        }
    }

    fn finish(mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.codec.close();
        if let Some(tls) = &mut self.tls {
            tls.engine.close();
        }
        let shared = Arc::clone(&self.shared);
        drop(self);
        shared.finish_close();
    }
}

impl Driver for StreamDriver {
    fn register(&mut self, registry: &Registry, token: Token) -> Result<Step> {
        if self.shared.state().is_closing() {
            return Ok(Step::Done);
        }
        registry.register(&mut self.stream, token, self.interest)?;
        match self.phase {
            Phase::Connecting => {}
            Phase::Handshaking => {
                self.shared.advance(ChannelState::Handshaking);
            }
            Phase::Open => {
                if self.shared.advance(ChannelState::Open) && self.shared.connected.succeed() {
                    debug!(token = token.0, "[CHANNEL] Accepted connection open");
                }
            }
        }
        Ok(Step::Keep)
    }

    fn ready(&mut self, registry: &Registry, event: &Event) -> Step {
        let outcome = match self.phase {
            Phase::Connecting => self.finish_connect(registry),
            Phase::Handshaking => self.handshake(registry),
            Phase::Open => self.service(
                registry,
                event.is_readable() || event.is_read_closed() || event.is_error(),
                event.is_writable(),
            ),
        };
        self.settle(outcome)
    }

    fn wake(&mut self, registry: &Registry) -> Step {
        self.wakeup.pending.store(false, Ordering::SeqCst);
        if self.phase != Phase::Open {
            return Step::Keep;
        }
        self.wakeup.input_paused.store(false, Ordering::SeqCst);
        let readable = self.paused;
        let outcome = self.service(registry, readable, true);
        self.settle(outcome)
    }

    fn close(self: Box<Self>, registry: &Registry) {
        let mut this = *self;
        if let Err(e) = registry.deregister(&mut this.stream) {
            trace!(token = this.token.0, "[CHANNEL] Deregister failed: {}", e);
        }
        this.finish();
    }

    fn detach(self: Box<Self>, registry: &Registry) {
        let mut this = self;
        if let Err(e) = registry.deregister(&mut this.stream) {
            trace!(token = this.token.0, "[CHANNEL] Deregister failed: {}", e);
        }
        debug!(token = this.token.0, "[CHANNEL] Detached from stopped pool");
        let shared = Arc::clone(&this.shared);
        let mut parked = shared.parked.lock();
        *parked = Some(this);
    }

    fn fail(self: Box<Self>, error: SlotError) {
        self.shared.connected.fail(error);
        (*self).finish();
    }
}
