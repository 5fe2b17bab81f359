//! Selector pool: a fixed set of reactor threads.
//!
//! Each worker owns a private `mio::Poll` and the drivers of the channels
//! assigned to it. Other threads never touch a driver; they enqueue a
//! [`Command`] on the worker's queue and wake its poll.
//!
//! ```text
//!   app threads ──Command──▶ flume queue ──▶ worker loop
//!                                   │
//!                       poll(timeout) → dispatch events → drain queue
//! ```

use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use slotnet_core::completion::Completion;
use slotnet_core::error::{Result, SlotError};
use slotnet_core::options::{Assignment, PoolOptions};
use hashbrown::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Token reserved for the worker's own waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Requests delivered to a worker thread.
pub(crate) enum Command {
    Register(Token, Box<dyn Driver>),
    /// Rings made progress: flush output and resume paused input.
    Wake(Token),
    /// Close the channel. The target is used when the driver has already
    /// been parked by pool shutdown.
    Close(Token, Arc<dyn Detachable>),
    Shutdown,
}

/// Whether a driver stays registered after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Keep,
    /// The connection is over; the worker removes the driver and closes it.
    Done,
}

/// Per-connection state machine owned by exactly one worker.
pub(crate) trait Driver: Send {
    /// Register the socket. Runs on the worker thread.
    fn register(&mut self, registry: &Registry, token: Token) -> Result<Step>;

    /// Handle one readiness event.
    fn ready(&mut self, registry: &Registry, event: &Event) -> Step;

    /// Handle a [`Command::Wake`].
    fn wake(&mut self, registry: &Registry) -> Step;

    /// Explicit close: deregister, release the socket, signal closed.
    fn close(self: Box<Self>, registry: &Registry);

    /// Pool shutdown: deregister and park the driver with its channel so the
    /// channel can finish its own close later.
    fn detach(self: Box<Self>, registry: &Registry);

    /// The driver never made it onto a worker.
    fn fail(self: Box<Self>, error: SlotError);
}

/// A channel whose driver may be parked outside any worker.
pub(crate) trait Detachable: Send + Sync {
    fn close_detached(&self);
}

/// Handle on one worker, used to submit commands to it.
#[derive(Clone)]
pub(crate) struct Reactor {
    index: usize,
    commands: flume::Sender<Command>,
    waker: Arc<Waker>,
    load: Arc<AtomicUsize>,
}

impl Reactor {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Enqueue `command` and wake the worker. Hands the command back if the
    /// worker has exited.
    pub(crate) fn submit(&self, command: Command) -> std::result::Result<(), Command> {
        self.commands.send(command).map_err(|e| e.into_inner())?;
        if let Err(e) = self.waker.wake() {
            warn!(worker = self.index, "[POOL] Failed to wake worker: {}", e);
        }
        Ok(())
    }

    /// Register `driver` on this worker, failing it inline if the worker is gone.
    pub(crate) fn register(&self, token: Token, driver: Box<dyn Driver>) {
        if let Err(Command::Register(_, driver)) = self.submit(Command::Register(token, driver)) {
            self.load.fetch_sub(1, Ordering::AcqRel);
            driver.fail(SlotError::Closed);
        }
    }
}

struct PoolInner {
    name: String,
    workers: Vec<Reactor>,
    assignment: Assignment,
    next_worker: AtomicUsize,
    next_token: AtomicUsize,
    open: AtomicBool,
    closed: Completion,
}

/// Fixed pool of reactor threads shared by any number of channels.
///
/// Cloning the pool clones a handle; all clones drive the same workers.
#[derive(Clone)]
pub struct SelectorPool {
    inner: Arc<PoolInner>,
}

impl SelectorPool {
    /// Start the worker threads.
    pub fn open(options: PoolOptions) -> Result<Self> {
        options.validate()?;
        debug!(name = %options.name, threads = options.threads, "[POOL] Starting workers");

        let closed = Completion::new();
        let running = Arc::new(AtomicUsize::new(options.threads));
        let mut workers = Vec::with_capacity(options.threads);

        for index in 0..options.threads {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (tx, rx) = flume::unbounded();
            let load = Arc::new(AtomicUsize::new(0));

            let worker = Worker {
                index,
                poll,
                commands: rx,
                drivers: HashMap::new(),
                load: Arc::clone(&load),
                poll_timeout: options.poll_timeout,
                events_capacity: options.events_capacity,
            };
            let running = Arc::clone(&running);
            let closed = closed.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", options.name, index))
                .spawn(move || {
                    worker.run();
                    if running.fetch_sub(1, Ordering::AcqRel) == 1 {
                        debug!("[POOL] All workers exited");
                        closed.succeed();
                    }
                });
            let reactor = Reactor {
                index,
                commands: tx,
                waker,
                load,
            };
            if let Err(e) = spawned {
                for started in &workers {
                    let _ = Reactor::submit(started, Command::Shutdown);
                }
                return Err(e.into());
            }
            workers.push(reactor);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: options.name,
                workers,
                assignment: options.assignment,
                next_worker: AtomicUsize::new(0),
                next_token: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                closed,
            }),
        })
    }

    /// Pick a worker for a new channel and reserve a token on it.
    pub(crate) fn assign(&self) -> Result<(Token, Reactor)> {
        if !self.is_open() {
            return Err(SlotError::Closed);
        }
        let workers = &self.inner.workers;
        let reactor = match self.inner.assignment {
            Assignment::RoundRobin => {
                let next = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
                &workers[next % workers.len()]
            }
            Assignment::LeastLoaded => workers
                .iter()
                .min_by_key(|w| w.load.load(Ordering::Acquire))
                .ok_or_else(|| SlotError::bug("pool has no workers"))?,
        };
        reactor.load.fetch_add(1, Ordering::AcqRel);
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        trace!(token = token.0, worker = reactor.index, "[POOL] Assigned channel");
        Ok((token, reactor.clone()))
    }

    /// Stop accepting registrations and shut every worker down.
    ///
    /// Idempotent. The returned completion fires once every worker thread has
    /// exited. Channels still registered are detached, not closed.
    pub fn close(&self) -> Completion {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            debug!(name = %self.inner.name, "[POOL] Closing");
            for worker in &self.inner.workers {
                if worker.submit(Command::Shutdown).is_err() {
                    trace!(worker = worker.index, "[POOL] Worker already gone");
                }
            }
        }
        self.inner.closed.clone()
    }

    pub fn close_completion(&self) -> Completion {
        self.inner.closed.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Channels currently hosted by each worker.
    pub fn worker_loads(&self) -> Vec<usize> {
        self.inner
            .workers
            .iter()
            .map(|w| w.load.load(Ordering::Acquire))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl std::fmt::Debug for SelectorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorPool")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers.len())
            .field("open", &self.is_open())
            .finish()
    }
}

struct Worker {
    index: usize,
    poll: Poll,
    commands: flume::Receiver<Command>,
    drivers: HashMap<Token, Box<dyn Driver>>,
    load: Arc<AtomicUsize>,
    poll_timeout: Duration,
    events_capacity: usize,
}

impl Worker {
    fn run(mut self) {
        debug!(worker = self.index, "[POOL] Worker started");
        let mut events = Events::with_capacity(self.events_capacity);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, "[POOL] Poll failed: {}", e);
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let registry = self.poll.registry();
                let step = match self.drivers.get_mut(&token) {
                    Some(driver) => driver.ready(registry, event),
                    None => continue,
                };
                if step == Step::Done {
                    self.retire(token);
                }
            }
            if !self.drain() {
                break;
            }
        }
        self.shutdown();
    }

    /// Process queued commands. Returns `false` on shutdown.
    fn drain(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            let registry = self.poll.registry();
            match command {
                Command::Register(token, mut driver) => match driver.register(registry, token) {
                    Ok(Step::Keep) => {
                        trace!(worker = self.index, token = token.0, "[POOL] Registered");
                        self.drivers.insert(token, driver);
                    }
                    Ok(Step::Done) => {
                        driver.close(registry);
                        self.load.fetch_sub(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        debug!(worker = self.index, token = token.0, "[POOL] Registration failed: {}", e);
                        driver.fail(e);
                        self.load.fetch_sub(1, Ordering::AcqRel);
                    }
                },
                Command::Wake(token) => {
                    let step = match self.drivers.get_mut(&token) {
                        Some(driver) => driver.wake(registry),
                        None => continue,
                    };
                    if step == Step::Done {
                        self.retire(token);
                    }
                }
                Command::Close(token, _) => self.retire(token),
                Command::Shutdown => return false,
            }
        }
        true
    }

    /// Remove and close one driver.
    fn retire(&mut self, token: Token) {
        if let Some(driver) = self.drivers.remove(&token) {
            driver.close(self.poll.registry());
            self.load.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn shutdown(mut self) {
        let registry = self.poll.registry();
        let detached = self.drivers.len();
        for (_, driver) in self.drivers.drain() {
            driver.detach(registry);
        }
        self.load.store(0, Ordering::Release);

        // Anything enqueued before the queue goes away still gets an answer.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Register(_, driver) => driver.fail(SlotError::Closed),
                Command::Close(_, target) => target.close_detached(),
                Command::Wake(_) | Command::Shutdown => {}
            }
        }
        debug!(worker = self.index, detached, "[POOL] Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(threads: usize) -> PoolOptions {
        PoolOptions::new()
            .with_name("pool-test")
            .with_threads(threads)
            .with_poll_timeout(Duration::from_millis(20))
    }

    #[test]
    fn rejects_zero_threads() {
        assert!(SelectorPool::open(options(0)).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let pool = SelectorPool::open(options(3)).unwrap();
        assert_eq!(pool.worker_count(), 3);
        assert!(pool.is_open());
        let first = pool.close();
        let second = pool.clone().close();
        assert!(first.same(&second));
        assert!(first.get_timeout(Duration::from_secs(5)).is_ok());
        assert!(!pool.is_open());
        assert!(matches!(pool.assign(), Err(SlotError::Closed)));
    }

    #[test]
    fn round_robin_rotates() {
        let pool = SelectorPool::open(options(2)).unwrap();
        let picks: Vec<usize> = (0..4).map(|_| pool.assign().unwrap().1.index()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
        assert_eq!(pool.worker_loads(), vec![2, 2]);
        pool.close().get().unwrap();
    }

    #[test]
    fn least_loaded_spreads() {
        let pool = SelectorPool::open(options(3).with_assignment(Assignment::LeastLoaded)).unwrap();
        let mut picks: Vec<usize> = (0..3).map(|_| pool.assign().unwrap().1.index()).collect();
        picks.sort_unstable();
        assert_eq!(picks, vec![0, 1, 2]);
        pool.close().get().unwrap();
    }

    #[test]
    fn tokens_are_unique() {
        let pool = SelectorPool::open(options(2)).unwrap();
        let a = pool.assign().unwrap().0;
        let b = pool.assign().unwrap().0;
        assert_ne!(a, b);
        assert_ne!(a, WAKE_TOKEN);
        pool.close().get().unwrap();
    }
}
