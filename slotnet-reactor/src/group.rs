//! Group channels: one logical channel over N member connections.
//!
//! ```text
//!                          ┌─▶ member 0 output ──▶ socket 0
//!  app ─▶ group output ─▶ fan-out ─┼─▶ member 1 output ──▶ socket 1
//!                          └─▶ ...
//!
//!  socket i ─▶ member i input ─▶ [merger] ─▶ group input ─▶ app
//! ```
//!
//! The group output is a forwarding ring: releasing a slot copies the message
//! into every member output ring before the release returns, so a write the
//! delivery policy cannot honour fails at the caller. The merger thread is the
//! only consumer of every member input ring and the only producer of the
//! group input ring. Every ring keeps exactly one producer and one consumer.
//!
//! Inbound messages are forwarded in first-arrival order. Copies of the same
//! message sent back by several members are all delivered; callers that need
//! exactly-once delivery across members must de-duplicate themselves.

use crate::channel::{Channel, ChannelState, MessageChannel};
use crate::pool::SelectorPool;
use bytes::BufMut;
use parking_lot::{Condvar, Mutex};
use slotnet_core::address::{ChannelAddress, GroupAddress};
use slotnet_core::buffer::{BufferConsumer, BufferHandle, BufferProducer, MessageBuffer};
use slotnet_core::completion::Completion;
use slotnet_core::error::{Result, SlotError};
use slotnet_core::options::{DeliveryPolicy, GroupOptions};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// Level-triggered wakeup for the merger thread.
#[derive(Default)]
struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn raise(&self) {
        *self.raised.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut raised = self.raised.lock();
        while !*raised {
            self.cond.wait(&mut raised);
        }
        *raised = false;
    }
}

/// Copies each group write into the member output rings.
struct FanOut {
    policy: DeliveryPolicy,
    members: Vec<BufferProducer>,
}

impl FanOut {
    fn deliver(&mut self, message: &[u8]) -> Result<()> {
        if self.policy == DeliveryPolicy::All {
            if let Some(index) = self.members.iter().position(BufferProducer::is_closed) {
                debug!(member = index, "[GROUP] Member closed, refusing write");
                return Err(SlotError::Closed);
            }
        }
        let mut delivered = 0;
        for (index, member) in self.members.iter_mut().enumerate() {
            if self.policy == DeliveryPolicy::Available && member.is_closed() {
                continue;
            }
            match member.send(message) {
                Ok(()) => delivered += 1,
                Err(e) if self.policy == DeliveryPolicy::All => {
                    debug!(member = index, "[GROUP] Member rejected write: {}", e);
                    return Err(e);
                }
                Err(e) => trace!(member = index, "[GROUP] Skipping member: {}", e),
            }
        }
        if delivered == 0 {
            debug!("[GROUP] No open member left for write");
            return Err(SlotError::Closed);
        }
        Ok(())
    }
}

struct GroupShared {
    options: GroupOptions,
    members: Vec<Channel>,
    state: AtomicU8,
    output: Mutex<Option<BufferProducer>>,
    input: Mutex<Option<BufferConsumer>>,
    output_ring: BufferHandle,
    input_ring: BufferHandle,
    signal: Arc<Signal>,
    connected: Completion,
    closed: Completion,
}

impl GroupShared {
    fn state(&self) -> ChannelState {
        // Group and channel states share one encoding.
        match self.state.load(Ordering::Acquire) {
            0 => ChannelState::Unconnected,
            1 => ChannelState::Connecting,
            3 => ChannelState::Open,
            4 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
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
            if self.transition(current, ChannelState::Closing) {
                break;
            }
        }
        debug!(members = self.members.len(), "[GROUP] Closing");
        self.output_ring.close();
        self.input_ring.close();
        self.signal.raise();
        self.connected.fail(SlotError::Cancelled);

        let closes: Vec<Completion> = self.members.iter().map(Channel::close).collect();
        let this = Arc::clone(self);
        Completion::all(closes).on_complete(move |_| {
            this.state.store(ChannelState::Closed as u8, Ordering::Release);
            if this.closed.succeed() {
                debug!(members = this.members.len(), "[GROUP] Closed");
            }
        });
        self.closed.clone()
    }
}

/// A logical channel replicated over several member [`Channel`]s.
#[derive(Clone)]
pub struct GroupChannel {
    shared: Arc<GroupShared>,
}

impl GroupChannel {
    /// Open `options.size` member channels on `pool` and start the merger
    /// thread.
    pub fn open(pool: &SelectorPool, options: GroupOptions) -> Result<Self> {
        options.validate()?;
        let capacity = options.channel.capacity;
        let length = options.channel.message_length;

        let mut members = Vec::with_capacity(options.size);
        let mut member_outputs = Vec::with_capacity(options.size);
        let mut member_inputs = Vec::with_capacity(options.size);
        let signal = Arc::new(Signal::default());
        for _ in 0..options.size {
            let member = Channel::open(pool, options.channel.clone())?;
            let input = member.input_buffer()?;
            let hook = Arc::clone(&signal);
            input.on_available(Arc::new(move || hook.raise()))?;
            let hook = Arc::clone(&signal);
            input.on_close(Arc::new(move || hook.raise()))?;
            member_outputs.push(member.output_buffer()?);
            member_inputs.push(input);
            members.push(member);
        }

        let mut fan_out = FanOut {
            policy: options.policy,
            members: member_outputs,
        };
        let output = MessageBuffer::forwarding(
            length,
            Box::new(move |message: &[u8]| fan_out.deliver(message)),
        )?;
        let (inbound, input) = MessageBuffer::bounded(capacity, length)?;
        let hook = Arc::clone(&signal);
        inbound.on_close(Arc::new(move || hook.raise()))?;
        let shared = Arc::new(GroupShared {
            members,
            state: AtomicU8::new(ChannelState::Unconnected as u8),
            output_ring: output.handle(),
            input_ring: input.handle(),
            output: Mutex::new(Some(output)),
            input: Mutex::new(Some(input)),
            signal,
            connected: Completion::new(),
            closed: Completion::new(),
            options,
        });

        let merger = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-group-in", pool.name()))
            .spawn(move || merge(merger, inbound, member_inputs));
        if let Err(e) = spawned {
            shared.close();
            return Err(e.into());
        }

        debug!(members = shared.members.len(), policy = ?shared.options.policy, "[GROUP] Opened");
        Ok(Self { shared })
    }

    /// Connect member `i` to `address[i]`.
    ///
    /// Succeeds once every member is open. The first member failure fails
    /// the completion and closes the whole group.
    pub fn connect(&self, address: &GroupAddress) -> Completion {
        let shared = &self.shared;
        if address.len() != shared.members.len() {
            return Completion::failed(SlotError::config(format!(
                "group of {} members cannot connect to {} addresses",
                shared.members.len(),
                address.len()
            )));
        }
        if !shared.transition(ChannelState::Unconnected, ChannelState::Connecting) {
            return Completion::failed(SlotError::illegal_state(format!(
                "connect while {:?}",
                shared.state()
            )));
        }
        debug!(%address, "[GROUP] Connecting");

        let connects: Vec<Completion> = shared
            .members
            .iter()
            .zip(address.iter())
            .map(|(member, addr)| member.connect(addr))
            .collect();
        let this = Arc::clone(shared);
        Completion::all(connects).on_complete(move |outcome| match outcome {
            Ok(()) => {
                if this.transition(ChannelState::Connecting, ChannelState::Open) && this.connected.succeed() {
                    debug!(members = this.members.len(), "[GROUP] Open");
                }
            }
            Err(e) => {
                debug!("[GROUP] Member connect failed: {}", e);
                this.connected.fail(e.clone());
                this.close();
            }
        });
        shared.connected.clone()
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

    pub fn members(&self) -> &[Channel] {
        &self.shared.members
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.shared.options.policy
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

    pub fn close_completion(&self) -> Completion {
        self.shared.closed.clone()
    }
}

impl MessageChannel for GroupChannel {
    fn connect_to(&self, address: ChannelAddress) -> Completion {
        let group = match address {
            ChannelAddress::Group(group) => group,
            ChannelAddress::Socket(addr) => match GroupAddress::builder().add(addr).build() {
                Ok(group) => group,
                Err(e) => return Completion::failed(e),
            },
        };
        self.connect(&group)
    }

    fn close(&self) -> Completion {
        GroupChannel::close(self)
    }

    fn is_open(&self) -> bool {
        GroupChannel::is_open(self)
    }

    fn output_buffer(&self) -> Result<BufferProducer> {
        GroupChannel::output_buffer(self)
    }

    fn input_buffer(&self) -> Result<BufferConsumer> {
        GroupChannel::input_buffer(self)
    }

    fn connect_completion(&self) -> Completion {
        GroupChannel::connect_completion(self)
    }

    fn close_completion(&self) -> Completion {
        GroupChannel::close_completion(self)
    }
}

impl fmt::Debug for GroupChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupChannel")
            .field("members", &self.shared.members)
            .field("state", &self.state())
            .field("policy", &self.shared.options.policy)
            .finish()
    }
}

/// Forward member input into the group input ring, first arrival first.
fn merge(shared: Arc<GroupShared>, mut inbound: BufferProducer, mut members: Vec<BufferConsumer>) {
    let policy = shared.options.policy;
    let mut live = vec![true; members.len()];
    loop {
        let mut moved = false;
        for (index, member) in members.iter_mut().enumerate() {
            if !live[index] {
                continue;
            }
            match member.try_acquire() {
                Ok(Some(slot)) => {
                    let mut out = match inbound.acquire() {
                        Ok(out) => out,
                        Err(_) => {
                            trace!("[GROUP] Merger stopped");
                            return;
                        }
                    };
                    out.put_slice(&slot);
                    slot.release();
                    if let Err(e) = out.release() {
                        warn!(member = index, "[GROUP] Dropping inbound message: {}", e);
                    }
                    moved = true;
                }
                Ok(None) => {}
                Err(_) => {
                    live[index] = false;
                    debug!(member = index, "[GROUP] Member input closed");
                }
            }
        }

        let remaining = live.iter().filter(|open| **open).count();
        let lost = remaining < live.len();
        if (policy == DeliveryPolicy::All && lost) || remaining == 0 {
            if !shared.state().is_closing() {
                warn!(remaining, "[GROUP] Member closed, closing group");
                shared.close();
            }
            break;
        }
        if inbound.is_closed() {
            break;
        }
        if !moved {
            shared.signal.wait();
        }
    }
    trace!("[GROUP] Merger stopped");
}
