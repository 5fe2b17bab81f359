//! Pool, channel and group configuration.
//!
//! Builder-style option structs. Each exposes public fields with documented
//! defaults plus `with_*` setters, and a `validate()` that channels and pools
//! call before using them.

use crate::codec::{CodecKind, DeflateCodec, DEFAULT_FRAME_LIMIT};
use crate::error::{Result, SlotError};
use std::time::Duration;

/// How a pool picks the worker for a newly registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignment {
    /// Rotate through the workers.
    #[default]
    RoundRobin,
    /// Pick the worker currently hosting the fewest channels.
    LeastLoaded,
}

/// Selector pool options.
///
/// # Examples
///
/// ```
/// use slotnet_core::options::{Assignment, PoolOptions};
/// use std::time::Duration;
///
/// let opts = PoolOptions::default()
///     .with_threads(2)
///     .with_poll_timeout(Duration::from_millis(50))
///     .with_assignment(Assignment::LeastLoaded);
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Thread name prefix; workers are named `{name}-{index}`.
    pub name: String,

    /// Number of reactor threads.
    /// - Default: number of logical CPUs
    pub threads: usize,

    /// Upper bound on a single readiness wait.
    ///
    /// Commands are also delivered through a waker, so this only bounds how
    /// long shutdown can take if a wakeup is lost.
    /// - Default: 100ms
    pub poll_timeout: Duration,

    /// Readiness events handled per poll round.
    /// - Default: 1024
    pub events_capacity: usize,

    /// Worker selection strategy.
    pub assignment: Assignment,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            name: "slotnet".to_owned(),
            threads: num_cpus::get(),
            poll_timeout: Duration::from_millis(100),
            events_capacity: 1024,
            assignment: Assignment::RoundRobin,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.assignment = assignment;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(SlotError::config("pool needs at least one thread"));
        }
        if self.events_capacity == 0 {
            return Err(SlotError::config("events capacity must be at least 1"));
        }
        if self.poll_timeout.is_zero() {
            return Err(SlotError::config("poll timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Per-channel options.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Slots in each of the input and output rings.
    /// - Default: 64
    pub capacity: usize,

    /// Maximum payload bytes per message; also the ring slot length.
    /// - Default: 1024
    pub message_length: usize,

    /// Wire framing.
    /// - Default: [`CodecKind::Deflate`]
    pub codec: CodecKind,

    /// Bytes read from the socket per syscall.
    /// - Default: 8192 (8KB)
    pub read_buffer_size: usize,

    /// Initial capacity of the encoded write buffer.
    /// - Default: 8192 (8KB)
    pub write_buffer_size: usize,

    /// Disable Nagle's algorithm (TCP_NODELAY).
    /// - Default: true
    pub nodelay: bool,

    /// Set SO_REUSEADDR before binding.
    /// - Default: true
    pub reuse_address: bool,

    /// Listen backlog for server channels.
    /// - Default: 128
    pub backlog: i32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            capacity: 64,
            message_length: 1024,
            codec: CodecKind::Deflate,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            nodelay: true,
            reuse_address: true,
            backlog: 128,
        }
    }
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_message_length(mut self, length: usize) -> Self {
        self.message_length = length;
        self
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set both socket buffer sizes at once.
    pub fn with_buffer_sizes(mut self, read_size: usize, write_size: usize) -> Self {
        self.read_buffer_size = read_size;
        self.write_buffer_size = write_size;
        self
    }

    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Reject option combinations no codec or ring can honour.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(SlotError::config("ring capacity must be at least 1"));
        }
        if self.message_length == 0 {
            return Err(SlotError::config("message length must be at least 1"));
        }
        if self.codec == CodecKind::Deflate
            && self.message_length > DeflateCodec::max_body_length(DEFAULT_FRAME_LIMIT)
        {
            return Err(SlotError::config(format!(
                "message length {} exceeds the compressed frame limit",
                self.message_length
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(SlotError::config("read buffer size must be at least 1"));
        }
        if self.backlog < 1 {
            return Err(SlotError::config("listen backlog must be at least 1"));
        }
        Ok(())
    }
}

/// What a group does when a member cannot take a copy of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Every member must accept the message; a closed member fails the group.
    #[default]
    All,
    /// Deliver to whichever members are still open; fail only when none are.
    Available,
}

/// Group channel options.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Number of member channels.
    /// - Default: 2
    pub size: usize,

    pub policy: DeliveryPolicy,

    /// Options applied to every member, and to the group's own rings.
    pub channel: ChannelOptions,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            size: 2,
            policy: DeliveryPolicy::All,
            channel: ChannelOptions::default(),
        }
    }
}

impl GroupOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_channel(mut self, channel: ChannelOptions) -> Self {
        self.channel = channel;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(SlotError::config("group needs at least one member"));
        }
        self.channel.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PoolOptions::default().validate().is_ok());
        assert!(ChannelOptions::default().validate().is_ok());
        assert!(GroupOptions::default().validate().is_ok());
        assert!(PoolOptions::default().threads >= 1);
    }

    #[test]
    fn builders_apply() {
        let opts = ChannelOptions::new()
            .with_capacity(8)
            .with_message_length(512)
            .with_codec(CodecKind::Checksum)
            .with_buffer_sizes(4096, 2048)
            .with_nodelay(false);
        assert_eq!(opts.capacity, 8);
        assert_eq!(opts.message_length, 512);
        assert_eq!(opts.codec, CodecKind::Checksum);
        assert_eq!((opts.read_buffer_size, opts.write_buffer_size), (4096, 2048));
        assert!(!opts.nodelay);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(PoolOptions::new().with_threads(0).validate().is_err());
        assert!(ChannelOptions::new().with_capacity(0).validate().is_err());
        assert!(ChannelOptions::new().with_message_length(0).validate().is_err());
        assert!(ChannelOptions::new().with_message_length(70_000).validate().is_err());
        assert!(ChannelOptions::new()
            .with_codec(CodecKind::Length)
            .with_message_length(70_000)
            .validate()
            .is_ok());
        assert!(GroupOptions::new(0).validate().is_err());
    }
}
