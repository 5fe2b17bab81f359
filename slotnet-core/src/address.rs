//! Channel addresses.
//!
//! A plain channel connects to one socket address. A group channel connects
//! each member to its own address, taken in order from a [`GroupAddress`].

use crate::error::{Result, SlotError};
use smallvec::SmallVec;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// Ordered, immutable list of member addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAddress {
    members: SmallVec<[SocketAddr; 4]>,
}

impl GroupAddress {
    /// Start an incremental builder.
    pub fn builder() -> GroupAddressBuilder {
        GroupAddressBuilder::default()
    }

    /// `count` consecutive ports on one host, starting at `base`.
    pub fn consecutive(base: SocketAddr, count: usize) -> Result<Self> {
        let mut builder = Self::builder();
        for i in 0..count {
            let port = u16::try_from(usize::from(base.port()) + i)
                .map_err(|_| SlotError::config(format!("port range overflows at member {i}")))?;
            builder = builder.add(SocketAddr::new(base.ip(), port));
        }
        builder.build()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<SocketAddr> {
        self.members.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.members.iter().copied()
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, addr) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("]")
    }
}

/// Collects member addresses until [`build`](GroupAddressBuilder::build).
#[derive(Debug, Default)]
pub struct GroupAddressBuilder {
    members: SmallVec<[SocketAddr; 4]>,
}

impl GroupAddressBuilder {
    pub fn add(mut self, addr: SocketAddr) -> Self {
        self.members.push(addr);
        self
    }

    /// Resolve `addr` and add its first address.
    pub fn resolve(self, addr: impl ToSocketAddrs) -> Result<Self> {
        let resolved = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SlotError::config("address resolved to nothing"))?;
        Ok(self.add(resolved))
    }

    pub fn build(self) -> Result<GroupAddress> {
        if self.members.is_empty() {
            return Err(SlotError::config("group address needs at least one member"));
        }
        Ok(GroupAddress { members: self.members })
    }
}

/// Target of a channel or group connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    Socket(SocketAddr),
    Group(GroupAddress),
}

impl ChannelAddress {
    /// Number of physical connections this address names.
    pub fn width(&self) -> usize {
        match self {
            Self::Socket(_) => 1,
            Self::Group(group) => group.len(),
        }
    }
}

impl From<SocketAddr> for ChannelAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

impl From<GroupAddress> for ChannelAddress {
    fn from(group: GroupAddress) -> Self {
        Self::Group(group)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{addr}"),
            Self::Group(group) => write!(f, "{group}"),
        }
    }
}
