//! Routing Channel Allocation
//!
//! Hands out hardware interconnect (PPI/DPPI) channels to connections that
//! need a radio event routed straight into a peripheral task. The pool is a
//! contiguous channel range tracked by an atomic bitmask, so allocation and
//! release are lock-free and usable from any priority.

use core::sync::atomic::{AtomicU32, Ordering};

/// Widest channel range a single pool can track
pub const MAX_POOL_CHANNELS: u8 = 32;

/// Exclusively owned hardware routing channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RoutingChannel(u8);

impl RoutingChannel {
    pub const fn new(number: u8) -> Self {
        Self(number)
    }

    /// Hardware channel number
    pub const fn number(self) -> u8 {
        self.0
    }
}

/// Channel allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError {
    /// Every channel in the pool is in use
    Exhausted,
    /// Released a channel this pool never handed out
    NotAllocated,
}

/// Source of routing channels
pub trait ChannelAllocator {
    /// Reserve a free channel
    fn alloc_channel(&self) -> Result<RoutingChannel, ChannelError>;

    /// Return a channel obtained from [`alloc_channel`](Self::alloc_channel).
    /// Released channels are immediately eligible for reuse.
    fn free_channel(&self, channel: RoutingChannel) -> Result<(), ChannelError>;
}

/// Fixed pool over channels `first..first + count`
pub struct ChannelPool {
    first: u8,
    count: u8,
    used: AtomicU32,
}

impl ChannelPool {
    /// Create a pool. `count` is clamped to [`MAX_POOL_CHANNELS`] and to the
    /// channel numbers left above `first`.
    pub const fn new(first: u8, count: u8) -> Self {
        let count = if count > MAX_POOL_CHANNELS {
            MAX_POOL_CHANNELS
        } else {
            count
        };
        let room = u8::MAX - first;
        let count = if count > room { room + 1 } else { count };
        Self {
            first,
            count,
            used: AtomicU32::new(0),
        }
    }

    /// Number of channels managed by this pool
    pub fn capacity(&self) -> usize {
        self.count as usize
    }

    /// Number of channels currently free
    pub fn available(&self) -> usize {
        let used = self.used.load(Ordering::Acquire) & self.mask();
        self.capacity() - used.count_ones() as usize
    }

    /// Check whether `channel` is currently handed out
    pub fn is_allocated(&self, channel: RoutingChannel) -> bool {
        match self.bit(channel) {
            Some(bit) => self.used.load(Ordering::Acquire) & bit != 0,
            None => false,
        }
    }

    fn mask(&self) -> u32 {
        if self.count >= MAX_POOL_CHANNELS {
            u32::MAX
        } else {
            (1u32 << self.count) - 1
        }
    }

    fn bit(&self, channel: RoutingChannel) -> Option<u32> {
        let offset = channel.number().checked_sub(self.first)?;
        if offset < self.count {
            Some(1u32 << offset)
        } else {
            None
        }
    }
}

impl ChannelAllocator for ChannelPool {
    fn alloc_channel(&self) -> Result<RoutingChannel, ChannelError> {
        let mask = self.mask();
        let mut current = self.used.load(Ordering::Acquire);

        loop {
            let free = !current & mask;
            if free == 0 {
                return Err(ChannelError::Exhausted);
            }

            // Lowest free channel first
            let offset = free.trailing_zeros();
            let claimed = current | (1u32 << offset);

            match self
                .used
                .compare_exchange_weak(current, claimed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(RoutingChannel::new(self.first + offset as u8)),
                Err(actual) => current = actual,
            }
        }
    }

    fn free_channel(&self, channel: RoutingChannel) -> Result<(), ChannelError> {
        let bit = self.bit(channel).ok_or(ChannelError::NotAllocated)?;
        let previous = self.used.fetch_and(!bit, Ordering::AcqRel);

        if previous & bit == 0 {
            return Err(ChannelError::NotAllocated);
        }

        Ok(())
    }
}
