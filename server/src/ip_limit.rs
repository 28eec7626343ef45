//! Per-IP concurrent connection accounting.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// Counts open connections per remote address.
///
/// Counting always happens; the cap is only enforced when `enforce` is set
/// (hardening mode).
#[derive(Debug, Clone)]
pub struct IpConnectionLimiter {
    counts: Arc<DashMap<IpAddr, usize>>,
    max_per_ip: usize,
    enforce: bool,
}

impl IpConnectionLimiter {
    pub fn new(max_per_ip: usize, enforce: bool) -> Self {
        Self {
            counts: Arc::new(DashMap::new()),
            max_per_ip,
            enforce,
        }
    }

    /// Reserves a connection slot for `ip`.
    ///
    /// Returns `None` when the cap is enforced and already reached. The slot
    /// is released when the returned guard is dropped.
    pub fn try_acquire(&self, ip: IpAddr) -> Option<IpSlot> {
        let mut count = self.counts.entry(ip).or_insert(0);
        if self.enforce && *count >= self.max_per_ip {
            debug!(%ip, open = *count, max = self.max_per_ip, "Per-IP connection cap reached");
            return None;
        }
        *count += 1;
        drop(count);

        Some(IpSlot {
            counts: Arc::clone(&self.counts),
            ip,
        })
    }

    /// Open connections from `ip`.
    pub fn count(&self, ip: IpAddr) -> usize {
        self.counts.get(&ip).map_or(0, |count| *count)
    }

    /// Number of addresses with at least one open connection.
    #[cfg(test)]
    pub(crate) fn tracked_addresses(&self) -> usize {
        self.counts.len()
    }
}

/// A reserved connection slot. Releases itself on drop.
#[derive(Debug)]
pub struct IpSlot {
    counts: Arc<DashMap<IpAddr, usize>>,
    ip: IpAddr,
}

impl IpSlot {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for IpSlot {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(&self.ip, |_, count| *count == 0);
    }
}
