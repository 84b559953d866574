//! Deduplicated, size-capped set of original source IPs

use std::collections::BTreeSet;
use std::net::IpAddr;

/// Keeps at most `max_size` distinct addresses while counting every distinct
/// address seen, including the ones that did not fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedSet {
    max_size: usize,
    items: BTreeSet<IpAddr>,
    total_count: usize,
}

impl BoundedSet {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            items: BTreeSet::new(),
            total_count: 0,
        }
    }

    /// Build from observed addresses, overriding the total when the source
    /// knows of more addresses than it sent.
    pub fn from_slice_with_total_count(max_size: usize, ips: &[IpAddr], total_count: usize) -> Self {
        let mut set = Self::new(max_size);
        for ip in ips {
            set.add(*ip);
        }
        set.total_count = set.total_count.max(total_count);
        set
    }

    pub fn add(&mut self, ip: IpAddr) {
        if self.items.contains(&ip) {
            return;
        }
        self.total_count += 1;
        if self.items.len() < self.max_size {
            self.items.insert(ip);
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.items.contains(ip)
    }

    pub fn combine(&mut self, other: &BoundedSet) {
        for ip in &other.items {
            self.add(*ip);
        }
        self.increase_total_count(other.total_count.saturating_sub(other.items.len()));
    }

    pub fn increase_total_count(&mut self, by: usize) {
        self.total_count += by;
    }

    pub fn reset(&mut self) {
        self.items.clear();
        self.total_count = 0;
    }

    pub fn to_ips(&self) -> Vec<IpAddr> {
        self.items.iter().copied().collect()
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.total_count == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
