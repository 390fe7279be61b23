//! Port leasing
//!
//! Ports are leased from a contiguous range, round-robin, so that a port
//! just released is not immediately handed out again.

use std::collections::{HashMap, HashSet};

/// Pool of ports leased to applications
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    len: u16,
    next: u16,
    leased: HashMap<u16, i32>,
    unavailable: HashSet<u16>,
}

impl PortPool {
    /// Create a pool over `start..start + len`
    pub fn new(start: u16, len: u16) -> Self {
        // Clamp the range inside the u16 space.
        let len = len.min(u16::MAX - start);
        Self {
            start,
            len,
            next: 0,
            leased: HashMap::new(),
            unavailable: HashSet::new(),
        }
    }

    /// Lease a free port to `owner`
    pub fn lease(&mut self, owner: i32) -> Option<u16> {
        for _ in 0..self.len {
            let port = self.start + self.next;
            self.next = (self.next + 1) % self.len;

            if !self.leased.contains_key(&port) && !self.unavailable.contains(&port) {
                self.leased.insert(port, owner);
                return Some(port);
            }
        }
        None
    }

    /// Give a port back, returns false if `owner` did not lease it
    pub fn release(&mut self, owner: i32, port: u16) -> bool {
        if self.leased.get(&port) == Some(&owner) {
            self.leased.remove(&port);
            true
        } else {
            false
        }
    }

    /// Mark a leased port as never leasable again
    pub fn mark_unavailable(&mut self, owner: i32, port: u16) -> bool {
        if self.release(owner, port) {
            self.unavailable.insert(port);
            true
        } else {
            false
        }
    }

    /// Release every port leased by `owner`
    pub fn release_owner(&mut self, owner: i32) -> usize {
        let before = self.leased.len();
        self.leased.retain(|_, o| *o != owner);
        before - self.leased.len()
    }

    /// Number of leased ports
    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }

    /// Number of ports that can still be leased
    pub fn available_count(&self) -> usize {
        usize::from(self.len) - self.leased.len() - self.unavailable.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_round_robin() {
        let mut pool = PortPool::new(8000, 3);

        assert_eq!(pool.lease(1), Some(8000));
        assert_eq!(pool.lease(1), Some(8001));
        assert!(pool.release(1, 8000));
        assert_eq!(pool.lease(2), Some(8002));
        assert_eq!(pool.lease(2), Some(8000));
        assert_eq!(pool.lease(2), None);
    }

    #[test]
    fn test_release_checks_owner() {
        let mut pool = PortPool::new(8000, 2);
        let port = pool.lease(1).unwrap();

        assert!(!pool.release(2, port));
        assert!(pool.release(1, port));
        assert!(!pool.release(1, port));
    }

    #[test]
    fn test_unavailable_port_skipped() {
        let mut pool = PortPool::new(8000, 2);

        assert_eq!(pool.lease(1), Some(8000));
        assert!(pool.mark_unavailable(1, 8000));
        assert_eq!(pool.available_count(), 2 - 1);
        assert_eq!(pool.lease(1), Some(8001));
        assert_eq!(pool.lease(1), None);
    }

    #[test]
    fn test_release_owner() {
        let mut pool = PortPool::new(8000, 4);
        pool.lease(1);
        pool.lease(2);
        pool.lease(1);

        assert_eq!(pool.release_owner(1), 2);
        assert_eq!(pool.leased_count(), 1);
    }
}
