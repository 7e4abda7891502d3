//! Bounded cache of processed packet ids.

use std::collections::{HashSet, VecDeque};

use crate::envelope::DedupKey;

/// Remembers the last `capacity` accepted packets of one chat
///
/// Oldest entries are evicted first.
#[derive(Debug)]
pub struct ProcessedPackets {
    capacity: usize,
    order: VecDeque<DedupKey>,
    seen: HashSet<DedupKey>,
}

impl ProcessedPackets {
    /// Empty cache holding at most `capacity` keys (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Whether `key` was recorded and not yet evicted
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    /// Record `key`; returns `false` if it was already present
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, SessionMsgEnvelope};

    fn key(n: u8) -> DedupKey {
        Envelope::Session(SessionMsgEnvelope {
            iv: vec![n; 16],
            ct: vec![],
            sig: vec![n; 64],
        })
        .dedup_key()
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut cache = ProcessedPackets::new(4);
        assert!(cache.insert(key(1)));
        assert!(!cache.insert(key(1)));
        assert!(cache.contains(&key(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oldest_evicted() {
        let mut cache = ProcessedPackets::new(2);
        cache.insert(key(1));
        cache.insert(key(2));
        cache.insert(key(3));

        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = ProcessedPackets::new(0);
        assert!(cache.is_empty());
        cache.insert(key(1));
        cache.insert(key(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key(2)));
    }
}
