use alloy::primitives::U256;
use std::collections::{HashSet, VecDeque};

/// Bounded memory of the most recently accepted command ids
#[derive(Debug)]
pub struct RecentCommands {
    order: VecDeque<U256>,
    seen: HashSet<U256>,
    capacity: usize,
}

impl RecentCommands {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `cmd_id`; false if it is already in the window
    pub fn insert(&mut self, cmd_id: U256) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(cmd_id) {
            return false;
        }

        self.order.push_back(cmd_id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, cmd_id: &U256) -> bool {
        self.seen.contains(cmd_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_rejected_within_window() {
        let mut recent = RecentCommands::new(2);
        assert!(recent.insert(U256::from(1)));
        assert!(!recent.insert(U256::from(1)));
        assert!(recent.insert(U256::from(2)));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_oldest_evicted() {
        let mut recent = RecentCommands::new(2);
        recent.insert(U256::from(1));
        recent.insert(U256::from(2));
        recent.insert(U256::from(3));

        assert!(!recent.contains(&U256::from(1)));
        assert!(recent.contains(&U256::from(3)));
        assert!(recent.insert(U256::from(1)));
    }

    #[test]
    fn test_zero_capacity_disables_dedup() {
        let mut recent = RecentCommands::new(0);
        assert!(recent.insert(U256::from(7)));
        assert!(recent.insert(U256::from(7)));
        assert!(recent.is_empty());
    }
}
