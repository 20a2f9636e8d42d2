//! Node-count budgets for residency and per-cycle uploads
//!
//! Budgets here count nodes rather than bytes. Host memory is the only
//! byte budget and is converted to a slot count once.

/// A limit on how many nodes may be in use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeBudget {
    limit: usize,
    used: usize,
}

impl NodeBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    /// Whether `count` more nodes fit
    pub fn fits(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Take `count` nodes if they fit
    pub fn try_take(&mut self, count: usize) -> bool {
        if !self.fits(count) {
            return false;
        }
        self.used += count;
        true
    }

    /// Give back `count` nodes
    pub fn give_back(&mut self, count: usize) {
        self.used = self.used.saturating_sub(count);
    }
}

/// Number of host cache slots that fit in `budget_bytes`
pub fn host_slot_count(budget_bytes: usize, node_bytes: usize) -> usize {
    if node_bytes == 0 {
        return 0;
    }
    budget_bytes / node_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_take_and_give_back() {
        let mut budget = NodeBudget::new(10);
        assert!(budget.try_take(4));
        assert!(budget.try_take(6));
        assert!(!budget.try_take(1));
        assert_eq!(budget.remaining(), 0);

        budget.give_back(4);
        assert_eq!(budget.remaining(), 4);
        assert!(budget.fits(4));
        assert!(!budget.fits(5));
    }

    #[test]
    fn test_budget_rejected_take_leaves_usage() {
        let mut budget = NodeBudget::new(3);
        budget.try_take(2);
        assert!(!budget.try_take(2));
        assert_eq!(budget.remaining(), 1);
    }

    #[test]
    fn test_budget_give_back_saturates() {
        let mut budget = NodeBudget::new(5);
        budget.try_take(2);
        budget.give_back(10);
        assert_eq!(budget.remaining(), 5);
    }

    #[test]
    fn test_host_slot_count() {
        assert_eq!(host_slot_count(1024, 100), 10);
        assert_eq!(host_slot_count(1024, 0), 0);
        assert_eq!(host_slot_count(50, 100), 0);
    }
}
