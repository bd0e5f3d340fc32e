// hwstress-core/src/fault/history.rs
// Append-only fault history with FIFO eviction at a fixed capacity

use std::collections::VecDeque;

use crate::model::FaultRecord;

#[derive(Debug, Clone)]
pub struct FaultHistory {
    records: VecDeque<FaultRecord>,
    capacity: usize,
    evicted: u64,
}

impl FaultHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append `record`. Returns true if an older record was dropped for it.
    pub fn push(&mut self, record: FaultRecord) -> bool {
        let mut evicted = false;
        while self.records.len() >= self.capacity {
            self.records.pop_front();
            self.evicted += 1;
            evicted = true;
        }
        self.records.push_back(record);
        evicted
    }

    /// Point-in-time copy in insertion order
    pub fn snapshot(&self) -> Vec<FaultRecord> {
        self.records.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records dropped off the front since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FaultKind, FaultSpec, Severity};
    use proptest::prelude::*;

    fn record(target: &str) -> FaultRecord {
        FaultRecord::from_spec(&FaultSpec::new(FaultKind::TimingAnomaly, target, Severity::Low))
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut history = FaultHistory::new(3);
        for name in ["a", "b", "c"] {
            assert!(!history.push(record(name)));
        }
        assert!(history.push(record("d")));
        let targets: Vec<String> = history.snapshot().into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["b", "c", "d"]);
        assert_eq!(history.evicted(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut history = FaultHistory::new(0);
        history.push(record("only"));
        history.push(record("newer"));
        assert_eq!(history.len(), 1);
        assert_eq!(history.snapshot()[0].target, "newer");
    }

    proptest! {
        #[test]
        fn prop_history_is_suffix_of_pushes(capacity in 1usize..32, pushes in 0usize..100) {
            let mut history = FaultHistory::new(capacity);
            for i in 0..pushes {
                history.push(record(&i.to_string()));
            }
            prop_assert!(history.len() <= capacity);
            prop_assert_eq!(history.len(), pushes.min(capacity));

            let expected: Vec<String> = (pushes.saturating_sub(capacity)..pushes)
                .map(|i| i.to_string())
                .collect();
            let actual: Vec<String> = history.snapshot().into_iter().map(|r| r.target).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
