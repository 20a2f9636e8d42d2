//! Classified cut actions and their per-class priority queues

use std::collections::VecDeque;

use crate::core::types::{DatasetId, NodeId, ViewId};

/// Outcome of analysing one cut node or sibling group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Error above threshold; refine if budget allows
    MustSplit,
    /// Parent suffices or group is invisible; always collapsed
    MustCollapse,
    /// Marginal; collapsed only when a split needs the budget
    CollapseOnNeed,
    /// Fine as is; collapsed only for a split with larger error
    MaybeCollapse,
    /// Stays in the cut
    Keep,
}

impl Classification {
    pub const ALL: [Classification; 5] = [
        Classification::MustSplit,
        Classification::MustCollapse,
        Classification::CollapseOnNeed,
        Classification::MaybeCollapse,
        Classification::Keep,
    ];

    fn index(self) -> usize {
        match self {
            Classification::MustSplit => 0,
            Classification::MustCollapse => 1,
            Classification::CollapseOnNeed => 2,
            Classification::MaybeCollapse => 3,
            Classification::Keep => 4,
        }
    }
}

/// One decision candidate.
///
/// For splits and keeps `node` is the cut member; for collapses it is the
/// parent of the sibling group.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CutAction {
    pub kind: Classification,
    pub view: ViewId,
    pub dataset: DatasetId,
    pub node: NodeId,
    pub error: f32,
}

impl CutAction {
    pub fn new(kind: Classification, view: ViewId, dataset: DatasetId, node: NodeId, error: f32) -> Self {
        Self { kind, view, dataset, node, error }
    }
}

/// Five queues, each kept sorted by error, largest first
#[derive(Debug, Default)]
pub struct ActionQueues {
    queues: [VecDeque<CutAction>; 5],
}

impl ActionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: CutAction) {
        let queue = &mut self.queues[action.kind.index()];
        let at = queue.partition_point(|a| a.error.total_cmp(&action.error).is_ge());
        queue.insert(at, action);
    }

    pub fn extend(&mut self, actions: impl IntoIterator<Item = CutAction>) {
        for action in actions {
            self.push(action);
        }
    }

    /// Largest error of a class
    pub fn pop_front(&mut self, kind: Classification) -> Option<CutAction> {
        self.queues[kind.index()].pop_front()
    }

    /// Smallest error of a class
    pub fn pop_back(&mut self, kind: Classification) -> Option<CutAction> {
        self.queues[kind.index()].pop_back()
    }

    pub fn back(&self, kind: Classification) -> Option<&CutAction> {
        self.queues[kind.index()].back()
    }

    pub fn len(&self, kind: Classification) -> usize {
        self.queues[kind.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    /// Remove all actions of a class, largest error first
    pub fn drain(&mut self, kind: Classification) -> impl Iterator<Item = CutAction> + '_ {
        self.queues[kind.index()].drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(kind: Classification, node: NodeId, error: f32) -> CutAction {
        CutAction::new(kind, 0, 0, node, error)
    }

    #[test]
    fn test_sorted_by_error() {
        let mut queues = ActionQueues::new();
        for (node, error) in [(1, 3.0), (2, 9.0), (3, 1.0), (4, 5.0)] {
            queues.push(action(Classification::MustSplit, node, error));
        }
        assert_eq!(queues.pop_front(Classification::MustSplit).unwrap().node, 2);
        assert_eq!(queues.pop_back(Classification::MustSplit).unwrap().node, 3);
        assert_eq!(queues.back(Classification::MustSplit).unwrap().node, 1);
        assert_eq!(queues.len(Classification::MustSplit), 2);
    }

    #[test]
    fn test_classes_are_separate() {
        let mut queues = ActionQueues::new();
        queues.push(action(Classification::Keep, 1, 1.0));
        queues.push(action(Classification::MustCollapse, 2, 1.0));
        assert_eq!(queues.len(Classification::Keep), 1);
        assert!(queues.pop_front(Classification::MustSplit).is_none());

        let drained: Vec<_> = queues.drain(Classification::MustCollapse).collect();
        assert_eq!(drained.len(), 1);
        queues.drain(Classification::Keep).for_each(drop);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_equal_errors_keep_insertion_order() {
        let mut queues = ActionQueues::new();
        queues.push(action(Classification::MaybeCollapse, 1, 2.0));
        queues.push(action(Classification::MaybeCollapse, 2, 2.0));
        assert_eq!(queues.pop_front(Classification::MaybeCollapse).unwrap().node, 1);
    }
}
