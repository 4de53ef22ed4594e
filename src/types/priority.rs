use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheduling priority of a computation.
///
/// A priority is either *null* (nobody wants this computation) or carries a
/// nonnegative level supplied by a client. As priority flows down the
/// dependency graph, each root-to-root hop deepens `dependency_depth`, and
/// at equal level the deeper priority outranks the shallower: a dependency
/// must run before anything waiting on it. Flowing into a split tags the
/// priority with the split's tree depth; split-tagged priorities rank below
/// their root's, with deeper splits first among themselves. The `circular`
/// flag is the terminal state of a root caught in an unresolvable priority
/// cycle; it dominates in propagation but never beats a strictly higher
/// non-circular level.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ComputationPriority {
    level: Option<u64>,
    dependency_depth: u64,
    split_depth: Option<u64>,
    circular: bool,
}

impl ComputationPriority {
    /// The null priority.
    pub fn null() -> Self {
        Self::default()
    }

    /// A client-assigned priority at the given level.
    pub fn at_level(level: u64) -> Self {
        ComputationPriority {
            level: Some(level),
            dependency_depth: 0,
            split_depth: None,
            circular: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.level.is_none()
    }

    pub fn level(&self) -> Option<u64> {
        self.level
    }

    pub fn dependency_depth(&self) -> u64 {
        self.dependency_depth
    }

    pub fn split_depth(&self) -> Option<u64> {
        self.split_depth
    }

    pub fn is_circular(&self) -> bool {
        self.circular
    }

    /// The priority a computation confers on something it depends on:
    /// same level, one dependency hop deeper (and therefore ahead of the
    /// conferring computation at that level). Null stays null.
    pub fn priority_for_dependent_computation(&self) -> Self {
        if self.is_null() {
            return Self::null();
        }
        ComputationPriority {
            level: self.level,
            dependency_depth: self.dependency_depth + 1,
            split_depth: self.split_depth,
            circular: self.circular,
        }
    }

    /// The split-tagged priority conferred on a split at `tree_depth`
    /// subdivisions below the root: strictly below the root's own priority,
    /// with deeper splits ranked first among themselves.
    pub fn priority_for_split_computation(&self, tree_depth: u64) -> Self {
        if self.is_null() {
            return Self::null();
        }
        ComputationPriority {
            level: self.level,
            dependency_depth: self.dependency_depth,
            split_depth: Some(tree_depth),
            circular: self.circular,
        }
    }

    /// Marks the priority circular, preserving its level.
    pub fn make_circular(&self) -> Self {
        ComputationPriority {
            circular: true,
            ..*self
        }
    }

    /// True when `other` strictly dominates `self` in scheduling strength.
    pub fn is_shallower_than(&self, other: &ComputationPriority) -> bool {
        self < other
    }

    fn strength_key(&self) -> (u8, u64, u8, u64, u64, u64) {
        let (split_rank, split_depth) = match self.split_depth {
            // a root outranks any of its splits; among splits, deeper first
            None => (1, 0),
            Some(depth) => (0, depth),
        };
        (
            u8::from(self.level.is_some()),
            self.level.unwrap_or(0),
            u8::from(self.circular),
            split_rank,
            split_depth,
            self.dependency_depth,
        )
    }
}

impl PartialOrd for ComputationPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComputationPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.strength_key().cmp(&other.strength_key())
    }
}

impl fmt::Debug for ComputationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            None => write!(f, "Priority(null)"),
            Some(level) => {
                write!(f, "Priority(level={level}, depth={}", self.dependency_depth)?;
                if let Some(split) = self.split_depth {
                    write!(f, ", split={split}")?;
                }
                if self.circular {
                    write!(f, ", circular")?;
                }
                write!(f, ")")
            }
        }
    }
}
