//! Change classification between a leader and a follower.
//!
//! [`calc_changes`] takes the fingerprints of both sides and returns one
//! [`Change`] per key in the union of their key sets. The status of a change
//! is derived from the pair of fingerprints, never stored.
//!
//! | left    | right   | status       |
//! |---------|---------|--------------|
//! | present | absent  | `LeftOnly`   |
//! | absent  | present | `RightOnly`  |
//! | equal   | equal   | `Same`       |
//! | newer   | older   | `LeftNewer`  |
//! | older   | newer   | `RightNewer` |
//! | same second, different size | | `Conflict` |
//!
//! The output is a set: its order is unspecified and callers must not rely
//! on it.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Classification of one key across leader (left) and follower (right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Present only in the leader. Create on the follower.
    LeftOnly,
    /// Present only in the follower. Delete from the follower.
    RightOnly,
    /// Identical fingerprints. Nothing to do.
    Same,
    /// Leader modified later. Update the follower.
    LeftNewer,
    /// Follower modified later. Anomalous; the leader still wins.
    RightNewer,
    /// Same second, different size. Ambiguous; the leader wins.
    Conflict,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeError {
    #[error("change sides have different keys: left={left}, right={right}")]
    KeyMismatch { left: String, right: String },
    #[error("change must have at least one side")]
    Empty,
}

/// A keyed pair of optional fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<K> {
    key: K,
    left: Option<Fingerprint<K>>,
    right: Option<Fingerprint<K>>,
}

impl<K> Change<K>
where
    K: Clone + PartialEq + Debug,
{
    /// Constructs a change, rejecting pairs whose keys disagree.
    pub fn new(
        left: Option<Fingerprint<K>>,
        right: Option<Fingerprint<K>>,
    ) -> Result<Self, ChangeError> {
        let key = match (&left, &right) {
            (Some(l), Some(r)) if l.key != r.key => {
                return Err(ChangeError::KeyMismatch {
                    left: format!("{:?}", l.key),
                    right: format!("{:?}", r.key),
                })
            }
            (Some(l), _) => l.key.clone(),
            (None, Some(r)) => r.key.clone(),
            (None, None) => return Err(ChangeError::Empty),
        };
        Ok(Self { key, left, right })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn left(&self) -> Option<&Fingerprint<K>> {
        self.left.as_ref()
    }

    pub fn right(&self) -> Option<&Fingerprint<K>> {
        self.right.as_ref()
    }

    pub fn status(&self) -> ChangeStatus {
        match (&self.left, &self.right) {
            (Some(_), None) => ChangeStatus::LeftOnly,
            (None, Some(_)) => ChangeStatus::RightOnly,
            (Some(l), Some(r)) => {
                if l == r {
                    ChangeStatus::Same
                } else if l.modified > r.modified {
                    ChangeStatus::LeftNewer
                } else if l.modified < r.modified {
                    ChangeStatus::RightNewer
                } else {
                    ChangeStatus::Conflict
                }
            }
            // unreachable: `new` rejects empty changes
            (None, None) => ChangeStatus::Same,
        }
    }
}

/// Computes the symmetric change set between leader and follower fingerprints.
///
/// Duplicate keys within one side collapse to the last occurrence.
pub fn calc_changes<K>(left: Vec<Fingerprint<K>>, right: Vec<Fingerprint<K>>) -> Vec<Change<K>>
where
    K: Clone + Eq + Hash + Debug,
{
    let mut left: HashMap<K, Fingerprint<K>> =
        left.into_iter().map(|fp| (fp.key.clone(), fp)).collect();
    let mut right: HashMap<K, Fingerprint<K>> =
        right.into_iter().map(|fp| (fp.key.clone(), fp)).collect();

    let keys: HashSet<K> = left.keys().chain(right.keys()).cloned().collect();

    keys.into_iter()
        .map(|key| {
            let l = left.remove(&key);
            let r = right.remove(&key);
            // Both sides were looked up under the same key, so construction
            // cannot fail on a key mismatch or an empty pair.
            Change {
                key,
                left: l,
                right: r,
            }
        })
        .collect()
}

/// Per-status counts for a change set, mostly for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub left_only: usize,
    pub right_only: usize,
    pub same: usize,
    pub left_newer: usize,
    pub right_newer: usize,
    pub conflict: usize,
}

impl ChangeSummary {
    pub fn of<K>(changes: &[Change<K>]) -> Self
    where
        K: Clone + PartialEq + Debug,
    {
        let mut summary = Self::default();
        for change in changes {
            match change.status() {
                ChangeStatus::LeftOnly => summary.left_only += 1,
                ChangeStatus::RightOnly => summary.right_only += 1,
                ChangeStatus::Same => summary.same += 1,
                ChangeStatus::LeftNewer => summary.left_newer += 1,
                ChangeStatus::RightNewer => summary.right_newer += 1,
                ChangeStatus::Conflict => summary.conflict += 1,
            }
        }
        summary
    }

    /// Number of changes that need a follower mutation.
    pub fn pending(&self) -> usize {
        self.left_only + self.right_only + self.left_newer + self.right_newer + self.conflict
    }
}
