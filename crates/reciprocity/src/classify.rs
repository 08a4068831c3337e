//! Relationship classifier.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::source::{Collection, Entity};

/// Four-way partition of the two relationship lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Accounts the user follows.
    pub following: Collection,
    /// Accounts following the user.
    pub followers: Collection,
    /// Followed, not following back.
    pub following_only: Collection,
    /// Following back, not followed.
    pub fans_only: Collection,
}

impl Classification {
    /// Partition two fully drained collections.
    ///
    /// Pure: the derived views depend only on the two key sets and keep the
    /// order of the collection they were filtered from.
    #[must_use]
    pub fn classify(following: Collection, followers: Collection) -> Self {
        let following_only = difference(&following, &followers);
        let fans_only = difference(&followers, &following);
        Self {
            following,
            followers,
            following_only,
            fans_only,
        }
    }

    /// Handles in `following_only`.
    #[must_use]
    pub fn following_only_ids(&self) -> Vec<&str> {
        self.following_only.keys().collect()
    }

    /// Handles in `fans_only`.
    #[must_use]
    pub fn fans_only_ids(&self) -> Vec<&str> {
        self.fans_only.keys().collect()
    }
}

fn difference(from: &Collection, without: &Collection) -> Collection {
    let exclude: HashSet<&str> = without.keys().collect();
    let mut seen = HashSet::new();
    let entities: Vec<Entity> = from
        .entities
        .iter()
        .filter(|e| !exclude.contains(e.id.as_str()) && seen.insert(e.id.as_str()))
        .cloned()
        .collect();
    let count = entities.len() as u64;
    Collection::new(entities, Some(count))
}
