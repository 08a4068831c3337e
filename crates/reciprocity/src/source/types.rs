//! Relationship data types.

use serde::{Deserialize, Serialize};

/// One account returned by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Account handle, the identity key.
    pub id: String,
    /// Display name (may be empty).
    #[serde(default)]
    pub display_name: String,
    /// Avatar URL, if fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl Entity {
    /// Create an entity without an avatar.
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    /// Attach an avatar URL.
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar.into());
        self
    }
}

/// Which side of the relationship a collection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Accounts the user follows.
    Following,
    /// Accounts that follow the user.
    Followers,
}

impl Direction {
    /// Label used in progress output and API paths.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Following => "following",
            Self::Followers => "followers",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A fully drained list for one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Entities in source order.
    pub entities: Vec<Entity>,
    /// Total reported by the source. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_total: Option<u64>,
}

impl Collection {
    /// Create a collection from entities.
    #[must_use]
    pub fn new(entities: Vec<Entity>, expected_total: Option<u64>) -> Self {
        Self {
            entities,
            expected_total,
        }
    }

    /// Number of collected entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Identity keys in source order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.id.as_str())
    }
}

/// Account counters reported by the profile lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Handle as the source spells it.
    pub handle: String,
    /// Reported number of followed accounts.
    #[serde(default)]
    pub following_count: Option<u64>,
    /// Reported number of followers.
    #[serde(default)]
    pub followers_count: Option<u64>,
}

impl Profile {
    /// Expected total for a direction.
    #[must_use]
    pub const fn total_for(&self, direction: Direction) -> Option<u64> {
        match direction {
            Direction::Following => self.following_count,
            Direction::Followers => self.followers_count,
        }
    }
}

/// Opaque authentication token issued by the source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// Shrink a profile-picture URL to the small thumbnail variant.
#[must_use]
pub fn thumbnail_avatar(url: &str) -> String {
    if url.contains("/s150x150/") {
        url.replace("/s150x150/", "/s100x100/")
    } else if url.contains("/s320x320/") {
        url.replace("/s320x320/", "/s100x100/")
    } else {
        url.to_string()
    }
}
