//! Persistence layer.
//!
//! Result sets are timestamped folders of four CSV exports. Session
//! artifacts are small JSON files keyed by handle.

mod export;
mod fs;
mod session;

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Classification;
use crate::error::StoreError;
use crate::source::Collection;

pub use export::{read_collection, write_collection_csv};
pub use fs::FsStore;
pub use session::{SessionArtifact, SessionInfo};

/// Timestamp format used in folder and file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// One of the four exports in a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    /// Every followed account.
    Following,
    /// Every follower.
    Followers,
    /// Followed accounts that do not follow back.
    FollowingOnly,
    /// Followers that are not followed back.
    FansOnly,
}

impl ExportKind {
    /// All kinds, in export order.
    pub const ALL: [Self; 4] = [
        Self::Following,
        Self::Followers,
        Self::FollowingOnly,
        Self::FansOnly,
    ];

    /// File name stem, without the timestamp.
    #[must_use]
    pub const fn stem(&self) -> &'static str {
        match self {
            Self::Following => "following_users",
            Self::Followers => "followers_users",
            Self::FollowingOnly => "non_followers",
            Self::FansOnly => "fans_you_dont_follow",
        }
    }

    /// File name inside a result set folder.
    #[must_use]
    pub fn file_name(&self, timestamp: &str) -> String {
        format!("{}_{timestamp}.csv", self.stem())
    }

    /// Matching collection of a classification.
    #[must_use]
    pub const fn pick<'a>(&self, classification: &'a Classification) -> &'a Collection {
        match self {
            Self::Following => &classification.following,
            Self::Followers => &classification.followers,
            Self::FollowingOnly => &classification.following_only,
            Self::FansOnly => &classification.fans_only,
        }
    }
}

/// Key of a result set: `(handle, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultRef {
    /// Account handle.
    pub handle: String,
    /// `YYYYMMDDHHMMSS`.
    pub timestamp: String,
}

impl ResultRef {
    /// Reference for a result set created at `at`.
    #[must_use]
    pub fn new(handle: impl Into<String>, at: NaiveDateTime) -> Self {
        Self {
            handle: handle.into(),
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Folder name, `{handle}_{timestamp}`.
    #[must_use]
    pub fn folder_name(&self) -> String {
        format!("{}_{}", self.handle, self.timestamp)
    }

    /// Parse a folder name back into a reference.
    pub fn parse(folder: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidRef(folder.to_string());
        let (handle, timestamp) = folder.rsplit_once('_').ok_or_else(invalid)?;
        if handle.is_empty()
            || timestamp.len() != 14
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
        validate_handle(handle).map_err(|_| invalid())?;
        Ok(Self {
            handle: handle.to_string(),
            timestamp: timestamp.to_string(),
        })
    }

    /// Creation time encoded in the timestamp.
    #[must_use]
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()
    }
}

impl std::fmt::Display for ResultRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.folder_name())
    }
}

/// Location of one written export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFile {
    /// Which list it holds.
    pub kind: ExportKind,
    /// File name inside the result set folder.
    pub file_name: String,
    /// Number of rows.
    pub rows: usize,
}

/// A written result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Key.
    pub reference: ResultRef,
    /// Folder holding the exports.
    pub directory: PathBuf,
    /// The exports, in [`ExportKind::ALL`] order.
    pub files: Vec<ExportFile>,
}

/// Listing entry for a result set folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSetInfo {
    /// Key.
    pub reference: ResultRef,
    /// Folder name.
    pub folder: String,
    /// Whether all four exports exist and are non-empty.
    pub valid: bool,
}

/// Durable storage for sessions and result sets.
///
/// Implementations are synchronous; artifacts are small.
pub trait ArtifactStore: Send + Sync {
    /// Write one export of a result set and return its path.
    fn write_collection(
        &self,
        kind: ExportKind,
        reference: &ResultRef,
        collection: &Collection,
    ) -> Result<PathBuf, StoreError>;

    /// Folder for a result set.
    fn result_dir(&self, reference: &ResultRef) -> PathBuf;

    /// Reserve a fresh result set for `handle`, stamped `at` or the first
    /// later second that is still free.
    fn allocate_result(&self, handle: &str, at: NaiveDateTime) -> Result<ResultRef, StoreError>;

    /// Write all four exports of a classification.
    fn write_result_set(
        &self,
        reference: &ResultRef,
        classification: &Classification,
    ) -> Result<ResultSet, StoreError> {
        validate_handle(&reference.handle)?;
        let mut files = Vec::with_capacity(ExportKind::ALL.len());
        for kind in ExportKind::ALL {
            let collection = kind.pick(classification);
            self.write_collection(kind, reference, collection)?;
            files.push(ExportFile {
                kind,
                file_name: kind.file_name(&reference.timestamp),
                rows: collection.len(),
            });
        }
        Ok(ResultSet {
            reference: reference.clone(),
            directory: self.result_dir(reference),
            files,
        })
    }

    /// Every result set folder, newest first.
    fn enumerate_result_sets(&self) -> Result<Vec<ResultSetInfo>, StoreError>;

    /// Every stored session, most recently used first.
    fn enumerate_sessions(&self) -> Result<Vec<SessionInfo>, StoreError>;

    /// Load the four lists of a valid result set.
    fn load_result_set(&self, reference: &ResultRef) -> Result<Classification, StoreError>;

    /// Path of one export, if the result set is valid.
    fn export_path(&self, reference: &ResultRef, kind: ExportKind) -> Result<PathBuf, StoreError>;

    /// Read the session for a handle, if any.
    fn read_session(&self, handle: &str) -> Result<Option<SessionArtifact>, StoreError>;

    /// Replace the session for a handle.
    fn write_session(&self, artifact: &SessionArtifact) -> Result<(), StoreError>;
}

/// Reject handles that cannot safely become part of a file name.
pub fn validate_handle(handle: &str) -> Result<(), StoreError> {
    let bad = handle.is_empty()
        || handle.contains(['/', '\\', '\0'])
        || handle.contains("..")
        || handle.trim() != handle;
    if bad {
        Err(StoreError::InvalidHandle(handle.to_string()))
    } else {
        Ok(())
    }
}

/// Convert a file modification time for listings.
pub(crate) fn to_utc(time: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
