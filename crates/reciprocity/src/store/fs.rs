//! Filesystem-backed artifact store.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, info, warn};

use super::{
    read_collection, to_utc, validate_handle, write_collection_csv, ArtifactStore, ExportKind,
    ResultRef, ResultSetInfo, SessionArtifact, SessionInfo,
};
use crate::classify::Classification;
use crate::error::StoreError;
use crate::source::Collection;

const SESSION_PREFIX: &str = "session-";

/// Artifact store rooted at a data directory.
///
/// ```text
/// {root}/session-{handle}
/// {root}/{handle}_{YYYYMMDDHHMMSS}/following_users_{ts}.csv
/// {root}/{handle}_{YYYYMMDDHHMMSS}/followers_users_{ts}.csv
/// {root}/{handle}_{YYYYMMDDHHMMSS}/non_followers_{ts}.csv
/// {root}/{handle}_{YYYYMMDDHHMMSS}/fans_you_dont_follow_{ts}.csv
/// {root}/non_followers.csv             (latest copy, optional)
/// {root}/fans_you_dont_follow.csv      (latest copy, optional)
/// ```
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    profile_url_base: String,
    legacy_exports: bool,
}

impl FsStore {
    /// Store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            profile_url_base: "https://instagram.com/".to_string(),
            legacy_exports: false,
        }
    }

    /// Prefix for the `profile_url` column.
    #[must_use]
    pub fn with_profile_url_base(mut self, base: impl Into<String>) -> Self {
        self.profile_url_base = base.into();
        self
    }

    /// Also keep latest copies of the two derived lists at the root.
    #[must_use]
    pub fn with_legacy_exports(mut self, enabled: bool) -> Self {
        self.legacy_exports = enabled;
        self
    }

    /// Data directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, handle: &str) -> Result<PathBuf, StoreError> {
        validate_handle(handle)?;
        Ok(self.root.join(format!("{SESSION_PREFIX}{handle}")))
    }

    fn member_path(&self, reference: &ResultRef, kind: ExportKind) -> PathBuf {
        self.result_dir(reference)
            .join(kind.file_name(&reference.timestamp))
    }

    fn is_valid(&self, reference: &ResultRef) -> bool {
        self.missing_member(reference).is_none()
    }

    fn missing_member(&self, reference: &ResultRef) -> Option<ExportKind> {
        ExportKind::ALL.into_iter().find(|kind| {
            fs::metadata(self.member_path(reference, *kind))
                .map(|meta| !meta.is_file() || meta.len() == 0)
                .unwrap_or(true)
        })
    }

    fn write_csv(&self, path: &Path, collection: &Collection) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        write_collection_csv(BufWriter::new(file), collection, &self.profile_url_base)
    }

    fn read_dir_or_empty(&self) -> Result<Vec<fs::DirEntry>, StoreError> {
        match fs::read_dir(&self.root) {
            Ok(entries) => Ok(entries.collect::<Result<Vec<_>, _>>()?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ArtifactStore for FsStore {
    fn write_collection(
        &self,
        kind: ExportKind,
        reference: &ResultRef,
        collection: &Collection,
    ) -> Result<PathBuf, StoreError> {
        validate_handle(&reference.handle)?;
        let path = self.member_path(reference, kind);
        self.write_csv(&path, collection)?;
        debug!(path = %path.display(), rows = collection.len(), "Wrote export");

        if self.legacy_exports && matches!(kind, ExportKind::FollowingOnly | ExportKind::FansOnly) {
            let latest = self.root.join(format!("{}.csv", kind.stem()));
            self.write_csv(&latest, collection)?;
        }
        Ok(path)
    }

    fn result_dir(&self, reference: &ResultRef) -> PathBuf {
        self.root.join(reference.folder_name())
    }

    fn allocate_result(&self, handle: &str, at: NaiveDateTime) -> Result<ResultRef, StoreError> {
        validate_handle(handle)?;
        fs::create_dir_all(&self.root)?;
        let mut at = at;
        loop {
            let reference = ResultRef::new(handle, at);
            match fs::create_dir(self.result_dir(&reference)) {
                Ok(()) => return Ok(reference),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(folder = %reference, "Result folder taken, trying the next second");
                    at += TimeDelta::seconds(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn enumerate_result_sets(&self) -> Result<Vec<ResultSetInfo>, StoreError> {
        let mut sets = Vec::new();
        for entry in self.read_dir_or_empty()? {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let folder = entry.file_name().to_string_lossy().into_owned();
            let Ok(reference) = ResultRef::parse(&folder) else {
                continue;
            };
            let valid = self.is_valid(&reference);
            sets.push(ResultSetInfo {
                reference,
                folder,
                valid,
            });
        }
        sets.sort_by(|a, b| {
            b.reference
                .timestamp
                .cmp(&a.reference.timestamp)
                .then_with(|| a.reference.handle.cmp(&b.reference.handle))
        });
        Ok(sets)
    }

    fn enumerate_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        let mut sessions = Vec::new();
        for entry in self.read_dir_or_empty()? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(handle) = name.strip_prefix(SESSION_PREFIX) else {
                continue;
            };
            if validate_handle(handle).is_err() {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            sessions.push(SessionInfo {
                handle: handle.to_string(),
                last_used: to_utc(meta.modified()?),
            });
        }
        sessions.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        Ok(sessions)
    }

    fn load_result_set(&self, reference: &ResultRef) -> Result<Classification, StoreError> {
        validate_handle(&reference.handle)?;
        if let Some(kind) = self.missing_member(reference) {
            warn!(folder = %reference, member = kind.stem(), "Result set incomplete");
            return Err(StoreError::MissingMember {
                folder: reference.folder_name(),
                member: kind.file_name(&reference.timestamp),
            });
        }
        let load = |kind: ExportKind| -> Result<Collection, StoreError> {
            read_collection(File::open(self.member_path(reference, kind))?)
        };
        let classification = Classification {
            following: load(ExportKind::Following)?,
            followers: load(ExportKind::Followers)?,
            following_only: load(ExportKind::FollowingOnly)?,
            fans_only: load(ExportKind::FansOnly)?,
        };
        info!(
            folder = %reference,
            following = classification.following.len(),
            followers = classification.followers.len(),
            "Loaded result set"
        );
        Ok(classification)
    }

    fn export_path(&self, reference: &ResultRef, kind: ExportKind) -> Result<PathBuf, StoreError> {
        validate_handle(&reference.handle)?;
        if !self.is_valid(reference) {
            return Err(StoreError::NotFound(reference.folder_name()));
        }
        Ok(self.member_path(reference, kind))
    }

    fn read_session(&self, handle: &str) -> Result<Option<SessionArtifact>, StoreError> {
        let path = self.session_path(handle)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_session(&self, artifact: &SessionArtifact) -> Result<(), StoreError> {
        let path = self.session_path(&artifact.handle)?;
        fs::create_dir_all(&self.root)?;
        let content = serde_json::to_string_pretty(artifact)?;
        let tmp = self
            .root
            .join(format!(".{SESSION_PREFIX}{}.tmp", artifact.handle));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        info!(handle = %artifact.handle, "Session saved");
        Ok(())
    }
}
