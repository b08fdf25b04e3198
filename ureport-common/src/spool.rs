use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::report::ParseError;
use crate::retry::RetryPolicy;

const REASONS_DIR: &str = ".reasons";
const SEPARATOR: char = '@';
const UNCLAIMABLE_PREFIX: &str = "unclaimable-";

// NAME_MAX of the common Linux filesystems
const MAX_NAME_BYTES: usize = 255;
// `@<u32>@<stamp ms>`, the stamp is at most 17 characters within chrono's range
const MAX_ENTRY_SUFFIX_BYTES: usize = 32;
/// Longest identity that still fits every name the spool derives from it.
pub const MAX_ID_BYTES: usize = MAX_NAME_BYTES - MAX_ENTRY_SUFFIX_BYTES;

/// Whether an incoming name can be used as a report identity.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_ID_BYTES
}

/// Archive name of an incoming entry whose own name cannot be an identity.
pub fn unclaimable_id(name: &[u8]) -> String {
    format!("{UNCLAIMABLE_PREFIX}{:x}", Sha256::digest(name))
}

/// `now + delay`, capped at a century so the stamp always fits an entry name.
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let cap = chrono::Duration::days(36_500);
    let delay = chrono::Duration::from_std(delay).map_or(cap, |delay| delay.min(cap));
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool directory {path} is not usable: {error}")]
    Unavailable { path: PathBuf, error: io::Error },
    #[error("failed to {operation} {path}: {error}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        error: io::Error,
    },
    #[error("could not encode archive reason: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_error(operation: &'static str, path: &Path) -> impl FnOnce(io::Error) -> SpoolError {
    let path = path.to_owned();
    move |error| SpoolError::Io {
        operation,
        path,
        error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolState {
    Incoming,
    Processing,
    Deferred,
    Saved,
    Archive,
}

impl SpoolState {
    pub const ALL: [SpoolState; 5] = [
        SpoolState::Incoming,
        SpoolState::Processing,
        SpoolState::Deferred,
        SpoolState::Saved,
        SpoolState::Archive,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            SpoolState::Incoming => "incoming",
            SpoolState::Processing => "processing",
            SpoolState::Deferred => "deferred",
            SpoolState::Saved => "saved",
            SpoolState::Archive => "archive",
        }
    }
}

/// Name of a processing or deferred entry: `<id>@<failed_attempts>@<stamp_ms>`. The stamp is
/// the claim time for processing entries and the next eligible time for deferred ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub id: String,
    pub failed_attempts: u32,
    pub stamp: DateTime<Utc>,
}

impl EntryName {
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.id,
            self.failed_attempts,
            self.stamp.timestamp_millis()
        )
    }

    /// Identities may contain the separator themselves, so parse from the right.
    pub fn decode(name: &str) -> Option<Self> {
        let mut parts = name.rsplitn(3, SEPARATOR);
        let stamp = parts.next()?.parse::<i64>().ok()?;
        let failed_attempts = parts.next()?.parse::<u32>().ok()?;
        let id = parts.next().filter(|id| !id.is_empty())?;

        Some(Self {
            id: id.to_owned(),
            failed_attempts,
            stamp: DateTime::from_timestamp_millis(stamp)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCause {
    MalformedReport,
    UnsupportedFormat,
    ExhaustedRetries,
}

impl ArchiveCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveCause::MalformedReport => "malformed_report",
            ArchiveCause::UnsupportedFormat => "unsupported_format",
            ArchiveCause::ExhaustedRetries => "exhausted_retries",
        }
    }
}

/// Why a report was archived, kept next to the archive as `.reasons/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReason {
    pub cause: ArchiveCause,
    pub message: String,
    pub failed_attempts: u32,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveReason {
    pub fn rejected(error: &ParseError, failed_attempts: u32, now: DateTime<Utc>) -> Self {
        let cause = match error {
            ParseError::MalformedReport(_) => ArchiveCause::MalformedReport,
            ParseError::UnsupportedFormat(_) => ArchiveCause::UnsupportedFormat,
        };
        Self {
            cause,
            message: error.to_string(),
            failed_attempts,
            archived_at: now,
        }
    }

    pub fn exhausted(failed_attempts: u32, last_error: &str, now: DateTime<Utc>) -> Self {
        Self {
            cause: ArchiveCause::ExhaustedRetries,
            message: format!("exhausted retries after {failed_attempts} failed attempts: {last_error}"),
            failed_attempts,
            archived_at: now,
        }
    }
}

/// A report to be claimed, found in incoming or eligible in deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claimable {
    Incoming(String),
    Deferred(EntryName),
}

impl Claimable {
    pub fn id(&self) -> &str {
        match self {
            Claimable::Incoming(id) => id,
            Claimable::Deferred(entry) => &entry.id,
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        match self {
            Claimable::Incoming(_) => 0,
            Claimable::Deferred(entry) => entry.failed_attempts,
        }
    }
}

/// Exclusive hold on a report: it sits in processing under a name only this holder knows.
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: String,
    pub failed_attempts: u32,
    pub claimed_at: DateTime<Utc>,
    /// Intake time, rename keeps the modification time of the original file
    pub arrived_at: DateTime<Utc>,
    path: PathBuf,
}

impl Claim {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved,
    /// The source was gone: another worker or the stall reclaimer moved it first
    Lost,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimResult {
    pub deferred: usize,
    pub archived: usize,
    /// Entries that could not be moved. They stay put and are retried on the next pass.
    pub errors: usize,
}

/// Directory based state machine for reports. Every state change is one `rename(2)`, which
/// is also the only synchronization between workers sharing a spool root.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: SpoolState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    fn reasons_dir(&self) -> PathBuf {
        self.dir(SpoolState::Archive).join(REASONS_DIR)
    }

    fn reason_path(&self, id: &str) -> PathBuf {
        self.reasons_dir().join(format!("{id}.json"))
    }

    /// Create any missing state directories.
    pub async fn init(&self) -> Result<(), SpoolError> {
        for state in SpoolState::ALL {
            let dir = self.dir(state);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(io_error("create", &dir))?;
        }
        let reasons = self.reasons_dir();
        tokio::fs::create_dir_all(&reasons)
            .await
            .map_err(io_error("create", &reasons))
    }

    /// Fails unless every state directory exists.
    pub async fn check(&self) -> Result<(), SpoolError> {
        let dirs = SpoolState::ALL
            .iter()
            .map(|state| self.dir(*state))
            .chain(std::iter::once(self.reasons_dir()));
        for path in dirs {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(SpoolError::Unavailable {
                        path,
                        error: io::Error::new(io::ErrorKind::Other, "not a directory"),
                    })
                }
                Err(error) => return Err(SpoolError::Unavailable { path, error }),
            }
        }
        Ok(())
    }

    /// Visible entry names of a state directory, sorted. Dot-files are in-flight writes.
    pub async fn list(&self, state: SpoolState) -> Result<Vec<String>, SpoolError> {
        let dir = self.dir(state);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(io_error("list", &dir))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("list", &dir))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(dir = %dir.display(), "skipping entry with a non UTF-8 name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn list_entries(&self, state: SpoolState) -> Result<Vec<EntryName>, SpoolError> {
        let mut entries = Vec::new();
        for name in self.list(state).await? {
            match EntryName::decode(&name) {
                Some(entry) => entries.push(entry),
                None => warn!(state = state.dir_name(), name, "skipping undecodable entry"),
            }
        }
        Ok(entries)
    }

    pub async fn processing(&self) -> Result<Vec<EntryName>, SpoolError> {
        self.list_entries(SpoolState::Processing).await
    }

    pub async fn deferred(&self) -> Result<Vec<EntryName>, SpoolError> {
        self.list_entries(SpoolState::Deferred).await
    }

    /// Incoming reports, then deferred reports whose backoff is over, oldest first.
    /// Incoming names that cannot be identities are left to `archive_unclaimable`.
    pub async fn claimable(&self, now: DateTime<Utc>) -> Result<Vec<Claimable>, SpoolError> {
        let mut claimable: Vec<Claimable> = self
            .list(SpoolState::Incoming)
            .await?
            .into_iter()
            .filter(|id| is_valid_id(id))
            .map(Claimable::Incoming)
            .collect();

        let mut eligible: Vec<EntryName> = self
            .deferred()
            .await?
            .into_iter()
            .filter(|entry| entry.stamp <= now)
            .collect();
        eligible.sort_by_key(|entry| entry.stamp);
        claimable.extend(eligible.into_iter().map(Claimable::Deferred));

        Ok(claimable)
    }

    /// Intake side: write under a hidden name, then rename into incoming.
    pub async fn deposit(&self, id: &str, body: &[u8]) -> Result<(), SpoolError> {
        let incoming = self.dir(SpoolState::Incoming);
        let partial = incoming.join(format!(".{id}.partial"));
        tokio::fs::write(&partial, body)
            .await
            .map_err(io_error("write", &partial))?;
        let target = incoming.join(id);
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(io_error("rename", &partial))
    }

    fn source_path(&self, candidate: &Claimable) -> PathBuf {
        match candidate {
            Claimable::Incoming(id) => self.dir(SpoolState::Incoming).join(id),
            Claimable::Deferred(entry) => self.dir(SpoolState::Deferred).join(entry.encode()),
        }
    }

    /// Move a report into processing. `None` means another worker got there first.
    pub async fn claim(
        &self,
        candidate: &Claimable,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, SpoolError> {
        let entry = EntryName {
            id: candidate.id().to_owned(),
            failed_attempts: candidate.failed_attempts(),
            stamp: now,
        };
        let source = self.source_path(candidate);
        let target = self.dir(SpoolState::Processing).join(entry.encode());

        if move_entry(&source, &target).await? == Transition::Lost {
            debug!(report = %entry.id, "claim lost to another worker");
            return Ok(None);
        }

        let arrived_at = match tokio::fs::metadata(&target).await.and_then(|m| m.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(_) => now,
        };

        Ok(Some(Claim {
            id: entry.id,
            failed_attempts: entry.failed_attempts,
            claimed_at: entry.stamp,
            arrived_at,
            path: target,
        }))
    }

    pub async fn read(&self, claim: &Claim) -> Result<Vec<u8>, SpoolError> {
        tokio::fs::read(&claim.path)
            .await
            .map_err(io_error("read", &claim.path))
    }

    pub async fn save(&self, claim: &Claim) -> Result<Transition, SpoolError> {
        let target = self.dir(SpoolState::Saved).join(&claim.id);
        move_entry(&claim.path, &target).await
    }

    pub async fn defer(
        &self,
        claim: &Claim,
        failed_attempts: u32,
        eligible_at: DateTime<Utc>,
    ) -> Result<Transition, SpoolError> {
        self.defer_path(&claim.path, &claim.id, failed_attempts, eligible_at)
            .await
    }

    async fn defer_path(
        &self,
        source: &Path,
        id: &str,
        failed_attempts: u32,
        eligible_at: DateTime<Utc>,
    ) -> Result<Transition, SpoolError> {
        let entry = EntryName {
            id: id.to_owned(),
            failed_attempts,
            stamp: eligible_at,
        };
        let target = self.dir(SpoolState::Deferred).join(entry.encode());
        move_entry(source, &target).await
    }

    pub async fn archive(
        &self,
        claim: &Claim,
        reason: &ArchiveReason,
    ) -> Result<Transition, SpoolError> {
        self.archive_path(&claim.path, &claim.id, reason).await
    }

    // The reason goes first, so an archived report always has one
    async fn archive_path(
        &self,
        source: &Path,
        id: &str,
        reason: &ArchiveReason,
    ) -> Result<Transition, SpoolError> {
        self.write_reason(id, reason).await?;

        let target = self.dir(SpoolState::Archive).join(id);
        let transition = move_entry(source, &target).await?;
        // Keep the reason when whoever won the race archived the report too
        if transition == Transition::Lost && !tokio::fs::try_exists(&target).await.unwrap_or(true)
        {
            let reason_path = self.reason_path(id);
            if let Err(e) = tokio::fs::remove_file(&reason_path).await {
                warn!(report = %id, error = %e, "could not remove reason of a lost archive move");
            }
        }
        Ok(transition)
    }

    async fn write_reason(&self, id: &str, reason: &ArchiveReason) -> Result<(), SpoolError> {
        let body = serde_json::to_vec_pretty(reason)?;
        let partial = self.reasons_dir().join(format!(".{id}.json.partial"));
        tokio::fs::write(&partial, body)
            .await
            .map_err(io_error("write", &partial))?;
        let target = self.reason_path(id);
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(io_error("rename", &partial))
    }

    pub async fn archive_reason(&self, id: &str) -> Result<Option<ArchiveReason>, SpoolError> {
        let path = self.reason_path(id);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path)(e)),
        }
    }

    /// Processing entries claimed longer than `liveness_timeout` ago belong to a worker that
    /// died or hung. Each counts as a failed attempt.
    pub async fn reclaim_stalled(
        &self,
        liveness_timeout: Duration,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReclaimResult, SpoolError> {
        let mut result = ReclaimResult::default();

        for entry in self.processing().await? {
            let stalled = chrono::Duration::from_std(liveness_timeout)
                .ok()
                .and_then(|timeout| entry.stamp.checked_add_signed(timeout))
                .is_some_and(|deadline| deadline <= now);
            if !stalled {
                continue;
            }

            let source = self.dir(SpoolState::Processing).join(entry.encode());
            let failed_attempts = entry.failed_attempts + 1;
            let exhausted = policy.is_exhausted(failed_attempts);

            let transition = if exhausted {
                let reason = ArchiveReason::exhausted(failed_attempts, "processing stalled", now);
                self.archive_path(&source, &entry.id, &reason).await
            } else {
                self.defer_path(&source, &entry.id, failed_attempts, now).await
            };

            match transition {
                Ok(Transition::Moved) => {
                    if exhausted {
                        result.archived += 1;
                    } else {
                        result.deferred += 1;
                    }
                    warn!(
                        report = %entry.id,
                        claimed_at = %entry.stamp,
                        failed_attempts,
                        "reclaimed stalled report"
                    );
                }
                Ok(Transition::Lost) => {}
                Err(e) => {
                    warn!(report = %entry.id, error = %e, "could not reclaim stalled report");
                    result.errors += 1;
                }
            }
        }

        Ok(result)
    }

    /// Deferred entries already past the retry budget, e.g. after the budget was lowered.
    pub async fn archive_exhausted(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReclaimResult, SpoolError> {
        let mut result = ReclaimResult::default();
        for entry in self.deferred().await? {
            if !policy.is_exhausted(entry.failed_attempts) {
                continue;
            }
            let source = self.dir(SpoolState::Deferred).join(entry.encode());
            let reason = ArchiveReason::exhausted(
                entry.failed_attempts,
                "retry budget exceeded while deferred",
                now,
            );
            match self.archive_path(&source, &entry.id, &reason).await {
                Ok(Transition::Moved) => result.archived += 1,
                Ok(Transition::Lost) => {}
                Err(e) => {
                    warn!(report = %entry.id, error = %e, "could not archive exhausted report");
                    result.errors += 1;
                }
            }
        }
        Ok(result)
    }

    /// Incoming entries whose names cannot be identities: too long for the names derived
    /// from them, or not UTF-8. They go straight to archive under a hashed name.
    pub async fn archive_unclaimable(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReclaimResult, SpoolError> {
        let dir = self.dir(SpoolState::Incoming);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(io_error("list", &dir))?;

        let mut result = ReclaimResult::default();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("list", &dir))?
        {
            let name = entry.file_name();
            if name.as_encoded_bytes().starts_with(b".") {
                continue;
            }
            if name.to_str().is_some_and(is_valid_id) {
                continue;
            }

            let id = unclaimable_id(name.as_encoded_bytes());
            let reason = ArchiveReason {
                cause: ArchiveCause::MalformedReport,
                message: format!(
                    "report name cannot be used as an identity: {}",
                    name.to_string_lossy()
                ),
                failed_attempts: 0,
                archived_at: now,
            };
            match self.archive_path(&entry.path(), &id, &reason).await {
                Ok(Transition::Moved) => {
                    warn!(
                        report = %id,
                        name = %name.to_string_lossy(),
                        "archived unclaimable report"
                    );
                    result.archived += 1;
                }
                Ok(Transition::Lost) => {}
                Err(e) => {
                    warn!(report = %id, error = %e, "could not archive unclaimable report");
                    result.errors += 1;
                }
            }
        }
        Ok(result)
    }

    /// Every state currently holding the identity. Exactly one, outside of bugs.
    pub async fn locate(&self, id: &str) -> Result<Vec<SpoolState>, SpoolError> {
        let mut found = Vec::new();
        for state in SpoolState::ALL {
            let present = match state {
                SpoolState::Processing | SpoolState::Deferred => self
                    .list_entries(state)
                    .await?
                    .iter()
                    .any(|entry| entry.id == id),
                _ => self.list(state).await?.iter().any(|name| name == id),
            };
            if present {
                found.push(state);
            }
        }
        Ok(found)
    }

    pub async fn depths(&self) -> Result<Vec<(SpoolState, usize)>, SpoolError> {
        let mut depths = Vec::with_capacity(SpoolState::ALL.len());
        for state in SpoolState::ALL {
            depths.push((state, self.list(state).await?.len()));
        }
        Ok(depths)
    }

    /// Remove reason files with no archived report, left behind by a crash between writing
    /// the reason and the rename. Younger files may still be waiting for their rename.
    pub async fn remove_orphaned_reasons(&self, grace: Duration) -> Result<usize, SpoolError> {
        let dir = self.reasons_dir();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(io_error("list", &dir))?;
        let archive = self.dir(SpoolState::Archive);

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("list", &dir))?
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            let orphaned = match name.strip_suffix(".json") {
                Some(id) if !name.starts_with('.') => {
                    !tokio::fs::try_exists(archive.join(id))
                        .await
                        .map_err(io_error("stat", &path))?
                }
                // partial writes and anything else that should not be here
                _ => true,
            };
            if !orphaned || !older_than(&path, grace).await {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &path)(e)),
            }
        }
        Ok(removed)
    }

    /// Retention for saved reports, whose content already lives in the cluster store.
    pub async fn purge_saved(&self, max_age: Duration) -> Result<usize, SpoolError> {
        let saved = self.dir(SpoolState::Saved);
        let mut purged = 0;
        for name in self.list(SpoolState::Saved).await? {
            let path = saved.join(&name);
            if !older_than(&path, max_age).await {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &path)(e)),
            }
        }
        Ok(purged)
    }
}

async fn older_than(path: &Path, age: Duration) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().map(|e| e >= age).unwrap_or(false),
        Err(_) => false,
    }
}

/// Atomic rename. A missing source is a lost race, not an error.
async fn move_entry(source: &Path, target: &Path) -> Result<Transition, SpoolError> {
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(Transition::Moved),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Also NotFound when the target directory vanished, which is not a lost race
            match target.parent() {
                Some(parent) if !parent.is_dir() => Err(SpoolError::Unavailable {
                    path: parent.to_owned(),
                    error: e,
                }),
                _ => Ok(Transition::Lost),
            }
        }
        Err(e) => Err(io_error("rename", source)(e)),
    }
}
