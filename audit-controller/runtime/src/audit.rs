//! Converts Kubernetes API server audit entries into change events.
//!
//! Entries arrive from a tailed log file, from the newest file in a log
//! directory, or in batches pushed by the API server's webhook backend. All
//! three paths share one ingestion step: entries that do not describe a
//! completed mutation are skipped, ignore policy is applied, and the
//! remaining events are offered to the pipeline. Block policy does not apply
//! here because audited requests have already been served.

pub mod entry;
mod tail;

use self::{
    entry::AuditEntry,
    tail::{Change, FileId, Position, Tail},
};
use crate::{
    metrics::AuditMetrics,
    pipeline::{Backoff, EventSink},
    policy::Policy,
};
use kubetrail_controller_core::{ChangeEvent, Decision};
use std::{
    collections::{HashMap, HashSet},
    fs::Metadata,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Debug)]
pub struct AuditLogWatcher {
    policy: Policy,
    sink: EventSink,
    poll_interval: Duration,
    io_retry: Backoff,
    metrics: AuditMetrics,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to read audit log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What happened to a single entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Ignored,
    Skipped,
    Malformed,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PushSummary {
    pub accepted: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub malformed: usize,
}

/// Directory-mode progress: the file being tailed and where reading stopped
/// in every file tailed or seen at startup.
#[derive(Debug, Default)]
struct DirState {
    tail: Option<Tail>,
    offsets: HashMap<FileId, u64>,
    started: bool,
}

// === impl AuditLogWatcher ===

impl AuditLogWatcher {
    pub fn new(
        policy: Policy,
        sink: EventSink,
        poll_interval: Duration,
        metrics: AuditMetrics,
    ) -> Self {
        Self {
            policy,
            sink,
            poll_interval,
            io_retry: Backoff {
                base: Duration::from_secs(1),
                factor: 2,
                retries: 5,
            },
            metrics,
        }
    }

    pub fn with_io_retry(mut self, io_retry: Backoff) -> Self {
        self.io_retry = io_retry;
        self
    }

    /// Follows a single file from its current end until `shutdown` fires.
    ///
    /// When the path is rotated or truncated, the remainder of the old file is
    /// read and the path is reopened from its end. Entries written to the new
    /// file before it is reopened are not read.
    pub async fn watch_file(
        &self,
        path: PathBuf,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        info!(path = %path.display(), "Watching audit log");
        let mut tail = None;
        let mut delays = self.io_retry.delays();
        loop {
            let wait = match self.poll_file(&path, &mut tail).await {
                Ok(()) => {
                    delays = self.io_retry.delays();
                    self.poll_interval
                }
                Err(source) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            path = %path.display(),
                            error = %source,
                            ?delay,
                            "Failed to read audit log; retrying"
                        );
                        delay
                    }
                    None => return Err(WatchError::Io { path, source }),
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(path = %path.display(), "Stopped watching audit log");
                    return Ok(());
                }
                _ = time::sleep(wait) => {}
            }
        }
    }

    async fn poll_file(&self, path: &Path, tail: &mut Option<Tail>) -> io::Result<()> {
        if tail.is_none() {
            *tail = Some(Tail::open(path, Position::End).await?);
        }
        let Some(t) = tail.as_mut() else {
            return Ok(());
        };

        self.ingest_lines(t).await?;
        let change = t.check().await?;
        if change != Change::Unchanged {
            // Finish what was written before the rotation.
            self.ingest_lines(t).await?;
            warn!(
                path = %path.display(),
                ?change,
                "Audit log rotated; reopening at its end, entries written in between may be missed"
            );
            *t = Tail::open(path, Position::End).await?;
        }
        Ok(())
    }

    /// Follows the most recently modified file in a directory until
    /// `shutdown` fires.
    ///
    /// Files present when watching starts are only read from their current
    /// end. When a different file becomes the newest, the rest of the current
    /// file is read first. A file tailed earlier resumes where it was left;
    /// a file created since watching started is read from its beginning.
    pub async fn watch_directory(
        &self,
        dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        info!(dir = %dir.display(), "Watching audit log directory");
        let mut state = DirState::default();
        let mut delays = self.io_retry.delays();
        loop {
            let wait = match self.poll_directory(&dir, &mut state).await {
                Ok(()) => {
                    delays = self.io_retry.delays();
                    self.poll_interval
                }
                Err(source) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            dir = %dir.display(),
                            error = %source,
                            ?delay,
                            "Failed to read audit log directory; retrying"
                        );
                        delay
                    }
                    None => return Err(WatchError::Io { path: dir, source }),
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(dir = %dir.display(), "Stopped watching audit log directory");
                    return Ok(());
                }
                _ = time::sleep(wait) => {}
            }
        }
    }

    async fn poll_directory(&self, dir: &Path, state: &mut DirState) -> io::Result<()> {
        let files = list_files(dir).await?;
        if state.started {
            // Forget removed files so that a reused inode is not resumed.
            let present = files
                .iter()
                .filter_map(|(_, meta)| FileId::of(meta))
                .collect::<HashSet<_>>();
            state.offsets.retain(|id, _| present.contains(id));
        } else {
            for (_, meta) in &files {
                if let Some(id) = FileId::of(meta) {
                    state.offsets.insert(id, meta.len());
                }
            }
        }

        if let Some(t) = state.tail.as_mut() {
            self.ingest_lines(t).await?;
        }

        let newest = files
            .into_iter()
            .filter_map(|(path, meta)| Some((meta.modified().ok()?, path, meta)))
            .max_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        let Some((_, newest, meta)) = newest else {
            state.started = true;
            return Ok(());
        };

        let switch = match state.tail.as_ref() {
            None => true,
            Some(t) => t.path() != newest || t.check().await? == Change::Replaced,
        };
        if switch {
            if let Some(t) = state.tail.take() {
                if let Some(id) = t.id() {
                    state.offsets.insert(id, t.resume_offset());
                }
            }

            let from = match FileId::of(&meta).and_then(|id| state.offsets.get(&id)) {
                Some(&offset) if offset <= meta.len() => Position::At(offset),
                // Truncated since it was last read.
                Some(_) => Position::Start,
                None if state.started => Position::Start,
                None => Position::End,
            };
            let mut next = Tail::open(&newest, from).await?;
            info!(path = %newest.display(), ?from, "Tailing audit log");
            self.ingest_lines(&mut next).await?;
            state.tail = Some(next);
        }
        state.started = true;
        Ok(())
    }

    async fn ingest_lines(&self, tail: &mut Tail) -> io::Result<()> {
        for line in tail.read_lines().await? {
            if line.trim().is_empty() {
                continue;
            }
            self.ingest(serde_json::from_str(&line));
        }
        Ok(())
    }

    /// Ingests a pushed batch. Entries are handled independently; a malformed
    /// entry does not affect the rest of the batch. Fails only if the body is
    /// not JSON.
    pub fn handle_push(&self, body: &[u8]) -> serde_json::Result<PushSummary> {
        let entries = entry::split_batch(body)?;
        let mut summary = PushSummary::default();
        for value in entries {
            match self.ingest(serde_json::from_value(value)) {
                Outcome::Accepted => summary.accepted += 1,
                Outcome::Ignored => summary.ignored += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Malformed => summary.malformed += 1,
            }
        }
        debug!(?summary, "Ingested pushed audit entries");
        Ok(summary)
    }

    fn ingest(&self, parsed: serde_json::Result<AuditEntry>) -> Outcome {
        let outcome = self.convert(parsed);
        self.metrics.inc(match outcome {
            Outcome::Accepted => "accepted",
            Outcome::Ignored => "ignored",
            Outcome::Skipped => "skipped",
            Outcome::Malformed => "malformed",
        });
        outcome
    }

    fn convert(&self, parsed: serde_json::Result<AuditEntry>) -> Outcome {
        let entry = match parsed {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, "Skipping malformed audit entry");
                return Outcome::Malformed;
            }
        };

        let audit_id = entry.audit_id.clone();
        let mutation = match entry.into_mutation() {
            Ok(mutation) => mutation,
            Err(reason) => {
                trace!(%audit_id, %reason, "Skipping audit entry");
                return Outcome::Skipped;
            }
        };

        if self.policy.current().is_ignored(&mutation) {
            trace!(%audit_id, "Ignored by policy");
            return Outcome::Ignored;
        }

        let event = ChangeEvent::new(mutation, Decision::Allowed);
        if !self.sink.try_enqueue(event) {
            debug!(%audit_id, "Audit event dropped by the pipeline");
        }
        Outcome::Accepted
    }
}

/// Lists the regular, non-hidden files in `dir`.
async fn list_files(dir: &Path) -> io::Result<Vec<(PathBuf, Metadata)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            // Removed between listing and stat.
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error),
        };
        if !meta.is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        files.push((entry.path(), meta));
    }
    Ok(files)
}
