//! Durable JSONL leaf log
//!
//! Envelopes are appended to `events.jsonl`, one raw envelope per line,
//! and synced to disk before a publish returns. Replacements rewrite the
//! whole file through an atomic temp-file rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::memory::EventEntries;
use super::EventLog;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{DomainEvent, EventEnvelope, EventPages, RawEventEnvelope};
use crate::utils::{atomic_write_with, cleanup_temp_files};

/// Append-only event log persisted as JSON lines
pub struct JsonlEventLog<E: DomainEvent> {
    path: PathBuf,
    /// Held for the whole publish so file and memory never diverge
    entries: RwLock<EventEntries<E>>,
    changes: watch::Sender<i64>,
}

impl<E: DomainEvent> JsonlEventLog<E> {
    /// Open (or create) the log at the configured data directory
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        Self::open_path(config.events_path())
    }

    /// Open (or create) the log at an explicit file path
    pub fn open_path<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            let cleaned = cleanup_temp_files(parent)?;
            if cleaned > 0 {
                warn!(cleaned, "removed temp files left by an interrupted rewrite");
            }
        }

        let raw_events = load_raw_events(&path)?;
        let entries = EventEntries::from_raw(raw_events)?;
        let latest = entries.latest_version();

        info!(path = %path.display(), latest_version = latest, "opened event log");

        let (changes, _) = watch::channel(latest);
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            changes,
        })
    }

    /// Path to the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Load every envelope line from the log file
///
/// Blank lines are skipped; an unparseable line fails the load, since
/// skipping it would break dense numbering.
fn load_raw_events(path: &Path) -> EngineResult<Vec<RawEventEnvelope>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match RawEventEnvelope::from_json_line(&line) {
            Ok(raw) => events.push(raw),
            Err(e) => {
                warn!(line = line_num + 1, error = %e, "failed to parse event line");
                return Err(EngineError::Serialization(e));
            }
        }
    }

    Ok(events)
}

fn append_lines(path: &Path, raw_events: &[RawEventEnvelope]) -> EngineResult<()> {
    let mut buffer = String::new();
    for raw in raw_events {
        buffer.push_str(&raw.to_json_line()?);
        buffer.push('\n');
    }

    append_or_rollback(path, |file| {
        file.write_all(buffer.as_bytes())?;
        // Sync to disk for durability
        file.sync_all()
    })
}

/// Run `write` against the file opened for appending
///
/// A failed write truncates the file back to its previous length, so a
/// partial or unsynced batch never survives next to the entries in memory.
fn append_or_rollback<F>(path: &Path, write: F) -> EngineResult<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let prev_len = file.metadata()?.len();

    if let Err(e) = write(&mut file) {
        match file.set_len(prev_len).and_then(|_| file.sync_all()) {
            Ok(()) => warn!(error = %e, len = prev_len, "append failed, log truncated back"),
            Err(truncate) => error!(
                error = %e,
                truncate_error = %truncate,
                len = prev_len,
                "append failed and the log could not be truncated back"
            ),
        }
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl<E: DomainEvent> EventLog<E> for JsonlEventLog<E> {
    async fn publish(&self, envelopes: Vec<EventEnvelope<E>>) -> EngineResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let latest = {
            let mut entries = self.entries.write();
            entries.check_append(&envelopes)?;
            let raw_events = EventEntries::encode(&envelopes)?;
            append_lines(&self.path, &raw_events)?;
            entries.append(envelopes)?;
            entries.latest_version()
        };
        self.changes.send_replace(latest);
        Ok(())
    }

    async fn get_events(
        &self,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> EngineResult<EventPages<E>> {
        let events = self.entries.read().range(from_exclusive, to_inclusive)?;
        Ok(EventPages::from_vec(events))
    }

    async fn get_raw_events(&self) -> EngineResult<Vec<RawEventEnvelope>> {
        Ok(self.entries.read().raw())
    }

    /// Every call rewrites the whole file, so `k` replacements over `n`
    /// events cost `k` full rewrites.
    async fn replace_event(
        &self,
        at_version: i64,
        replacements: Vec<RawEventEnvelope>,
    ) -> EngineResult<()> {
        let latest = {
            let mut entries = self.entries.write();
            let mut updated = entries.clone();
            updated.replace(at_version, replacements)?;

            let raw_events = updated.raw();
            atomic_write_with(&self.path, |file| {
                for raw in &raw_events {
                    let line = raw.to_json_line().map_err(std::io::Error::other)?;
                    writeln!(file, "{}", line)?;
                }
                Ok(())
            })?;

            *entries = updated;
            entries.latest_version()
        };
        self.changes.send_replace(latest);
        Ok(())
    }

    async fn get_latest_version(&self) -> EngineResult<i64> {
        Ok(self.entries.read().latest_version())
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.changes.subscribe()
    }
}
