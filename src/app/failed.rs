use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{eid::Eid, semantic::IngestItem, storage::DataDir};

use super::errors::AppError;

const JOURNAL_FILE: &str = "failed-requests.json";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An engine call that failed and is kept for a later retry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailedRequest {
    Embed {
        owner_id: u64,
        collection_id: u64,
        items: Vec<IngestItem>,
    },
    DeleteIndex {
        owner_id: u64,
        collection_id: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailedStatus {
    Pending,
    /// Gave up after the configured number of attempts
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedEntry {
    pub id: Eid,
    pub request: FailedRequest,
    pub error: String,
    #[serde(default)]
    pub attempts: u32,
    pub status: FailedStatus,
    pub recorded_at: i64,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct JournalDump {
    entries: Vec<FailedEntry>,
    now: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub succeeded: usize,
    pub still_pending: usize,
    pub exhausted: usize,
    /// Left untouched because the circuit was open
    pub not_attempted: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// `failed-requests.json` under the base directory.
pub struct FailedRequestJournal {
    dir: DataDir,
    max_attempts: u32,
    lock: Mutex<()>,
}

impl FailedRequestJournal {
    pub fn new(dir: DataDir, max_attempts: u32) -> Self {
        Self {
            dir,
            max_attempts: max_attempts.max(1),
            lock: Mutex::new(()),
        }
    }

    fn read_dump(&self) -> Result<JournalDump, JournalError> {
        if !self.dir.exists(JOURNAL_FILE) {
            return Ok(JournalDump::default());
        }
        Ok(serde_json::from_slice(&self.dir.read(JOURNAL_FILE)?)?)
    }

    fn write_dump(&self, dump: &mut JournalDump) -> Result<(), JournalError> {
        dump.now = now();
        let data = serde_json::to_string_pretty(&dump)?;
        self.dir.write(JOURNAL_FILE, data.as_bytes())?;
        Ok(())
    }

    pub fn record(&self, request: FailedRequest, error: &str) -> Result<Eid, JournalError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut dump = self.read_dump()?;
        let id = Eid::new();
        dump.entries.push(FailedEntry {
            id: id.clone(),
            request,
            error: error.to_string(),
            attempts: 0,
            status: FailedStatus::Pending,
            recorded_at: now(),
            last_attempt_at: None,
        });
        self.write_dump(&mut dump)?;

        log::info!("recorded failed request {id} for retry");
        Ok(id)
    }

    pub fn entries(&self) -> Result<Vec<FailedEntry>, JournalError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read_dump()?.entries)
    }

    /// Replay every pending entry through `replay`.
    ///
    /// Entries that succeed are removed. Entries that fail have their attempt
    /// counter bumped and are marked failed once it reaches the limit. A
    /// replay rejected by an open circuit never reached the engine and leaves
    /// the entry as it was.
    pub fn retry_pending<F>(&self, mut replay: F) -> Result<RetrySummary, JournalError>
    where
        F: FnMut(&FailedRequest) -> Result<(), AppError>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut dump = self.read_dump()?;
        let mut summary = RetrySummary::default();
        let mut kept = Vec::with_capacity(dump.entries.len());

        for mut entry in dump.entries.drain(..) {
            if entry.status != FailedStatus::Pending {
                kept.push(entry);
                continue;
            }

            match replay(&entry.request) {
                Ok(()) => {
                    log::info!("retried request {} succeeded", entry.id);
                    summary.succeeded += 1;
                }
                Err(AppError::CircuitOpen) => {
                    log::debug!("request {} not retried: circuit open", entry.id);
                    summary.not_attempted += 1;
                    kept.push(entry);
                }
                Err(err) => {
                    entry.attempts += 1;
                    entry.last_attempt_at = Some(now());
                    entry.error = err.to_string();
                    if entry.attempts >= self.max_attempts {
                        log::error!(
                            "request {} failed {} times, giving up: {err}",
                            entry.id,
                            entry.attempts
                        );
                        entry.status = FailedStatus::Failed;
                        summary.exhausted += 1;
                    } else {
                        log::warn!("retry {} of request {} failed: {err}", entry.attempts, entry.id);
                        summary.still_pending += 1;
                    }
                    kept.push(entry);
                }
            }
        }

        dump.entries = kept;
        self.write_dump(&mut dump)?;

        Ok(summary)
    }
}
