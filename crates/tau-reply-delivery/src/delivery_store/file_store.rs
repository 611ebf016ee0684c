//! File-backed delivery store.
//!
//! Layout under `state_dir`:
//! - `queue/<queue_id>.json` for pending records
//! - `failed/<queue_id>.json` for records that reached `failed`
//! - `events.jsonl` with one line per state change (size-rotated)
//!
//! Acknowledged records are removed from `queue/`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use super::{
    next_delivery_queue_id, sort_oldest_first, DeliveryRecord, DeliveryState, DeliveryStore,
    DeliveryStoreError, NewDeliveryRecord,
};
use crate::{current_unix_timestamp_ms, lock_unpoisoned};

const QUEUE_DIR: &str = "queue";
const FAILED_DIR: &str = "failed";
const EVENTS_LOG_FILE: &str = "events.jsonl";
const DEFAULT_EVENTS_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_EVENTS_MAX_FILES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDeliveryStoreConfig {
    pub state_dir: PathBuf,
    /// Rotate `events.jsonl` once it would exceed this size; 0 disables rotation.
    pub events_max_bytes: u64,
    pub events_max_files: usize,
}

impl FileDeliveryStoreConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            events_max_bytes: DEFAULT_EVENTS_MAX_BYTES,
            events_max_files: DEFAULT_EVENTS_MAX_FILES,
        }
    }

    /// Applies `TAU_LOG_ROTATION_MAX_BYTES` / `TAU_LOG_ROTATION_MAX_FILES` overrides.
    pub fn with_env_rotation(mut self) -> Self {
        if let Some(max_bytes) = std::env::var("TAU_LOG_ROTATION_MAX_BYTES")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
        {
            self.events_max_bytes = max_bytes;
        }
        if let Some(max_files) = std::env::var("TAU_LOG_ROTATION_MAX_FILES")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            self.events_max_files = max_files;
        }
        self
    }
}

#[derive(Debug, Serialize)]
struct DeliveryEventLine<'a> {
    timestamp_unix_ms: u64,
    queue_id: &'a str,
    event: &'a str,
    state: &'a str,
    channel: &'a str,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Durable store persisting one JSON manifest per delivery.
///
/// Disk I/O runs on tokio's blocking pool so slow filesystems never stall
/// runtime workers.
#[derive(Debug, Clone)]
pub struct FileDeliveryStore {
    inner: Arc<FileStoreInner>,
}

#[derive(Debug)]
struct FileStoreInner {
    config: FileDeliveryStoreConfig,
    write_lock: Mutex<()>,
}

impl FileDeliveryStore {
    /// Opens (and creates) the store layout under `config.state_dir`.
    pub fn open(config: FileDeliveryStoreConfig) -> Result<Self, DeliveryStoreError> {
        for dir in [
            config.state_dir.clone(),
            config.state_dir.join(QUEUE_DIR),
            config.state_dir.join(FAILED_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        }
        Ok(Self {
            inner: Arc::new(FileStoreInner {
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn state_dir(&self) -> &Path {
        self.inner.config.state_dir.as_path()
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.inner.queue_dir()
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.inner.failed_dir()
    }

    pub fn events_path(&self) -> PathBuf {
        self.inner.events_path()
    }

    /// Lists archived failed records, oldest first.
    pub fn load_failed_deliveries(&self) -> Result<Vec<DeliveryRecord>, DeliveryStoreError> {
        let mut records = read_records_in(&self.failed_dir())?;
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn run_blocking<T, F>(&self, task: F) -> Result<T, DeliveryStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&FileStoreInner) -> Result<T, DeliveryStoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let join = tokio::task::spawn_blocking(move || task(&inner));
        join.await.map_err(|error| {
            DeliveryStoreError::Task(format!("failed to join delivery store task: {error}"))
        })?
    }

    async fn update_blocking<F>(
        &self,
        queue_id: &str,
        event: &'static str,
        mutate: F,
    ) -> Result<DeliveryRecord, DeliveryStoreError>
    where
        F: FnOnce(&mut DeliveryRecord) -> Result<(), DeliveryStoreError> + Send + 'static,
    {
        let queue_id = queue_id.to_string();
        self.run_blocking(move |inner| inner.update(&queue_id, event, mutate))
            .await
    }
}

impl FileStoreInner {
    fn queue_dir(&self) -> PathBuf {
        self.config.state_dir.join(QUEUE_DIR)
    }

    fn failed_dir(&self) -> PathBuf {
        self.config.state_dir.join(FAILED_DIR)
    }

    fn events_path(&self) -> PathBuf {
        self.config.state_dir.join(EVENTS_LOG_FILE)
    }

    fn queue_path(&self, queue_id: &str) -> PathBuf {
        self.queue_dir().join(format!("{queue_id}.json"))
    }

    fn failed_path(&self, queue_id: &str) -> PathBuf {
        self.failed_dir().join(format!("{queue_id}.json"))
    }

    fn load_queued(&self, queue_id: &str) -> Result<DeliveryRecord, DeliveryStoreError> {
        let path = self.queue_path(queue_id);
        read_record(&path)?.ok_or_else(|| DeliveryStoreError::NotFound(queue_id.to_string()))
    }

    fn enqueue(&self, record: &DeliveryRecord) -> Result<(), DeliveryStoreError> {
        {
            let _guard = lock_unpoisoned(&self.write_lock);
            write_record_atomic(&self.queue_path(&record.queue_id), record)?;
        }
        self.append_event(record, "enqueued");
        Ok(())
    }

    /// Read-modify-write of one queued record; terminal records leave `queue/`.
    fn update<F>(
        &self,
        queue_id: &str,
        event: &str,
        mutate: F,
    ) -> Result<DeliveryRecord, DeliveryStoreError>
    where
        F: FnOnce(&mut DeliveryRecord) -> Result<(), DeliveryStoreError>,
    {
        let _guard = lock_unpoisoned(&self.write_lock);
        let mut record = self.load_queued(queue_id)?;
        mutate(&mut record)?;
        let queue_path = self.queue_path(queue_id);
        match record.state {
            DeliveryState::Acked => {
                std::fs::remove_file(&queue_path).map_err(|source| io_error(&queue_path, source))?;
            }
            DeliveryState::Failed => {
                let failed_path = self.failed_path(queue_id);
                write_record_atomic(&failed_path, &record)?;
                std::fs::remove_file(&queue_path).map_err(|source| io_error(&queue_path, source))?;
            }
            _ => write_record_atomic(&queue_path, &record)?,
        }
        self.append_event(&record, event);
        Ok(record)
    }

    fn append_event(&self, record: &DeliveryRecord, event: &str) {
        let line = DeliveryEventLine {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            queue_id: record.queue_id.as_str(),
            event,
            state: record.state.as_str(),
            channel: record.route.channel.as_str(),
            kind: record.kind.as_str(),
            error: record.last_error.as_deref(),
        };
        let result = serde_json::to_string(&line)
            .map_err(DeliveryStoreError::from)
            .and_then(|line| self.append_event_line(&line));
        if let Err(error) = result {
            tracing::warn!(
                queue_id = record.queue_id.as_str(),
                error = %error,
                "delivery event log append failed"
            );
        }
    }

    fn append_event_line(&self, line: &str) -> Result<(), DeliveryStoreError> {
        let path = self.events_path();
        if self.config.events_max_bytes > 0 && self.config.events_max_files > 0 {
            if let Ok(metadata) = std::fs::metadata(&path) {
                let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
                if metadata.len().saturating_add(incoming) > self.config.events_max_bytes {
                    rotate_events_log(&path, self.config.events_max_files)?;
                }
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        writeln!(file, "{line}").map_err(|source| io_error(&path, source))
    }
}

#[async_trait]
impl DeliveryStore for FileDeliveryStore {
    async fn enqueue_delivery(
        &self,
        record: NewDeliveryRecord,
    ) -> Result<String, DeliveryStoreError> {
        let queue_id = next_delivery_queue_id();
        let record = DeliveryRecord::from_new(queue_id.clone(), record);
        self.run_blocking(move |inner| inner.enqueue(&record)).await?;
        Ok(queue_id)
    }

    async fn mark_delivery_delivered(&self, queue_id: &str) -> Result<(), DeliveryStoreError> {
        self.update_blocking(queue_id, "delivered", |record| {
            record.transition(DeliveryState::DeliveredUnconfirmed, None)
        })
        .await
        .map(|_| ())
    }

    async fn ack_delivery(&self, queue_id: &str) -> Result<(), DeliveryStoreError> {
        self.update_blocking(queue_id, "acked", |record| {
            record.transition(DeliveryState::Acked, None)
        })
        .await
        .map(|_| ())
    }

    async fn fail_delivery(&self, queue_id: &str, error: &str) -> Result<(), DeliveryStoreError> {
        let error = error.to_string();
        self.update_blocking(queue_id, "failed", move |record| {
            record.transition(DeliveryState::Failed, Some(&error))
        })
        .await
        .map(|_| ())
    }

    async fn mark_delivery_uncertain(
        &self,
        queue_id: &str,
        error: &str,
    ) -> Result<(), DeliveryStoreError> {
        let error = error.to_string();
        self.update_blocking(queue_id, "uncertain", move |record| {
            record.transition(DeliveryState::Uncertain, Some(&error))
        })
        .await
        .map(|_| ())
    }

    async fn begin_recovery_attempt(
        &self,
        queue_id: &str,
    ) -> Result<DeliveryRecord, DeliveryStoreError> {
        self.update_blocking(queue_id, "recovery_attempt", DeliveryRecord::begin_attempt)
            .await
    }

    async fn touch_delivery(&self, queue_id: &str) -> Result<(), DeliveryStoreError> {
        self.update_blocking(queue_id, "lease", DeliveryRecord::touch)
            .await
            .map(|_| ())
    }

    async fn note_delivery_error(
        &self,
        queue_id: &str,
        error: &str,
    ) -> Result<(), DeliveryStoreError> {
        let error = error.to_string();
        self.update_blocking(queue_id, "error", move |record| {
            record.note_error(&error);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn load_pending_deliveries(&self) -> Result<Vec<DeliveryRecord>, DeliveryStoreError> {
        self.run_blocking(|inner| {
            let mut records = read_records_in(&inner.queue_dir())?
                .into_iter()
                .filter(|record| record.state.is_pending())
                .collect::<Vec<_>>();
            sort_oldest_first(&mut records);
            Ok(records)
        })
        .await
    }

    async fn get_delivery(
        &self,
        queue_id: &str,
    ) -> Result<Option<DeliveryRecord>, DeliveryStoreError> {
        let queue_id = queue_id.to_string();
        self.run_blocking(move |inner| {
            if let Some(record) = read_record(&inner.queue_path(&queue_id))? {
                return Ok(Some(record));
            }
            read_record(&inner.failed_path(&queue_id))
        })
        .await
    }
}

fn io_error(path: &Path, source: std::io::Error) -> DeliveryStoreError {
    DeliveryStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_record(path: &Path) -> Result<Option<DeliveryRecord>, DeliveryStoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path, source)),
    };
    Ok(Some(serde_json::from_str::<DeliveryRecord>(&raw)?))
}

fn read_records_in(dir: &Path) -> Result<Vec<DeliveryRecord>, DeliveryStoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_error(dir, source)),
    };
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        let is_manifest = path.is_file()
            && path
                .extension()
                .and_then(|value| value.to_str())
                .is_some_and(|value| value.eq_ignore_ascii_case("json"));
        if !is_manifest {
            continue;
        }
        match read_record(&path) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(DeliveryStoreError::Serde(error)) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "skipping unreadable delivery record"
                );
            }
            Err(error) => return Err(error),
        }
    }
    Ok(records)
}

/// Writes through a sibling temp file and renames it into place.
fn write_record_atomic(path: &Path, record: &DeliveryRecord) -> Result<(), DeliveryStoreError> {
    let mut payload = serde_json::to_string_pretty(record)?;
    payload.push('\n');
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(
        ".{}.tmp-{}",
        record.queue_id,
        std::process::id()
    ));
    {
        let mut file =
            std::fs::File::create(&temp_path).map_err(|source| io_error(&temp_path, source))?;
        file.write_all(payload.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|source| io_error(&temp_path, source))?;
    }
    std::fs::rename(&temp_path, path).map_err(|source| io_error(path, source))
}

fn rotate_events_log(path: &Path, max_files: usize) -> Result<(), DeliveryStoreError> {
    let rotated = |index: usize| PathBuf::from(format!("{}.{index}", path.display()));
    let oldest = rotated(max_files);
    if oldest.exists() {
        std::fs::remove_file(&oldest).map_err(|source| io_error(&oldest, source))?;
    }
    for index in (1..max_files).rev() {
        let from = rotated(index);
        if from.exists() {
            let to = rotated(index + 1);
            std::fs::rename(&from, &to).map_err(|source| io_error(&from, source))?;
        }
    }
    std::fs::rename(path, rotated(1)).map_err(|source| io_error(path, source))
}
