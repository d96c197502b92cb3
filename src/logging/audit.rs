//! Audit trail of guard decisions
//!
//! A global, non-blocking log that appends JSONL entries to
//! `{state_dir}/audit.jsonl`. Events go through a bounded mpsc channel to a
//! background Tokio task, so a guard never waits on disk I/O; when the
//! channel is full the event is dropped with a warning.
//!
//! ```no_run
//! use carapace_guard::logging::audit::{self, AuditEvent, AuditLog};
//! use std::path::PathBuf;
//!
//! # async fn example() {
//! AuditLog::init(PathBuf::from("/var/lib/carapace")).await;
//!
//! // No-ops if not initialized
//! audit::audit(AuditEvent::RateLimited {
//!     key: "203.0.113.9".into(),
//!     retry_after_secs: 840,
//! });
//! # }
//! ```

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RejectionCategory;

/// Rotate once the file reaches this size (50 MB).
const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Bounded channel capacity for non-blocking writes.
const CHANNEL_CAPACITY: usize = 10_000;

const AUDIT_FILE_NAME: &str = "audit.jsonl";
const AUDIT_ROTATED_NAME: &str = "audit.jsonl.1";

/// Security decisions recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    AuthFailure {
        remote_ip: String,
        endpoint: String,
        reason: String,
    },
    LockoutStarted {
        key: String,
        attempts: u32,
        lockout_secs: u64,
    },
    RateLimited {
        key: String,
        retry_after_secs: u64,
    },
    SsrfBlocked {
        url: String,
        host: String,
        address: Option<String>,
        class: String,
        hop: u32,
    },
    OriginRejected {
        origin: String,
        host: String,
        reason: String,
        category: RejectionCategory,
    },
    InstallPathRejected {
        requested_id: String,
        reason: String,
        category: RejectionCategory,
    },
    WeakSecretRejected {
        reason: String,
    },
    MarkerSpoofDetected {
        source: String,
        count: usize,
    },
}

impl AuditEvent {
    /// Snake-case event name (matches the serde tag).
    pub fn event_name(&self) -> &'static str {
        match self {
            AuditEvent::AuthFailure { .. } => "auth_failure",
            AuditEvent::LockoutStarted { .. } => "lockout_started",
            AuditEvent::RateLimited { .. } => "rate_limited",
            AuditEvent::SsrfBlocked { .. } => "ssrf_blocked",
            AuditEvent::OriginRejected { .. } => "origin_rejected",
            AuditEvent::InstallPathRejected { .. } => "install_path_rejected",
            AuditEvent::WeakSecretRejected { .. } => "weak_secret_rejected",
            AuditEvent::MarkerSpoofDetected { .. } => "marker_spoof_detected",
        }
    }

    pub fn category(&self) -> RejectionCategory {
        match self {
            AuditEvent::OriginRejected { category, .. }
            | AuditEvent::InstallPathRejected { category, .. } => *category,
            _ => RejectionCategory::Policy,
        }
    }
}

/// A single line in the audit JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub ts: String,
    pub event: String,
    pub category: RejectionCategory,
    /// Event-specific payload.
    pub data: Value,
}

impl AuditEntry {
    pub fn new(event: &AuditEvent) -> Self {
        AuditEntry {
            ts: Utc::now().to_rfc3339(),
            event: event.event_name().to_string(),
            category: event.category(),
            data: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

static AUDIT_LOG: OnceLock<AuditLog> = OnceLock::new();

/// Process-wide audit trail. Producers enqueue, one task writes.
pub struct AuditLog {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditLog {
    /// Create `state_dir` and start the writer task. Only the first call in
    /// a process has an effect.
    pub async fn init(state_dir: PathBuf) {
        if AUDIT_LOG.get().is_some() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&state_dir) {
            tracing::error!(dir = %state_dir.display(), "audit: cannot create state dir: {e}");
            return;
        }

        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_CAPACITY);
        let file = AuditFile::new(
            state_dir.join(AUDIT_FILE_NAME),
            state_dir.join(AUDIT_ROTATED_NAME),
            MAX_FILE_SIZE,
        );
        if AUDIT_LOG.set(AuditLog { tx }).is_ok() {
            tokio::spawn(writer_task(rx, file));
        }
    }

    /// Enqueue an event. Drops it with a warning when the queue is full.
    pub fn log(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(AuditEntry::new(&event)) {
            tracing::warn!(event = event.event_name(), "audit: event dropped: {e}");
        }
    }
}

/// The live JSONL file plus its single rotated predecessor.
struct AuditFile {
    path: PathBuf,
    rotated: PathBuf,
    max_size: u64,
    file: Option<fs::File>,
    size: u64,
}

impl AuditFile {
    fn new(path: PathBuf, rotated: PathBuf, max_size: u64) -> Self {
        AuditFile {
            path,
            rotated,
            max_size,
            file: None,
            size: 0,
        }
    }

    fn open(&mut self) -> io::Result<&mut fs::File> {
        if self.file.is_none() {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.size = file.metadata()?.len();
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "audit file not open")),
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        fs::rename(&self.path, &self.rotated)?;
        self.size = 0;
        Ok(())
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        self.open()?;
        if self.size >= self.max_size {
            self.rotate()?;
        }
        let file = self.open()?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        self.size += line.len() as u64 + 1;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }
}

/// Drain the queue in batches, syncing once per batch.
async fn writer_task(mut rx: mpsc::Receiver<AuditEntry>, mut file: AuditFile) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        for entry in &batch {
            let line = match serde_json::to_string(entry) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(event = %entry.event, "audit: cannot serialize entry: {e}");
                    continue;
                }
            };
            if let Err(e) = file.append(&line) {
                tracing::error!(path = %file.path.display(), "audit: write failed: {e}");
            }
        }
        if let Err(e) = file.sync() {
            tracing::error!(path = %file.path.display(), "audit: sync failed: {e}");
        }
    }
}

/// Record an event if the audit log is running; otherwise do nothing.
pub fn audit(event: AuditEvent) {
    if let Some(log) = AUDIT_LOG.get() {
        log.log(event);
    }
}

/// The newest `limit` entries under `state_dir`, oldest first, without
/// starting the log.
pub fn audit_entries_in(state_dir: &Path, limit: usize) -> Vec<AuditEntry> {
    read_tail_entries(&state_dir.join(AUDIT_FILE_NAME), limit)
}

/// Keep a sliding window of the last `limit` parseable lines. Lines that do
/// not parse (partial writes, foreign data) are skipped.
fn read_tail_entries(path: &Path, limit: usize) -> Vec<AuditEntry> {
    let Ok(file) = fs::File::open(path) else {
        return Vec::new();
    };
    if limit == 0 {
        return Vec::new();
    }

    let mut window: VecDeque<AuditEntry> = VecDeque::with_capacity(limit.min(1024));
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line.trim()) else {
            continue;
        };
        if window.len() == limit {
            window.pop_front();
        }
        window.push_back(entry);
    }
    window.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_events() -> Vec<AuditEvent> {
        vec![
            AuditEvent::AuthFailure {
                remote_ip: "203.0.113.1".into(),
                endpoint: "/hooks/github".into(),
                reason: "token mismatch".into(),
            },
            AuditEvent::LockoutStarted {
                key: "203.0.113.1".into(),
                attempts: 6,
                lockout_secs: 900,
            },
            AuditEvent::RateLimited {
                key: "203.0.113.1".into(),
                retry_after_secs: 899,
            },
            AuditEvent::SsrfBlocked {
                url: "http://10.0.0.1/".into(),
                host: "10.0.0.1".into(),
                address: Some("10.0.0.1".into()),
                class: "private".into(),
                hop: 0,
            },
            AuditEvent::OriginRejected {
                origin: "https://evil.example".into(),
                host: "gateway.local".into(),
                reason: "mismatch".into(),
                category: RejectionCategory::Policy,
            },
            AuditEvent::InstallPathRejected {
                requested_id: "../x".into(),
                reason: "traversal".into(),
                category: RejectionCategory::MalformedInput,
            },
            AuditEvent::WeakSecretRejected {
                reason: "too short".into(),
            },
            AuditEvent::MarkerSpoofDetected {
                source: "webhook".into(),
                count: 2,
            },
        ]
    }

    fn entry(event: &AuditEvent) -> AuditEntry {
        AuditEntry::new(event)
    }

    #[test]
    fn test_event_names_unique_and_match_tag() {
        let events = sample_events();
        let mut names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        for event in &events {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json["type"], event.event_name());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), events.len(), "event names must be unique");
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        for event in sample_events() {
            let json = serde_json::to_string(&event).unwrap();
            let back: AuditEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(event, back);
        }
    }

    #[test]
    fn test_entry_carries_category() {
        let events = sample_events();
        assert_eq!(entry(&events[0]).category, RejectionCategory::Policy);
        assert_eq!(entry(&events[5]).category, RejectionCategory::MalformedInput);

        let json = serde_json::to_value(entry(&events[5])).unwrap();
        assert_eq!(json["category"], "malformed_input");
        assert_eq!(json["event"], "install_path_rejected");
    }

    #[test]
    fn test_read_tail_entries_returns_last_n() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(AUDIT_FILE_NAME);
        let mut file = fs::File::create(&path).unwrap();
        for (i, event) in sample_events().iter().enumerate() {
            let mut e = entry(event);
            e.ts = format!("2026-01-01T00:00:0{i}+00:00");
            writeln!(file, "{}", serde_json::to_string(&e).unwrap()).unwrap();
        }
        drop(file);

        let entries = read_tail_entries(&path, 3);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].event, "marker_spoof_detected");
        assert_eq!(entries[0].event, "install_path_rejected");
    }

    #[test]
    fn test_read_tail_entries_skips_bad_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(AUDIT_FILE_NAME);
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "   ").unwrap();
        writeln!(
            file,
            "{}",
            serde_json::to_string(&entry(&sample_events()[2])).unwrap()
        )
        .unwrap();
        drop(file);

        let entries = read_tail_entries(&path, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "rate_limited");
    }

    #[test]
    fn test_read_tail_entries_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(read_tail_entries(&dir.path().join("missing.jsonl"), 10).is_empty());
    }

    fn audit_file(dir: &Path, max_size: u64) -> AuditFile {
        AuditFile::new(
            dir.join(AUDIT_FILE_NAME),
            dir.join(AUDIT_ROTATED_NAME),
            max_size,
        )
    }

    #[tokio::test]
    async fn test_writer_drains_queue_into_file() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(writer_task(rx, audit_file(dir.path(), MAX_FILE_SIZE)));

        for event in sample_events() {
            tx.send(entry(&event)).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        let entries = read_tail_entries(&dir.path().join(AUDIT_FILE_NAME), 100);
        assert_eq!(entries.len(), sample_events().len());
        assert_eq!(entries[3].event, "ssrf_blocked");
    }

    #[test]
    fn test_append_picks_up_existing_size_and_rotates() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(AUDIT_FILE_NAME);
        let rotated_path = dir.path().join(AUDIT_ROTATED_NAME);
        fs::write(&log_path, vec![b'x'; 2048]).unwrap();

        let mut file = audit_file(dir.path(), 1024);
        file.append(r#"{"first":true}"#).unwrap();
        file.sync().unwrap();

        assert_eq!(fs::metadata(&rotated_path).unwrap().len(), 2048);
        assert_eq!(fs::read_to_string(&log_path).unwrap(), "{\"first\":true}\n");
    }

    #[test]
    fn test_append_tracks_size_across_writes() {
        let dir = TempDir::new().unwrap();
        let mut file = audit_file(dir.path(), 20);
        let line = "0123456789";

        file.append(line).unwrap();
        file.append(line).unwrap();
        assert!(!dir.path().join(AUDIT_ROTATED_NAME).exists());

        // 22 bytes written, so the third line starts a new file.
        file.append(line).unwrap();
        let rotated = fs::read_to_string(dir.path().join(AUDIT_ROTATED_NAME)).unwrap();
        assert_eq!(rotated.lines().count(), 2);
        let live = fs::read_to_string(dir.path().join(AUDIT_FILE_NAME)).unwrap();
        assert_eq!(live, "0123456789\n");
    }

    #[tokio::test]
    async fn test_entries_readable_from_state_dir() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel::<AuditEntry>(4);
        let writer = tokio::spawn(writer_task(rx, audit_file(dir.path(), MAX_FILE_SIZE)));
        tx.send(entry(&sample_events()[6])).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let entries = audit_entries_in(dir.path(), 5);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, RejectionCategory::Policy);
        assert_eq!(entries[0].data["reason"], "too short");
    }

    #[test]
    fn test_read_tail_zero_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(AUDIT_FILE_NAME);
        fs::write(&path, serde_json::to_string(&entry(&sample_events()[0])).unwrap()).unwrap();
        assert!(read_tail_entries(&path, 0).is_empty());
    }

    #[test]
    fn test_audit_noop_without_init() {
        audit(AuditEvent::WeakSecretRejected {
            reason: "empty".into(),
        });
        assert!(AUDIT_LOG.get().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(1);
        let log = AuditLog { tx };

        log.log(sample_events()[0].clone());
        log.log(sample_events()[1].clone());

        assert_eq!(rx.recv().await.unwrap().event, "auth_failure");
        assert!(rx.try_recv().is_err());
    }
}
