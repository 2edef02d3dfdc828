//! Persistent, hash-chained event log.
//!
//! [`EventJournal`] is an append-only disk log of bus [`Event`]s, one JSON
//! line per event, each record SHA-256 chained to its predecessor so that
//! post-hoc tampering of earlier lines is detectable via
//! [`EventJournal::verify_integrity`]. One journal file is kept per
//! session; the filename is derived from a fingerprint of the session id
//! for collision resistance.
//!
//! # Disk format
//!
//! ```text
//! {"seq":0,"prev_hash":"","hash":"ab12...","event":{...}}
//! {"seq":1,"prev_hash":"ab12...","hash":"cd34...","event":{...}}
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::event::{Event, EventType};
//! use agentmesh::event_journal::EventJournal;
//! use std::path::PathBuf;
//!
//! # fn main() -> std::io::Result<()> {
//! let mut journal = EventJournal::open(&PathBuf::from("journals"), "session-1")?;
//! journal.append(&Event::new(EventType::NodeStart, "agent"))?;
//! journal.append(&Event::new(EventType::NodeComplete, "agent"))?;
//! assert!(journal.verify_integrity());
//! assert_eq!(journal.records().len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::agentmesh::event::Event;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

/// One persisted line of the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Zero-based position in the journal.
    pub seq: u64,
    /// SHA-256 hex digest of the previous record (empty for the first).
    pub prev_hash: String,
    /// SHA-256 hex digest of this record's canonical representation.
    pub hash: String,
    /// The journaled event.
    pub event: Event,
}

/// Append-only, SHA-256 hash-chained, disk-persisted log of bus events.
///
/// The journal owns an in-memory `Vec<JournalRecord>` mirrored to a
/// `.jsonl` file on disk. New records are appended atomically (one JSON
/// line per event).
pub struct EventJournal {
    records: Vec<JournalRecord>,
    file_path: PathBuf,
    auto_flush: bool,
}

impl EventJournal {
    /// Open an existing journal for `session_id` or create a new one.
    ///
    /// If the `.jsonl` file already exists, all persisted records are
    /// loaded back into memory and appending continues the chain.
    pub fn open(journal_dir: &PathBuf, session_id: &str) -> io::Result<Self> {
        fs::create_dir_all(journal_dir)?;
        let file_path = journal_dir.join(journal_filename(session_id));

        let records = if file_path.exists() {
            let file = fs::File::open(&file_path)?;
            let reader = BufReader::new(file);
            let mut entries = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Failed to parse journal record: {}", e),
                    )
                })?;
                entries.push(record);
            }
            entries
        } else {
            Vec::new()
        };

        Ok(Self {
            records,
            file_path,
            auto_flush: true,
        })
    }

    /// Append an event to the journal.
    ///
    /// Computes the record's SHA-256 hash chained to the previous record
    /// and, when `auto_flush` is enabled, writes one JSON line immediately.
    pub fn append(&mut self, event: &Event) -> io::Result<&JournalRecord> {
        let seq = self.records.len() as u64;
        let prev_hash = self
            .records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_default();

        let canonical = canonical_record(seq, &prev_hash, event)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let record = JournalRecord {
            seq,
            prev_hash,
            hash,
            event: event.clone(),
        };

        if self.auto_flush {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            let json = serde_json::to_string(&record)
                .map_err(|e| io::Error::other(format!("Failed to serialize record: {}", e)))?;
            writeln!(file, "{}", json)?;
        }

        self.records.push(record);
        Ok(self.records.last().unwrap())
    }

    /// Walk the chain and verify every hash matches its recomputed value.
    ///
    /// Returns `false` on the first mismatch — either a broken `prev_hash`
    /// link or a record whose canonical hash no longer matches.
    pub fn verify_integrity(&self) -> bool {
        let mut prev_hash = String::new();
        for record in &self.records {
            if record.prev_hash != prev_hash {
                return false;
            }
            let canonical = match canonical_record(record.seq, &record.prev_hash, &record.event) {
                Ok(c) => c,
                Err(_) => return false,
            };
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            if record.hash != format!("{:x}", hasher.finalize()) {
                return false;
            }
            prev_hash = record.hash.clone();
        }
        true
    }

    /// All journaled records in append order.
    pub fn records(&self) -> &[JournalRecord] {
        &self.records
    }

    /// Replay the journaled events in order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.records.iter().map(|r| &r.event)
    }

    /// The file path used for persistence.
    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    /// Control whether appended records are immediately flushed to disk.
    ///
    /// When `false`, appended records live only in memory and are lost if
    /// the process crashes before a flushing append.
    pub fn set_auto_flush(&mut self, auto_flush: bool) {
        self.auto_flush = auto_flush;
    }
}

fn canonical_record(seq: u64, prev_hash: &str, event: &Event) -> io::Result<String> {
    let event_json = serde_json::to_string(event)
        .map_err(|e| io::Error::other(format!("Failed to serialize event: {}", e)))?;
    Ok(format!("{}|{}|{}", seq, prev_hash, event_json))
}

/// Derive a collision-resistant filename from the session id.
///
/// Format: `{safe_id}-{sha256(session_id)[..16]}.jsonl`. The session id is
/// sanitized for filesystem safety; the 16-hex-char fingerprint gives ~2^64
/// collision resistance across ids that sanitize identically.
pub fn journal_filename(session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let fingerprint = &digest[..16];

    let safe_id: String = session_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{}-{}.jsonl", safe_id, fingerprint)
}
