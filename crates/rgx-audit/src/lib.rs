//! rgx-audit
//!
//! Append-only audit log for one session run.
//!
//! - One record per JSON line: `{seq, run_id, ts, code, payload}` (+ optional
//!   `hash_prev` / `hash_self` when the hash chain is enabled).
//! - `seq` is strictly increasing per `run_id`; records are never rewritten.
//! - `ts` comes from the injected clock only.
//! - Payloads are redacted before they are written: credential-named keys and
//!   secret-looking values never reach the log.
//!
//! The log is owned by exactly one orchestrator for the lifetime of a run; no
//! other component holds a writer.

mod redact;
mod verify;

pub use redact::{redact_payload, REDACTED};
pub use verify::{verify_hash_chain, verify_hash_chain_str, verify_seq_monotonic_str, VerifyResult};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rgx_schemas::SharedClock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub run_id: Uuid,
    pub ts: DateTime<Utc>,
    pub code: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_self: Option<String>,
}

/// Where records go.
#[derive(Debug)]
pub enum AuditSink {
    /// Kept in memory (tests, dry runs).
    Memory,
    /// Appended to a JSONL file; parent directories are created on open.
    /// Records are not retained in memory; the file is the only copy.
    File(PathBuf),
}

/// Process-scoped append-only writer.
pub struct AuditLog {
    run_id: Uuid,
    clock: SharedClock,
    sink: AuditSink,
    hash_chain: bool,
    last_hash: Option<String>,
    /// Next sequence number to hand out.
    seq: u64,
    /// Records appended through a memory sink, in order. Empty for files.
    events: Vec<AuditEvent>,
}

impl AuditLog {
    pub fn in_memory(run_id: Uuid, clock: SharedClock) -> Self {
        Self {
            run_id,
            clock,
            sink: AuditSink::Memory,
            hash_chain: false,
            last_hash: None,
            seq: 0,
            events: Vec::new(),
        }
    }

    pub fn to_file(run_id: Uuid, clock: SharedClock, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }
        Ok(Self {
            run_id,
            clock,
            sink: AuditSink::File(path),
            hash_chain: false,
            last_hash: None,
            seq: 0,
            events: Vec::new(),
        })
    }

    /// Enable the SHA-256 hash chain for all subsequent records.
    pub fn with_hash_chain(mut self) -> Self {
        self.hash_chain = true;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        usize::try_from(self.seq).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }

    /// Retained records. Always empty for a file sink; read the file.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Records with the given code, in append order.
    pub fn events_with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a AuditEvent> {
        self.events.iter().filter(move |e| e.code == code)
    }

    /// Append one record. The payload is redacted first.
    ///
    /// On a write failure the sequence number is NOT consumed, so a retry by
    /// the caller keeps `seq` gap-free.
    pub fn append(&mut self, code: &str, payload: Value) -> Result<AuditEvent> {
        let mut ev = AuditEvent {
            seq: self.seq,
            run_id: self.run_id,
            ts: self.clock.now_utc(),
            code: code.to_string(),
            payload: redact_payload(&payload),
            hash_prev: None,
            hash_self: None,
        };

        let mut next_hash = self.last_hash.clone();
        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            let h = compute_event_hash(&ev)?;
            ev.hash_self = Some(h.clone());
            next_hash = Some(h);
        }

        match &self.sink {
            AuditSink::File(path) => {
                let line = canonical_json_line(&ev)?;
                append_line(path, &line)?;
            }
            AuditSink::Memory => self.events.push(ev.clone()),
        }

        self.seq += 1;
        self.last_hash = next_hash;
        Ok(ev)
    }

    /// All records as JSON lines (same bytes a file sink writes). A file
    /// sink reads its file back.
    pub fn to_jsonl(&self) -> Result<String> {
        if let AuditSink::File(path) = &self.sink {
            return fs::read_to_string(path).with_context(|| format!("read audit log {:?}", path));
        }
        let mut out = String::new();
        for ev in &self.events {
            out.push_str(&canonical_json_line(ev)?);
            out.push('\n');
        }
        Ok(out)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Sorted keys, compact JSON. One record == one line.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    serde_json::to_string(&sort_keys(&raw)).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash over the canonical JSON of the record without `hash_self`.
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
