//! Offline checks over a JSONL audit stream.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::{compute_event_hash, AuditEvent};

/// Result of a verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// Every record passed.
    Valid { lines: usize },
    /// The stream breaks at the given 1-based line.
    Broken { line: usize, reason: String },
}

impl VerifyResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyResult::Valid { .. })
    }
}

fn parse_lines(content: &str) -> impl Iterator<Item = (usize, Result<AuditEvent>)> + '_ {
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            let ev = serde_json::from_str::<AuditEvent>(l.trim())
                .with_context(|| format!("parse audit event at line {}", i + 1));
            (i + 1, ev)
        })
}

/// `seq` must be strictly increasing per `run_id`.
pub fn verify_seq_monotonic_str(content: &str) -> Result<VerifyResult> {
    let mut last: HashMap<Uuid, u64> = HashMap::new();
    let mut count = 0usize;

    for (line, ev) in parse_lines(content) {
        let ev = ev?;
        count += 1;
        if let Some(prev) = last.get(&ev.run_id) {
            if ev.seq <= *prev {
                return Ok(VerifyResult::Broken {
                    line,
                    reason: format!(
                        "seq not strictly increasing for run {}: {} after {}",
                        ev.run_id, ev.seq, prev
                    ),
                });
            }
        }
        last.insert(ev.run_id, ev.seq);
    }

    Ok(VerifyResult::Valid { lines: count })
}

/// Verify the hash chain of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Each record's `hash_prev` must equal the previous record's `hash_self`,
/// and `hash_self` must match the recomputed hash.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut count = 0usize;

    for (line, ev) in parse_lines(content) {
        let ev = ev?;
        count += 1;

        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, ev.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = ev.hash_self {
            let recomputed = compute_event_hash(&ev)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }

        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: count })
}
