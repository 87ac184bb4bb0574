//! Scenario: `rgx simulate` runs a bounded session against the simulated
//! broker and leaves an audit file that `rgx audit-verify` accepts.
//!
//! # Invariants under test
//! - A timed-out placement is retried and still yields exactly one order.
//! - The audit JSONL has strictly increasing seq and an intact hash chain.
//! - Tampering with one record is detected.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

const CONFIG: &str = r#"
session:
  enabled: true
  allowlist: [AAPL]
  retry_jitter_ratio: 0.0
"#;

const INTENTS: &str = r#"[
  {"intent_id": "I1", "instrument": "AAPL", "side": "BUY", "qty_micros": 10000000, "order_type": "MARKET"}
]"#;

#[test]
fn simulate_then_verify_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = dir.path().join("session.yaml");
    let intents = dir.path().join("intents.json");
    let audit = dir.path().join("audit.jsonl");
    fs::write(&cfg, CONFIG)?;
    fs::write(&intents, INTENTS)?;

    Command::cargo_bin("rgx")?
        .args([
            "simulate",
            "--config",
            cfg.to_str().unwrap_or_default(),
            "--intents",
            intents.to_str().unwrap_or_default(),
            "--steps",
            "3",
            "--start-ms",
            "1700000000000",
            "--mark",
            "AAPL=150",
            "--fault",
            "place:accept_then_timeout",
            "--audit-out",
            audit.to_str().unwrap_or_default(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("place_calls=1"))
        .stdout(predicate::str::contains("\"session_state\": \"STOPPED\""));

    let content = fs::read_to_string(&audit)?;
    assert!(content.contains("\"BROKER_PLACE_TRANSIENT\""));
    assert!(content.contains("\"BROKER_LOOKUP_OK\""));
    assert!(content.contains("\"INTENT_PLACED\""));

    Command::cargo_bin("rgx")?
        .args(["audit-verify", audit.to_str().unwrap_or_default()])
        .assert()
        .success()
        .stdout(predicate::str::contains("hash_chain=valid"));

    let tampered = content.replacen("\"INTENT_PLACED\"", "\"INTENT_REJECTED\"", 1);
    fs::write(&audit, tampered)?;
    Command::cargo_bin("rgx")?
        .args(["audit-verify", audit.to_str().unwrap_or_default()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("AUDIT_BROKEN"));

    Ok(())
}
