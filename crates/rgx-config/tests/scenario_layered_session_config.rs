//! Scenario: session config is assembled from layered YAML files.
//!
//! # Invariants under test
//! - Later files override earlier ones key by key; untouched keys keep the
//!   earlier value.
//! - The config hash depends on content, not on key order.
//! - A credential-looking literal anywhere in the tree is refused.

use std::fs;

use rgx_config::{load_layered_yaml, RepairPolicy, SessionConfig};

#[test]
fn env_layer_overrides_base() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("base.yaml");
    let env = dir.path().join("paper.yaml");
    fs::write(
        &base,
        "session:\n  enabled: false\n  allowlist: [AAPL]\n  max_retry_attempts: 4\n",
    )?;
    fs::write(
        &env,
        "session:\n  enabled: true\n  repair_policy: auto_cancel_open_orders\n",
    )?;

    let loaded = load_layered_yaml(&[
        base.to_str().unwrap_or_default(),
        env.to_str().unwrap_or_default(),
    ])?;
    let cfg = SessionConfig::from_loaded(&loaded)?;
    assert!(cfg.enabled);
    assert!(cfg.is_allowlisted("AAPL"));
    assert_eq!(cfg.max_retry_attempts, 4);
    assert_eq!(cfg.repair_policy, RepairPolicy::AutoCancelOpenOrders);
    assert_eq!(cfg.kill_switch_cooldown_ms, SessionConfig::default().kill_switch_cooldown_ms);
    Ok(())
}

#[test]
fn hash_ignores_key_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let a = dir.path().join("a.yaml");
    let b = dir.path().join("b.yaml");
    fs::write(&a, "session:\n  enabled: true\n  allowlist: [AAPL]\n")?;
    fs::write(&b, "session:\n  allowlist: [AAPL]\n  enabled: true\n")?;

    let ha = load_layered_yaml(&[a.to_str().unwrap_or_default()])?.config_hash;
    let hb = load_layered_yaml(&[b.to_str().unwrap_or_default()])?.config_hash;
    assert_eq!(ha, hb);
    Ok(())
}

#[test]
fn secret_literal_in_file_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let p = dir.path().join("leaky.yaml");
    fs::write(&p, "broker:\n  api_key: \"sk-live-0123456789abcdef\"\n")?;

    let err = load_layered_yaml(&[p.to_str().unwrap_or_default()]).unwrap_err();
    assert!(format!("{err:#}").contains("CONFIG_SECRET_DETECTED"));
    Ok(())
}
