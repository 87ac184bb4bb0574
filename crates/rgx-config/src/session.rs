//! Typed session configuration.
//!
//! Every field's effect on the core:
//!
//! | Field | Effect |
//! |---|---|
//! | `enabled` | preflight fails unless `true` (default OFF) |
//! | `allowlist` | preflight fails if empty; intents outside it are refused before any broker call |
//! | `max_retry_attempts` | hard cap on attempts per broker call |
//! | `max_total_retry_duration_ms` | hard cap on time spent retrying one call |
//! | `retry_base_delay_ms` / `rate_limit_base_delay_ms` | first backoff delay for ordinary transient errors / rate limits |
//! | `retry_max_delay_ms` | cap on any single backoff delay |
//! | `retry_jitter_ratio` / `retry_jitter_seed` | deterministic jitter shaping |
//! | `kill_switch_cooldown_ms` | TRIPPED -> RECOVERING delay |
//! | `kill_switch_auto_rearm` | RECOVERING -> ARMED without an operator once the latest reconcile is clean |
//! | `max_retry_exhaustions` | GiveUp outcomes tolerated before the kill switch trips |
//! | `reconcile_epsilon_micros` | tolerated per-instrument position delta |
//! | `broker_call_deadline_ms` | deadline attached to every adapter call |
//! | `repair_policy` | who may execute `cancel_open_orders` from a repair plan |
//! | `starting_cash_micros` | enables the negative-balance invariant |
//! | `cancel_open_orders_on_stop` | shutdown cancels working orders |

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::LoadedConfig;

/// Who is authorised to execute a repair plan's `cancel_open_orders` step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPolicy {
    /// The plan is recorded; an operator must act on it.
    #[default]
    RequireOperator,
    /// The orchestrator cancels open orders itself when a plan asks for it.
    AutoCancelOpenOrders,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub enabled: bool,
    pub allowlist: BTreeSet<String>,

    pub max_retry_attempts: u32,
    pub max_total_retry_duration_ms: u64,
    pub retry_base_delay_ms: u64,
    pub rate_limit_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ratio: f64,
    pub retry_jitter_seed: u64,

    pub kill_switch_cooldown_ms: u64,
    pub kill_switch_auto_rearm: bool,
    pub max_retry_exhaustions: u32,

    pub reconcile_epsilon_micros: i64,
    pub broker_call_deadline_ms: u64,
    pub repair_policy: RepairPolicy,

    pub starting_cash_micros: Option<i64>,
    pub cancel_open_orders_on_stop: bool,
}

impl Default for SessionConfig {
    /// Default is NO-LIVE: disabled with an empty allowlist.
    fn default() -> Self {
        Self {
            enabled: false,
            allowlist: BTreeSet::new(),
            max_retry_attempts: 5,
            max_total_retry_duration_ms: 30_000,
            retry_base_delay_ms: 100,
            rate_limit_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            retry_jitter_ratio: 0.2,
            retry_jitter_seed: 0,
            kill_switch_cooldown_ms: 60_000,
            kill_switch_auto_rearm: false,
            max_retry_exhaustions: 3,
            reconcile_epsilon_micros: 0,
            broker_call_deadline_ms: 2_000,
            repair_policy: RepairPolicy::RequireOperator,
            starting_cash_micros: None,
            cancel_open_orders_on_stop: true,
        }
    }
}

impl SessionConfig {
    /// Read the `session` section of a loaded config. A missing section yields
    /// the defaults (which fail preflight).
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let cfg = match loaded.config_json.get("session") {
            None => SessionConfig::default(),
            Some(v) => serde_json::from_value(v.clone()).context("invalid session config")?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values no retry/kill-switch policy can make sense of.
    /// The governance gate (`enabled`, `allowlist`) is NOT checked here; that is
    /// preflight's job, so a disabled config still loads.
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_attempts == 0 {
            bail!("CONFIG_INVALID session.max_retry_attempts must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_ratio) || self.retry_jitter_ratio.is_nan() {
            bail!(
                "CONFIG_INVALID session.retry_jitter_ratio must be within [0, 1] (got {})",
                self.retry_jitter_ratio
            );
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms
            || self.rate_limit_base_delay_ms > self.retry_max_delay_ms
        {
            bail!("CONFIG_INVALID session base delays must not exceed retry_max_delay_ms");
        }
        if self.max_retry_exhaustions == 0 {
            bail!("CONFIG_INVALID session.max_retry_exhaustions must be >= 1");
        }
        if self.reconcile_epsilon_micros < 0 {
            bail!("CONFIG_INVALID session.reconcile_epsilon_micros must be >= 0");
        }
        if self.broker_call_deadline_ms == 0 {
            bail!("CONFIG_INVALID session.broker_call_deadline_ms must be > 0");
        }
        if let Some(cash) = self.starting_cash_micros {
            if cash < 0 {
                bail!("CONFIG_INVALID session.starting_cash_micros must be >= 0");
            }
        }
        Ok(())
    }

    pub fn is_allowlisted(&self, instrument: &str) -> bool {
        self.allowlist.contains(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_layered_yaml_from_strings;

    #[test]
    fn defaults_are_no_live() {
        let cfg = SessionConfig::default();
        assert!(!cfg.enabled);
        assert!(cfg.allowlist.is_empty());
        assert_eq!(cfg.repair_policy, RepairPolicy::RequireOperator);
    }

    #[test]
    fn missing_section_yields_defaults() {
        let loaded = load_layered_yaml_from_strings(&["other: 1\n"]).unwrap();
        let cfg = SessionConfig::from_loaded(&loaded).unwrap();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn parses_session_section() {
        let yaml = r#"
session:
  enabled: true
  allowlist: [BTC-USD, ETH-USD]
  max_retry_attempts: 3
  kill_switch_cooldown_ms: 5000
  repair_policy: auto_cancel_open_orders
"#;
        let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
        let cfg = SessionConfig::from_loaded(&loaded).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.is_allowlisted("ETH-USD"));
        assert!(!cfg.is_allowlisted("DOGE-USD"));
        assert_eq!(cfg.max_retry_attempts, 3);
        assert_eq!(cfg.kill_switch_cooldown_ms, 5_000);
        assert_eq!(cfg.repair_policy, RepairPolicy::AutoCancelOpenOrders);
        assert_eq!(cfg.retry_base_delay_ms, 100, "unset fields keep defaults");
    }

    #[test]
    fn unknown_keys_are_refused() {
        let loaded = load_layered_yaml_from_strings(&["session:\n  enabld: true\n"]).unwrap();
        assert!(SessionConfig::from_loaded(&loaded).is_err());
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let cfg = SessionConfig {
            max_retry_attempts: 0,
            ..SessionConfig::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("max_retry_attempts"), "{err}");
    }

    #[test]
    fn jitter_ratio_out_of_range_is_invalid() {
        let cfg = SessionConfig {
            retry_jitter_ratio: 1.5,
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
