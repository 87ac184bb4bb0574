//! rgx-testkit
//!
//! Wiring for scenario tests: a [`LiveSessionOrchestrator`] over a
//! [`SimulatedBroker`], a [`FixedClock`] and an in-memory audit log, with
//! handles kept on the broker and clock so tests can script faults and move
//! time.

use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use rgx_audit::AuditLog;
use rgx_broker_paper::{SimConfig, SimulatedBroker};
use rgx_config::SessionConfig;
use rgx_runtime::{LiveSessionOrchestrator, SessionState};
use rgx_schemas::{FixedClock, OrderIntent, SharedClock, Side};

pub type SimSession = LiveSessionOrchestrator<Arc<SimulatedBroker>, VecDeque<OrderIntent>>;

/// Epoch ms every harness clock starts at.
pub const T0_MS: i64 = 1_700_000_000_000;

pub struct Harness {
    pub session: SimSession,
    pub broker: Arc<SimulatedBroker>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(cfg: SessionConfig, intents: Vec<OrderIntent>) -> Self {
        Self::with_sim(cfg, SimConfig::default(), intents)
    }

    pub fn with_sim(cfg: SessionConfig, sim: SimConfig, intents: Vec<OrderIntent>) -> Self {
        let clock = FixedClock::shared(T0_MS);
        let shared: SharedClock = clock.clone();
        let broker = Arc::new(SimulatedBroker::new(sim, shared.clone()));
        let audit = AuditLog::in_memory(Uuid::new_v4(), shared.clone()).with_hash_chain();
        let session =
            LiveSessionOrchestrator::new(cfg, broker.clone(), VecDeque::from(intents), shared, audit);
        Self {
            session,
            broker,
            clock,
        }
    }

    /// preflight + start. Fails if preflight does not pass.
    pub fn start(&mut self) -> Result<()> {
        let state = self.session.preflight()?;
        anyhow::ensure!(state == SessionState::PreflightOk, "preflight ended in {state}");
        self.session.start()?;
        Ok(())
    }

    /// Run `n` steps, advancing the clock by `step_ms` after each.
    pub fn run(&mut self, n: usize, step_ms: i64) -> Result<()> {
        for _ in 0..n {
            if self.session.state().is_final() {
                break;
            }
            self.session.step()?;
            self.clock.advance_ms(step_ms);
        }
        Ok(())
    }

    /// Audit codes in append order.
    pub fn audit_codes(&self) -> Vec<String> {
        self.session
            .audit()
            .events()
            .iter()
            .map(|e| e.code.clone())
            .collect()
    }

    pub fn count(&self, code: &str) -> usize {
        self.session.audit().events_with_code(code).count()
    }
}

/// Enabled, allowlisted, jitter off. Everything else at defaults.
pub fn armed_config(instruments: &[&str]) -> SessionConfig {
    SessionConfig {
        enabled: true,
        allowlist: instruments.iter().map(|s| s.to_string()).collect(),
        retry_jitter_ratio: 0.0,
        ..SessionConfig::default()
    }
}

pub fn market_buy(intent_id: &str, instrument: &str, qty_units: i64) -> OrderIntent {
    OrderIntent::market(
        intent_id,
        instrument,
        Side::Buy,
        qty_units * rgx_schemas::MICROS_PER_UNIT,
        T0_MS,
    )
}

/// JSON array of intents, as the CLI reads them.
pub fn load_intents_json(path: &str) -> Result<Vec<OrderIntent>> {
    let s = fs::read_to_string(path).with_context(|| format!("read intents: {path}"))?;
    let intents: Vec<OrderIntent> = serde_json::from_str(&s).context("parse intents json")?;
    Ok(intents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_starts_armed_session() {
        let mut h = Harness::new(armed_config(&["AAPL"]), vec![]);
        h.start().unwrap();
        assert_eq!(h.session.state(), SessionState::Running);
        assert_eq!(h.count("SESSION_STATE"), 2);
    }

    #[test]
    fn harness_refuses_default_config() {
        let mut h = Harness::new(SessionConfig::default(), vec![]);
        assert!(h.start().is_err());
    }
}
