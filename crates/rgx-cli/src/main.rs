use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use rgx_audit::{verify_hash_chain_str, verify_seq_monotonic_str, AuditLog, VerifyResult};
use rgx_broker_paper::{Fault, SimConfig, SimOp, SimulatedBroker};
use rgx_config::SessionConfig;
use rgx_execution::PermanentKind;
use rgx_risk::VarBacktestEngine;
use rgx_runtime::{LiveSessionOrchestrator, SessionState};
use rgx_schemas::{units_to_micros, FixedClock, OrderIntent, SharedClock};

#[derive(Parser)]
#[command(name = "rgx")]
#[command(about = "Risk-gated execution core operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> session overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run a bounded session against the simulated broker
    Simulate {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// JSON array of order intents, consumed one per step
        #[arg(long)]
        intents: String,

        /// Number of steps to run before stopping
        #[arg(long, default_value_t = 10)]
        steps: usize,

        /// Simulated time between steps
        #[arg(long, default_value_t = 1_000)]
        step_ms: i64,

        /// Session start time (epoch ms). Defaults to now.
        #[arg(long)]
        start_ms: Option<i64>,

        /// Instrument mark, e.g. `AAPL=189.25`. Repeatable.
        #[arg(long = "mark")]
        marks: Vec<String>,

        /// One-shot broker fault, e.g. `place:timeout`. Repeatable, queued in order.
        #[arg(long = "fault")]
        faults: Vec<String>,

        /// Audit JSONL path. Defaults to exports/<run_id>/audit.jsonl
        #[arg(long)]
        audit_out: Option<String>,

        /// Disable the audit hash chain
        #[arg(long = "no-hash-chain", default_value_t = false)]
        no_hash_chain: bool,
    },

    /// Verify an audit JSONL file (seq monotonic, hash chain)
    AuditVerify {
        path: String,

        /// Skip the hash chain check (for logs written without one)
        #[arg(long = "seq-only", default_value_t = false)]
        seq_only: bool,
    },

    /// Backtest a VaR series against realized P&L (CSV with `var,pnl` columns)
    VarBacktest {
        #[arg(long)]
        input: String,

        #[arg(long, default_value_t = 0.99)]
        confidence: f64,

        #[arg(long, default_value_t = 0.05)]
        significance: f64,
    },
}

fn main() -> Result<()> {
    // Dev convenience: load .env.local if present. Never overrides real env vars.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::ConfigHash { paths } => {
            let refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = rgx_config::load_layered_yaml(&refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }
        Commands::Simulate {
            config_paths,
            intents,
            steps,
            step_ms,
            start_ms,
            marks,
            faults,
            audit_out,
            no_hash_chain,
        } => simulate(SimulateArgs {
            config_paths,
            intents,
            steps,
            step_ms,
            start_ms,
            marks,
            faults,
            audit_out,
            hash_chain: !no_hash_chain,
        })?,
        Commands::AuditVerify { path, seq_only } => {
            let content = fs::read_to_string(&path).with_context(|| format!("read audit file {path}"))?;
            let seq = verify_seq_monotonic_str(&content)?;
            report_verify("seq", &seq)?;
            if !seq_only {
                let chain = verify_hash_chain_str(&content)?;
                report_verify("hash_chain", &chain)?;
            }
            println!("audit_ok=true path={path}");
        }
        Commands::VarBacktest {
            input,
            confidence,
            significance,
        } => {
            let (var, pnl) = read_var_csv(&input)?;
            let engine = VarBacktestEngine::with_significance(confidence, significance)
                .context("invalid backtest parameters")?;
            let result = engine
                .run(&var, &pnl)
                .context("var backtest failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

struct SimulateArgs {
    config_paths: Vec<String>,
    intents: String,
    steps: usize,
    step_ms: i64,
    start_ms: Option<i64>,
    marks: Vec<String>,
    faults: Vec<String>,
    audit_out: Option<String>,
    hash_chain: bool,
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let refs: Vec<&str> = args.config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = rgx_config::load_layered_yaml(&refs)?;
    let cfg = SessionConfig::from_loaded(&loaded)?;

    let raw = fs::read_to_string(&args.intents)
        .with_context(|| format!("read intents file {}", args.intents))?;
    let intents: Vec<OrderIntent> =
        serde_json::from_str(&raw).with_context(|| format!("parse intents file {}", args.intents))?;

    let clock = FixedClock::shared(args.start_ms.unwrap_or_else(|| Utc::now().timestamp_millis()));
    let shared: SharedClock = clock.clone();

    let broker = Arc::new(SimulatedBroker::new(
        SimConfig {
            starting_cash_micros: cfg.starting_cash_micros,
            ..SimConfig::default()
        },
        shared.clone(),
    ));
    for m in &args.marks {
        let (inst, px) = parse_mark(m)?;
        broker.set_mark(&inst, px);
    }
    for f in &args.faults {
        let (op, fault) = parse_fault(f)?;
        broker.script(op, fault);
    }

    let run_id = Uuid::new_v4();
    let audit_path = args
        .audit_out
        .unwrap_or_else(|| format!("exports/{run_id}/audit.jsonl"));
    let mut audit = AuditLog::to_file(run_id, shared.clone(), &audit_path)?;
    if args.hash_chain {
        audit = audit.with_hash_chain();
    }

    info!(%run_id, config_hash = %loaded.config_hash, intents = intents.len(), "simulate");
    let mut session =
        LiveSessionOrchestrator::new(cfg, broker.clone(), VecDeque::from(intents), shared, audit)
            .with_config_hash(loaded.config_hash.clone());

    if session.preflight()? == SessionState::PreflightOk {
        session.start()?;
        for _ in 0..args.steps {
            if session.state().is_final() {
                break;
            }
            session.step()?;
            clock.advance_ms(args.step_ms);
        }
        if matches!(session.state(), SessionState::Running | SessionState::Stopping) {
            session.stop()?;
        }
    }

    println!("run_id={run_id}");
    println!("config_hash={}", loaded.config_hash);
    println!("audit_path={audit_path}");
    println!("place_calls={}", broker.place_calls());
    println!("{}", serde_json::to_string_pretty(&session.status())?);

    match session.state() {
        SessionState::PreflightFailed => bail!("PREFLIGHT_FAILED: see audit {audit_path}"),
        SessionState::ErrorRequiresOperator => {
            bail!("ERROR_REQUIRES_OPERATOR: see audit {audit_path}")
        }
        _ => Ok(()),
    }
}

fn report_verify(what: &str, r: &VerifyResult) -> Result<()> {
    match r {
        VerifyResult::Valid { lines } => {
            println!("{what}=valid lines={lines}");
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            bail!("AUDIT_BROKEN check={what} line={line} reason={reason}")
        }
    }
}

fn parse_mark(s: &str) -> Result<(String, i64)> {
    let (inst, px) = s
        .split_once('=')
        .with_context(|| format!("mark must be INSTRUMENT=PRICE (got {s:?})"))?;
    let px: f64 = px.trim().parse().with_context(|| format!("bad mark price in {s:?}"))?;
    let micros = units_to_micros(px).with_context(|| format!("bad mark price in {s:?}"))?;
    Ok((inst.trim().to_string(), micros))
}

fn parse_fault(s: &str) -> Result<(SimOp, Fault)> {
    let (op, kind) = s
        .split_once(':')
        .with_context(|| format!("fault must be OP:KIND (got {s:?})"))?;
    let op = match op.trim().to_ascii_lowercase().as_str() {
        "place" => SimOp::Place,
        "cancel" => SimOp::Cancel,
        "query" => SimOp::Query,
        "lookup" => SimOp::Lookup,
        "list_open" => SimOp::ListOpen,
        "fills" => SimOp::Fills,
        other => bail!("unknown fault op {other:?}"),
    };
    let fault = match kind.trim().to_ascii_lowercase().as_str() {
        "timeout" => Fault::Timeout,
        "accept_then_timeout" => Fault::AcceptThenTimeout,
        "unavailable" => Fault::Unavailable,
        "rate_limited" => Fault::RateLimited,
        "reject" => Fault::Reject(PermanentKind::Rejected),
        "invalid" => Fault::Reject(PermanentKind::InvalidParameters),
        "insufficient_balance" => Fault::Reject(PermanentKind::InsufficientBalance),
        other => bail!("unknown fault kind {other:?}"),
    };
    Ok((op, fault))
}

#[derive(Deserialize)]
struct VarRow {
    var: f64,
    pnl: f64,
}

fn read_var_csv(path: &str) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("open csv {path}"))?;
    let mut var = Vec::new();
    let mut pnl = Vec::new();
    for (i, row) in rdr.deserialize::<VarRow>().enumerate() {
        let row = row.with_context(|| format!("csv row {}", i + 2))?;
        var.push(row.var);
        pnl.push(row.pnl);
    }
    Ok((var, pnl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_marks_into_micros() {
        assert_eq!(parse_mark("AAPL=189.25").unwrap(), ("AAPL".to_string(), 189_250_000));
        assert!(parse_mark("AAPL").is_err());
        assert!(parse_mark("AAPL=abc").is_err());
    }

    #[test]
    fn parses_faults() {
        assert_eq!(parse_fault("place:timeout").unwrap(), (SimOp::Place, Fault::Timeout));
        assert_eq!(
            parse_fault("Fills:rate_limited").unwrap(),
            (SimOp::Fills, Fault::RateLimited)
        );
        assert!(parse_fault("place:explode").is_err());
        assert!(parse_fault("teleport:timeout").is_err());
    }
}
