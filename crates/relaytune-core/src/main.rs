use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use relaytune_core::catalog::{CatalogOptions, catalog};
use relaytune_core::cli::{Cli, Commands, OutputFormat};
use relaytune_core::error::{Result as TuneResult, TuneError};
use relaytune_core::gateway::{GatewayConfig, enable_gateway};
use relaytune_core::latency::{self, HoldState};
use relaytune_core::probe::probe;
use relaytune_core::report::RunOutcome;
use relaytune_core::runner::PipelineRunner;
use relaytune_core::tuner::{RealSystemTuner, RingLimits, SystemTuner};
use relaytune_netfilter::IptablesManager;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let format = if cli.json {
        OutputFormat::Json
    } else {
        cli.output_format
    };

    match run(cli) {
        Ok((message, data, code)) => {
            emit_outcome(format, &message, data, code);
            exit(code);
        }
        Err(err) => {
            emit_error(format, &err);
            exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<(String, Value, i32)> {
    match cli.command {
        Commands::Probe => {
            let profile = probe()?;
            let data = serde_json::to_value(&profile)?;
            let message = match &profile.primary_interface {
                Some(iface) => format!("probed {} host, primary interface {iface}", profile.platform),
                None => format!("probed {} host, no default route", profile.platform),
            };
            Ok((message, data, 0))
        }
        Commands::Tune(args) => {
            let profile = probe()?;
            let options = CatalogOptions {
                irq_core: args.core,
                ..CatalogOptions::default()
            };
            let steps = catalog(&options);
            // SIGINT/SIGTERM stop the run between steps; the step in
            // flight is never interrupted mid-mutation.
            let cancel = Arc::new(AtomicBool::new(false));
            let cancel_flag = Arc::clone(&cancel);
            ctrlc::set_handler(move || {
                cancel_flag.store(true, Ordering::SeqCst);
            })
            .context("failed to register interrupt handler")?;

            let mut runner = PipelineRunner::new().with_cancel(cancel);
            if args.dry_run {
                runner = runner.dry_run();
            }

            let report = if args.dry_run {
                let tuner = NullTuner;
                runner.run(&steps, &profile, &tuner)
            } else {
                let tuner = RealSystemTuner::new(profile.platform)?;
                runner.run(&steps, &profile, &tuner)
            };

            let code = match report.outcome {
                RunOutcome::Aborted { .. } => 1,
                _ => 0,
            };
            let message = report.render_text();
            let data = serde_json::to_value(&report)?;
            Ok((message, data, code))
        }
        Commands::Gateway(args) => {
            let profile = probe()?;
            let tuner = RealSystemTuner::new(profile.platform)?;
            let firewall = IptablesManager::new()?;
            let config = GatewayConfig::new(&args.interface, args.subnet, args.mtu);
            let outcome = enable_gateway(&config, &profile, &tuner, &firewall)?;
            let message = format!(
                "gateway enabled: {} -> {} ({})",
                outcome.internal_interface, outcome.wan_interface, outcome.internal_subnet
            );
            let data = serde_json::to_value(&outcome)?;
            Ok((message, data, 0))
        }
        Commands::LatencyHoldWorker(args) => {
            latency::hold_worker(&args.marker).context("latency hold worker failed")?;
            Ok(("latency hold released".to_string(), Value::Null, 0))
        }
    }
}

fn emit_outcome(format: OutputFormat, message: &str, data: Value, code: i32) {
    match format {
        OutputFormat::Json => {
            println!("{}", outcome_envelope(message, data, code));
        }
        OutputFormat::Text => {
            println!("{message}");
        }
    }
}

/// An aborted run still carries its per-step report in `data`, but the
/// envelope status must match the exit code.
fn outcome_envelope(message: &str, data: Value, code: i32) -> Value {
    let status = if code == 0 { "ok" } else { "error" };
    json!({
        "status": status,
        "message": message,
        "data": data,
    })
}

fn emit_error(format: OutputFormat, err: &anyhow::Error) {
    match format {
        OutputFormat::Json => {
            let details: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
            let envelope = json!({
                "status": "error",
                "message": err.to_string(),
                "details": details,
            });
            eprintln!("{envelope}");
        }
        OutputFormat::Text => {
            eprintln!("error: {err:#}");
        }
    }
}

/// Tuner used for dry runs, where the runner never invokes apply.
struct NullTuner;

impl SystemTuner for NullTuner {
    fn read_sysctl(&self, _key: &str) -> TuneResult<String> {
        Err(inert())
    }
    fn write_sysctl(&self, _key: &str, _value: &str) -> TuneResult<()> {
        Err(inert())
    }
    fn set_adaptive_coalescing(&self, _iface: &str) -> TuneResult<()> {
        Err(inert())
    }
    fn ring_limits(&self, _iface: &str) -> TuneResult<RingLimits> {
        Err(inert())
    }
    fn set_ring_sizes(&self, _iface: &str, _rx: u32, _tx: u32) -> TuneResult<()> {
        Err(inert())
    }
    fn set_wifi_power_save(&self, _iface: &str, _enabled: bool) -> TuneResult<()> {
        Err(inert())
    }
    fn stop_service(&self, _name: &str) -> TuneResult<()> {
        Err(inert())
    }
    fn interface_irqs(&self, _iface: &str) -> TuneResult<Vec<u32>> {
        Err(inert())
    }
    fn pin_irq(&self, _irq: u32, _core: u32) -> TuneResult<()> {
        Err(inert())
    }
    fn set_hugepage_mode(&self, _mode: &str) -> TuneResult<()> {
        Err(inert())
    }
    fn load_module(&self, _name: &str) -> TuneResult<()> {
        Err(inert())
    }
    fn exempt_udp_from_conntrack(&self) -> TuneResult<()> {
        Err(inert())
    }
    fn acquire_latency_hold(&self) -> TuneResult<HoldState> {
        Err(inert())
    }
    fn set_interface_mtu(&self, _iface: &str, _mtu: u32) -> TuneResult<()> {
        Err(inert())
    }
}

fn inert() -> TuneError {
    TuneError::System("no mutations during a dry run".to_string())
}
