//! slawatch CLI - SLA tracking for recurring batch runs
//!
//! Thin wrapper over `slawatch-core`: every subcommand opens the configured
//! services, performs one operation and prints the result.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use slawatch_core::ingestion::{CompleteRun, StartRun};
use slawatch_core::logging::{LogConfig, init_logging};
use slawatch_core::model::{
    BreachEvent, CalculatorKey, CalculatorStatusResponse, DailyAggregate, Frequency, JobRun, RunStatus,
};
use slawatch_core::store::BreachStore;
use slawatch_core::tasks::spawn_background_tasks;
use slawatch_core::{Config, Error, Services};

/// slawatch - SLA run tracking, live breach detection and alerting
#[derive(Parser, Debug)]
#[command(name = "slawatch")]
#[command(version = slawatch_core::VERSION)]
#[command(about = "Track batch runs against SLA deadlines and alert on breaches", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, env = "SLAWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run detection, early warning, reconciliation and index refresh until Ctrl-C
    Serve,

    /// Record the start of a run
    StartRun {
        run_id: String,
        calculator_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "DAILY")]
        frequency: Frequency,
        /// Reporting date (YYYY-MM-DD)
        #[arg(long)]
        reporting_date: NaiveDate,
        /// Start instant (RFC 3339); defaults to now
        #[arg(long)]
        start_time: Option<DateTime<Utc>>,
        /// SLA wall-clock time in CET (HH:MM)
        #[arg(long, value_parser = parse_time_of_day)]
        sla_time: Option<NaiveTime>,
        #[arg(long)]
        expected_duration_ms: Option<i64>,
        /// Free-form run parameters (JSON)
        #[arg(long)]
        params: Option<String>,
    },

    /// Record the completion of a run
    CompleteRun {
        run_id: String,
        #[arg(long)]
        tenant: String,
        /// End instant (RFC 3339); defaults to now
        #[arg(long)]
        end_time: Option<DateTime<Utc>>,
        /// Terminal status; defaults to SUCCESS
        #[arg(long)]
        status: Option<RunStatus>,
    },

    /// Current run and recent history of one calculator
    Status {
        calculator_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "DAILY")]
        frequency: Frequency,
    },

    /// Status of many calculators in one read
    BatchStatus {
        #[arg(required = true)]
        calculator_ids: Vec<String>,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "DAILY")]
        frequency: Frequency,
    },

    /// One run by id
    Run {
        run_id: String,
        #[arg(long)]
        tenant: String,
    },

    /// Latest runs of one calculator, newest first
    History {
        calculator_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "DAILY")]
        frequency: Frequency,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Daily run aggregates of one calculator
    Averages {
        calculator_id: String,
        #[arg(long)]
        tenant: String,
        /// Reporting dates to look back over
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Breach events whose alert is PENDING, FAILED or still RETRYING
    Breaches {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Retry delivery of pending alerts once
    Reconcile {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Deadline index summary
    Index,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Load and validate the configuration
    Validate,
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| format!("expected HH:MM: {e}"))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Config::load().context("loading default config"),
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_run(run: &JobRun) {
    println!("{} [{}] {}", run.run_id, run.status, run.calculator_name);
    println!("  calculator: {} (tenant {})", run.calculator_id, run.tenant_id);
    println!("  reporting date: {} ({})", run.reporting_date, run.frequency);
    println!("  started: {}", run.start_time.to_rfc3339());
    if let Some(deadline) = run.sla_deadline {
        println!("  SLA deadline: {}", deadline.to_rfc3339());
    }
    if let Some(end) = run.end_time {
        println!("  ended: {}", end.to_rfc3339());
    }
    if let Some(ms) = run.duration_ms {
        println!("  duration: {}", slawatch_core::sla_time::format_duration(ms));
    }
    if run.sla_breached {
        println!(
            "  SLA BREACHED: {}",
            run.sla_breach_reason.as_deref().unwrap_or("unknown reason")
        );
    }
}

fn print_status(response: &CalculatorStatusResponse) {
    let current = &response.current;
    println!(
        "{} ({}) tenant {}",
        response.calculator_name, response.calculator_id, response.tenant_id
    );
    println!(
        "  current: {} [{}]{}{}",
        current.run_id,
        current.status,
        current
            .duration_formatted
            .as_deref()
            .map(|d| format!(" {d}"))
            .unwrap_or_default(),
        if current.sla_breached { " BREACHED" } else { "" }
    );
    for past in &response.history {
        println!(
            "  {} [{}]{}",
            past.run_id,
            past.status,
            if past.sla_breached { " BREACHED" } else { "" }
        );
    }
}

fn print_history(runs: &[JobRun]) {
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }
    for run in runs {
        println!(
            "{} {} [{}] {}{}",
            run.reporting_date,
            run.run_id,
            run.status,
            run.duration_ms
                .map(slawatch_core::sla_time::format_duration)
                .unwrap_or_else(|| "-".to_string()),
            if run.sla_breached { " BREACHED" } else { "" }
        );
    }
}

fn print_averages(aggregates: &[DailyAggregate]) {
    if aggregates.is_empty() {
        println!("No completed runs in range.");
        return;
    }
    let clock = |minutes: i64| format!("{:02}:{:02}", minutes / 60, minutes % 60);
    for day in aggregates {
        println!(
            "{} runs={} ok={} breaches={} avg={} start~{} end~{} CET",
            day.reporting_date,
            day.total_runs,
            day.success_runs,
            day.sla_breaches,
            slawatch_core::sla_time::format_duration(day.avg_duration_ms),
            clock(day.avg_start_min_cet),
            clock(day.avg_end_min_cet)
        );
    }
}

fn print_breaches(breaches: &[BreachEvent]) {
    if breaches.is_empty() {
        println!("No unalerted breaches.");
        return;
    }
    for breach in breaches {
        println!(
            "{:>6} {} {} {} [{}] retries={} {}",
            breach.breach_id.map(|id| id.to_string()).unwrap_or_default(),
            breach.created_at.to_rfc3339(),
            breach.run_id,
            breach.severity,
            breach.alert_status,
            breach.retry_count,
            breach.last_error.as_deref().unwrap_or("")
        );
    }
}

#[derive(Serialize)]
struct IndexSummary {
    monitored: u64,
    next_deadline: Option<DateTime<Utc>>,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let mut log_config: LogConfig = config.general.log_config();
    if cli.verbose {
        log_config.level = "debug".to_string();
    }
    init_logging(&log_config).context("initializing logging")?;

    if let Command::Config { action } = &cli.command {
        match action {
            ConfigAction::Show => print!("{}", config.to_toml_string()?),
            ConfigAction::Validate => {
                config.validate()?;
                println!("Configuration is valid.");
            }
        }
        return Ok(());
    }

    let services = Services::open(&config).await?;
    let now = Utc::now();

    match cli.command {
        Command::Serve => {
            let handles = spawn_background_tasks(&services, &config);
            tracing::info!(components = ?handles.components(), "slawatch serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            handles.signal_shutdown();
            handles.join().await;
        }
        Command::StartRun {
            run_id,
            calculator_id,
            tenant,
            name,
            frequency,
            reporting_date,
            start_time,
            sla_time,
            expected_duration_ms,
            params,
        } => {
            let run = services
                .ingestion
                .start_run(StartRun {
                    run_id,
                    calculator_id,
                    calculator_name: name,
                    tenant_id: tenant,
                    frequency,
                    reporting_date,
                    start_time: start_time.unwrap_or(now),
                    sla_time_of_day: sla_time,
                    expected_duration_ms,
                    run_parameters: params,
                })
                .await?;
            emit(cli.json, &run, print_run)?;
        }
        Command::CompleteRun {
            run_id,
            tenant,
            end_time,
            status,
        } => {
            let run = services
                .ingestion
                .complete_run(CompleteRun {
                    run_id,
                    tenant_id: tenant,
                    end_time: end_time.unwrap_or(now),
                    status,
                })
                .await?;
            emit(cli.json, &run, print_run)?;
        }
        Command::Status {
            calculator_id,
            tenant,
            frequency,
        } => {
            let response = services
                .query
                .status(&CalculatorKey::new(calculator_id, tenant), frequency)
                .await?;
            emit(cli.json, &response, print_status)?;
        }
        Command::BatchStatus {
            calculator_ids,
            tenant,
            frequency,
        } => {
            let responses = services
                .query
                .batch_status(&calculator_ids, &tenant, frequency)
                .await?;
            emit(cli.json, &responses, |all| {
                for response in all {
                    print_status(response);
                }
                let missing = calculator_ids.len().saturating_sub(all.len());
                if missing > 0 {
                    println!("({missing} calculator(s) without recent runs)");
                }
            })?;
        }
        Command::Run { run_id, tenant } => {
            let run = services.query.run(&run_id, &tenant).await?;
            emit(cli.json, &run, print_run)?;
        }
        Command::History {
            calculator_id,
            tenant,
            frequency,
            limit,
        } => {
            let runs = services
                .query
                .run_history(&CalculatorKey::new(calculator_id, tenant), frequency, limit)
                .await?;
            emit(cli.json, &runs, |r| print_history(r))?;
        }
        Command::Averages {
            calculator_id,
            tenant,
            days,
        } => {
            let aggregates = services
                .query
                .daily_averages(&CalculatorKey::new(calculator_id, tenant), days)
                .await?;
            emit(cli.json, &aggregates, |a| print_averages(a))?;
        }
        Command::Breaches { limit } => {
            let breaches = services.store.find_unalerted(limit, now).await?;
            emit(cli.json, &breaches, |b| print_breaches(b))?;
        }
        Command::Reconcile { limit } => {
            let report = services
                .alerts
                .reconcile(limit.unwrap_or(config.alerting.reconciliation_batch))
                .await?;
            emit(cli.json, &report, |r| {
                println!(
                    "examined={} sent={} failed={} deferred={}",
                    r.examined, r.sent, r.failed, r.deferred
                );
            })?;
        }
        Command::Index => {
            let summary = IndexSummary {
                monitored: services.index.count().await.map_err(Error::from)?,
                next_deadline: services.index.next_deadline().await.map_err(Error::from)?,
            };
            emit(cli.json, &summary, |s| {
                println!("monitored runs: {}", s.monitored);
                match s.next_deadline {
                    Some(deadline) => println!("next deadline: {}", deadline.to_rfc3339()),
                    None => println!("next deadline: none"),
                }
            })?;
        }
        Command::Config { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err.downcast_ref::<Error>().and_then(Error::remediation) {
                eprint!("{}", remediation.render_plain());
            }
            std::process::ExitCode::FAILURE
        }
    }
}
