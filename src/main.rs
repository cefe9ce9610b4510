use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mirrorsync::config::LoggingConfig;
use mirrorsync::filter::{overlap, FilterSet};
use mirrorsync::health::CheckResult;
use mirrorsync::{BackupEngine, Config, HealthCheck, SyncSummary};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Mirror a live tree through a local cache to a remote store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan source against the mirror and list candidate paths
    Scan,

    /// Show what a push would change
    Status {
        /// Compare the mirror with the remote instead of the source with the mirror
        #[arg(long)]
        remote: bool,
    },

    /// Propagate changes into the mirror, or from the mirror to the remote
    Push {
        #[arg(long)]
        remote: bool,
    },

    /// Align the mirror with the remote listing without transferring content
    Reconcile {
        /// Read the listing from a report file instead of the configured command
        #[arg(long)]
        listing: Option<PathBuf>,
    },

    /// Print the compiled path rules and the filter they produce
    Rules,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting mirrorsync v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Doctor => cmd_doctor(&config),
        Commands::Scan => cmd_scan(&BackupEngine::new(config)?),
        Commands::Status { remote } => cmd_status(&BackupEngine::new(config)?, remote).await,
        Commands::Push { remote } => cmd_push(&BackupEngine::new(config)?, remote).await,
        Commands::Reconcile { listing } => cmd_reconcile(&BackupEngine::new(config)?, listing.as_deref()).await,
        Commands::Rules => cmd_rules(&BackupEngine::new(config)?),
    }
}

/// Initialize logging based on verbosity level and the configured default
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(logging.color).with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn cmd_scan(engine: &BackupEngine) -> Result<()> {
    let report = engine.scan()?;

    for path in &report.changed {
        println!("{}", path.display());
    }
    for skipped in &report.skipped {
        eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    eprintln!(
        "{} candidates out of {} paths ({:.2}s)",
        report.changed.len(),
        report.visited,
        report.duration.as_secs_f64()
    );
    Ok(())
}

async fn cmd_status(engine: &BackupEngine, remote: bool) -> Result<()> {
    let summary = if remote {
        engine.status_remote().await?
    } else {
        engine.status_local().await?
    };
    print_summary(&summary);
    Ok(())
}

async fn cmd_push(engine: &BackupEngine, remote: bool) -> Result<()> {
    let summary = if remote {
        engine.push_remote().await?
    } else {
        engine.push_local().await?
    };
    print_summary(&summary);
    Ok(())
}

async fn cmd_reconcile(engine: &BackupEngine, listing: Option<&Path>) -> Result<()> {
    let source = engine.listing_source(listing);
    let report = engine.reconcile_remote(source.as_ref()).await?;

    for path in &report.touched {
        println!("touched {}", path.display());
    }
    for path in &report.deleted {
        println!("deleted {}", path.display());
    }
    eprintln!(
        "{} remote entries, {} touched, {} deleted, {} kept by tag ({:.2}s)",
        report.present,
        report.touched.len(),
        report.deleted.len(),
        report.tag_matches,
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn cmd_rules(engine: &BackupEngine) -> Result<()> {
    let ctx = engine.context();

    println!("Path rules (first match wins):");
    for rule in ctx.rules.iter() {
        let sign = if rule.include { '+' } else { '-' };
        let path = if rule.is_root() {
            "<root>".to_string()
        } else {
            rule.path.display().to_string()
        };
        println!("  {} {}", sign, path);
    }

    let filters = FilterSet::for_rules(&ctx.rules, overlap(&ctx.source_root(), &ctx.cache_root()).as_deref())?;
    println!();
    println!("Filter file:");
    for line in filters.lines() {
        println!("  {}", line);
    }
    Ok(())
}

fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);
    print_health_report(&health);
    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    if summary.changes.is_empty() {
        println!("No changes");
    } else {
        print!("{}", summary.changes);
    }
    for skipped in &summary.skipped {
        eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    eprintln!(
        "{} created, {} modified, {} deleted{} ({:.2}s)",
        summary.created(),
        summary.modified(),
        summary.deleted(),
        if summary.pushed { ", pushed" } else { "" },
        summary.duration.as_secs_f64()
    );
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 mirrorsync System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    let warnings = health.warnings();
    if !warnings.is_empty() {
        println!("⚠️  {} warning(s):", warnings.len());
        for warning in warnings {
            println!("   {}", warning.message);
        }
    }

    let errors = health.errors();
    if errors.is_empty() {
        println!("✅ All checks passed");
    } else {
        println!("❌ {} check(s) failed:", errors.len());
        for error in errors {
            println!("   {}", error.message);
        }
    }
}
