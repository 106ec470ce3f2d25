use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pushsync::health::CheckResult;
use pushsync::sync::{SyncReport, SyncSummary};
use pushsync::{
    Config, HealthCheck, Registry, ScriptResult, TriggerDispatcher, TriggerResponse,
    WebhookHandler, WebhookResponse,
};

#[derive(Parser)]
#[command(name = "pushsync")]
#[command(about = "Keep deployment working copies in sync with pushed branches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repository registry (INI), overrides `repositories_file`
    #[arg(short, long)]
    repositories: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every registered repository, or only the named ones
    Update {
        /// Repository names
        names: Vec<String>,
    },

    /// Dispatch a push of REF to NAME and wait for the sync
    Trigger {
        name: String,

        /// Full ref name, e.g. refs/heads/main
        #[arg(value_name = "REF")]
        git_ref: String,
    },

    /// Replay a stored webhook delivery
    Deliver {
        /// Event type (value of the X-GitHub-Event header)
        #[arg(short, long, default_value = "push")]
        event: String,

        /// Signature header value (sha1=... or sha256=...)
        #[arg(short, long)]
        signature: Option<String>,

        /// Payload file, or - for stdin
        payload: PathBuf,
    },

    /// List registered repositories with defaults applied
    List,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config)?;
    debug!("Starting pushsync v{}", env!("CARGO_PKG_VERSION"));

    let registry = Registry::load(&config, cli.repositories.as_deref())
        .context("Failed to load repository registry")?;

    match cli.command {
        Commands::Update { names } => cmd_update(names, &config, registry).await,
        Commands::Trigger { name, git_ref } => cmd_trigger(&name, &git_ref, &config, registry).await,
        Commands::Deliver {
            event,
            signature,
            payload,
        } => cmd_deliver(&event, signature.as_deref(), &payload, &config, registry).await,
        Commands::List => cmd_list(&registry),
        Commands::Doctor => cmd_doctor(&config, &registry),
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let fallback = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .with_context(|| format!("Invalid log level '{}'", fallback))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

async fn cmd_update(names: Vec<String>, config: &Config, registry: Registry) -> Result<()> {
    let dispatcher = TriggerDispatcher::from_config(config, registry);

    let summary = if names.is_empty() {
        dispatcher.sync_all().await
    } else {
        match dispatcher.sync_named(&names).await {
            Ok(summary) => summary,
            Err(unknown) => bail!("Unknown repositories: {}", unknown.join(", ")),
        }
    };

    print_summary(&summary);

    if summary.failed_operations > 0 {
        bail!("{} of {} repositories failed to sync", summary.failed_operations, summary.total_repositories);
    }
    Ok(())
}

async fn cmd_trigger(name: &str, git_ref: &str, config: &Config, registry: Registry) -> Result<()> {
    let dispatcher = TriggerDispatcher::from_config(config, registry);

    match dispatcher.on_push_event(name, git_ref) {
        TriggerResponse::Rejected(reason) => {
            println!("Ignored: {}", reason);
            Ok(())
        }
        TriggerResponse::Accepted(ticket) => {
            let report = ticket.wait().await.context("Sync task did not complete")?;
            print_report(&report);
            if !report.is_success() {
                bail!("Sync of {} failed", name);
            }
            Ok(())
        }
    }
}

async fn cmd_deliver(
    event: &str,
    signature: Option<&str>,
    payload: &std::path::Path,
    config: &Config,
    registry: Registry,
) -> Result<()> {
    let body = if payload.as_os_str() == "-" {
        let mut body = Vec::new();
        std::io::stdin()
            .read_to_end(&mut body)
            .context("Failed to read payload from stdin")?;
        body
    } else {
        std::fs::read(payload)
            .with_context(|| format!("Failed to read payload: {}", payload.display()))?
    };

    let dispatcher = TriggerDispatcher::from_config(config, registry);
    let handler = WebhookHandler::from_config(config, dispatcher);

    let response = handler.handle(event, signature, &body);
    println!("{} {}", response.status_code(), response);
    info!("Delivery answered with {}", response.status_code());

    match response {
        WebhookResponse::Accepted(ticket) => {
            let report = ticket.wait().await.context("Sync task did not complete")?;
            print_report(&report);
            if !report.is_success() {
                bail!("Sync of {} failed", report.repository);
            }
            Ok(())
        }
        WebhookResponse::Unauthorized(e) => bail!("Delivery rejected: {}", e),
        WebhookResponse::Malformed(e) => bail!("Delivery rejected: {}", e),
        _ => Ok(()),
    }
}

fn cmd_list(registry: &Registry) -> Result<()> {
    println!("Repositories ({}):", registry.len());

    for repo in registry.iter() {
        println!("📁 {}", repo.name);
        println!("   🔗 {} ({})", repo.remote_url, repo.branch);
        println!("   📂 {}", repo.local_path.display());
        if let Some(key) = &repo.auth_key {
            println!("   🔑 {}", key);
        }
        if let Some(script) = &repo.script {
            println!("   📜 {}", script);
        }
    }

    Ok(())
}

fn cmd_doctor(config: &Config, registry: &Registry) -> Result<()> {
    let health = HealthCheck::run(config, registry);
    print_health_report(&health);

    if !health.all_passed() {
        bail!("{} checks failed", health.errors().len());
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    let icon = if report.is_success() { "✅" } else { "❌" };
    println!(
        "{} {}: {} ({:.2}s)",
        icon,
        report.repository,
        report.outcome,
        report.duration.as_secs_f64()
    );

    match &report.script {
        ScriptResult::NotConfigured => {}
        ScriptResult::NotFound { script } => println!("   ⚠️  script {} not found", script),
        ScriptResult::Success { .. } => println!("   📜 script succeeded"),
        ScriptResult::Failure { status, .. } => match status {
            Some(code) => println!("   ⚠️  script exited with {}, built-in sync used", code),
            None => println!("   ⚠️  script did not finish, built-in sync used"),
        },
    }
}

fn print_summary(summary: &SyncSummary) {
    for report in &summary.reports {
        print_report(report);
    }

    println!();
    println!(
        "Synced {} repositories in {:.2}s: {} successful, {} failed",
        summary.total_repositories,
        summary.duration.as_secs_f64(),
        summary.successful_operations,
        summary.failed_operations
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

    println!("🔍 pushsync System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(&name, result);
    }

    println!();
    let errors = health.errors().len();
    let warnings = health.warnings().len();
    if errors == 0 {
        println!("✅ All checks passed ({} warnings)", warnings);
    } else {
        println!("❌ {} errors, {} warnings", errors, warnings);
    }
}
