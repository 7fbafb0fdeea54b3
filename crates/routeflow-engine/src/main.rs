//! routeflow binary.
//!
//! Runs, validates or describes a route configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use routeflow_engine::config::{format_duration, parse_duration};
use routeflow_engine::definition::{read_config, RouteDefinition};
use routeflow_engine::logging::init_tracing;
use routeflow_engine::{load_file, parse_document, validate_document, AdapterRegistry, Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "routeflow")]
#[command(version, about = "Declarative message routing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled route and run until interrupted.
    ///
    /// SIGHUP reloads the configuration file; Ctrl-C or SIGTERM stops the engine.
    Run {
        /// Configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Time in-flight executions get to finish on shutdown (e.g. 5s, 500ms)
        #[arg(long, value_parser = parse_grace)]
        grace: Option<Duration>,
    },

    /// Check a configuration file and report every problem found.
    Validate {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Print the routes a configuration file defines without running them.
    DryRun {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Only show this route
        #[arg(short, long)]
        route: Option<String>,
    },
}

fn parse_grace(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

enum Signal {
    Shutdown,
    Reload,
}

#[cfg(unix)]
async fn next_signal() -> Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to install CTRL+C handler")?;
            Ok(Signal::Shutdown)
        }
        _ = terminate.recv() => Ok(Signal::Shutdown),
        _ = hangup.recv() => Ok(Signal::Reload),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Result<Signal> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    Ok(Signal::Shutdown)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, grace } => run(&config, grace).await,
        Commands::Validate { config } => {
            init_tracing(&EngineConfig::default());
            validate(&config)
        }
        Commands::DryRun { config, route } => {
            init_tracing(&EngineConfig::default());
            dry_run(&config, route.as_deref())
        }
    }
}

async fn run(path: &Path, grace: Option<Duration>) -> Result<ExitCode> {
    let loaded = load_file(path).with_context(|| format!("Failed to load {}", path.display()))?;
    init_tracing(&loaded.settings);

    let settings = loaded.settings.clone();
    let grace = grace.unwrap_or(settings.shutdown_grace);
    tracing::info!(
        config = %path.display(),
        routes = loaded.routes.len(),
        max_concurrent_routes = settings.max_concurrent_routes,
        "Starting routeflow"
    );

    let engine = Engine::new(settings.clone(), loaded.routes, AdapterRegistry::with_builtins())
        .with_env(loaded.env);
    engine.start().await?;

    loop {
        match next_signal().await? {
            Signal::Shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            Signal::Reload => {
                tracing::info!(config = %path.display(), "Reloading configuration");
                let reloaded = match load_file(path) {
                    Ok(reloaded) => reloaded,
                    Err(e) => {
                        tracing::error!(error = %e, "Reload rejected, keeping current routes");
                        continue;
                    }
                };
                if reloaded.settings != settings {
                    tracing::warn!("Changes to global settings take effect after a restart");
                }
                match engine.reload(reloaded.routes).await {
                    Ok(summary) => tracing::info!(
                        added = ?summary.added,
                        removed = ?summary.removed,
                        restarted = ?summary.restarted,
                        "Reload applied"
                    ),
                    Err(e) => tracing::error!(error = %e, "Reload rejected, keeping current routes"),
                }
            }
        }
    }

    engine.stop(grace).await?;
    for status in engine.status().await {
        tracing::info!(
            route = %status.name,
            delivered = status.delivered,
            filtered_out = status.filtered_out,
            failed = status.failed,
            dropped_triggers = status.dropped_triggers,
            "Route summary"
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn validate(path: &Path) -> Result<ExitCode> {
    let yaml = read_config(path)?;
    let lookup = |name: &str| std::env::var(name).ok();

    let mut problems: Vec<String> = validate_document(&yaml, lookup)
        .iter()
        .map(ToString::to_string)
        .collect();

    if problems.is_empty() {
        let loaded = parse_document(&yaml, lookup)?;
        let registry = AdapterRegistry::with_builtins();
        for route in loaded.routes.iter().filter(|r| r.enabled) {
            problems.extend(registry.check_route(route).iter().map(ToString::to_string));
        }
        if problems.is_empty() {
            println!("{}: OK ({} routes)", path.display(), loaded.routes.len());
            return Ok(ExitCode::SUCCESS);
        }
    }

    println!("{}: {} problem(s)", path.display(), problems.len());
    for problem in &problems {
        println!("  - {}", problem);
    }
    Ok(ExitCode::FAILURE)
}

fn dry_run(path: &Path, only: Option<&str>) -> Result<ExitCode> {
    let yaml = read_config(path)?;
    let loaded = parse_document(&yaml, |name| std::env::var(name).ok())?;

    let routes: Vec<&RouteDefinition> = loaded
        .routes
        .iter()
        .filter(|r| only.map_or(true, |name| r.name == name))
        .collect();
    if routes.is_empty() {
        if let Some(name) = only {
            eprintln!("No route named '{}'", name);
            return Ok(ExitCode::FAILURE);
        }
    }

    let s = &loaded.settings;
    println!(
        "settings: max_concurrent_routes={} default_timeout={} queue_depth={} shutdown_grace={}",
        s.max_concurrent_routes,
        format_duration(s.default_timeout),
        s.queue_depth,
        format_duration(s.shutdown_grace)
    );
    for route in routes {
        print_route(route);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_route(route: &RouteDefinition) {
    println!();
    println!(
        "route {}{}",
        route.name,
        if route.enabled { "" } else { " (disabled)" }
    );
    if let Some(description) = &route.description {
        println!("  {}", description);
    }
    println!("  from: {}", route.source);
    for (index, step) in route.processors.iter().enumerate() {
        println!("  {}. {}", index, step.summary());
    }
    for sink in &route.sinks {
        println!("  to:   {}", sink);
    }
    if let Some(retry) = &route.handlers.retry {
        println!(
            "  on error: retry max_attempts={} delay={} backoff={:?} on={:?}",
            retry.max_attempts,
            format_duration(retry.delay),
            retry.backoff,
            retry.on
        );
    }
    if let Some(notify) = &route.handlers.notify {
        println!("  on error: notify {}", notify.to);
    }
    if route.handlers.log.is_some() {
        println!("  on error: log");
    }
    println!(
        "  timeout={} weight={} queue_depth={}",
        format_duration(route.timeout),
        route.weight,
        route.queue_depth
    );
}
