//! View metrics server
//!
//! Resolves reporting views through the cache, computes their KPIs and keeps
//! the cache warm with background refreshes.

use std::collections::HashSet;
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use viewmetrics_server::MetricsService;
use viewmetrics_shared::{LoggingConfig, MetricsConfig, SourceConfig};

const USAGE: &str = "\
Usage:
  viewmetrics-server --init [config.json]
  viewmetrics-server <config.json> [report] [--filter a,b] [--json]
  viewmetrics-server <config.json> refresh
  viewmetrics-server <config.json> serve";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    // Check for --init flag
    if args.iter().any(|a| a == "--init") {
        return init_config(&args);
    }

    let Some(config_path) = args.get(1).filter(|a| !a.starts_with("--")) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = match MetricsConfig::load_or_default(Some(config_path.as_str())) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            eprintln!(
                "Run `{} --init` to create a default configuration.",
                args[0]
            );
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);
    info!(config = %config_path, "Configuration loaded successfully");

    if config.views.is_empty() {
        error!("No views configured");
        eprintln!("Error: No views configured in '{}'.", config_path);
        std::process::exit(1);
    }

    let command = args
        .get(2)
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("report");
    let options = &args[2..];

    let service = MetricsService::from_config(config).await?;
    info!(cache = service.cache_backend(), "Metrics service initialized");

    match command {
        "report" => run_report(service, options).await,
        "refresh" => run_refresh(service).await,
        "serve" => run_serve(service).await,
        other => {
            eprintln!("Unknown command '{}'.\n\n{}", other, USAGE);
            service.shutdown().await;
            std::process::exit(2);
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to set global logging subscriber: {}", e);
    }
}

fn parse_filter(options: &[String]) -> HashSet<String> {
    let mut filter = HashSet::new();
    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        let values = if option == "--filter" {
            iter.next().map(String::as_str)
        } else {
            option.strip_prefix("--filter=")
        };
        if let Some(values) = values {
            filter.extend(
                values
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            );
        }
    }
    filter
}

async fn run_report(service: MetricsService, options: &[String]) -> anyhow::Result<()> {
    let filter = parse_filter(options);
    let report = service.report(&filter).await;
    service.abort().await;
    let mut report = report?;
    // one-shot mode exits before any background refresh could run
    if let Some(job_id) = report.refresh_job.take() {
        info!(job_id, "Background refresh dropped in one-shot report");
    }

    if options.iter().any(|o| o == "--json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

async fn run_refresh(service: MetricsService) -> anyhow::Result<()> {
    let result = service.refresh_now().await;
    service.shutdown().await;
    match result {
        Ok(written) => {
            println!("Refreshed {} views", written);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Refresh failed");
            Err(e.into())
        }
    }
}

async fn run_serve(mut service: MetricsService) -> anyhow::Result<()> {
    if !service.start_scheduler() {
        eprintln!("Error: refresh.interval_secs must be set to serve.");
        service.shutdown().await;
        std::process::exit(1);
    }

    let mut failures = service.refresh_queue().subscribe_failures();
    info!("Serving scheduled refreshes, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            failure = failures.recv() => {
                if let Ok(failure) = failure {
                    error!(
                        job_id = failure.job.id,
                        attempts = failure.attempts,
                        error = %failure.last_error,
                        "Scheduled refresh failed"
                    );
                }
            }
        }
    }

    info!("Shutting down");
    service.shutdown().await;
    Ok(())
}

fn init_config(args: &[String]) -> anyhow::Result<()> {
    // Find the config path, skipping the --init flag
    let config_path = args
        .iter()
        .skip(1)
        .find(|a| *a != "--init")
        .map(String::as_str)
        .unwrap_or("config.json");

    if std::path::Path::new(config_path).exists() {
        eprintln!("Configuration file '{}' already exists.", config_path);
        eprintln!("Remove it first if you want to create a new one.");
        std::process::exit(1);
    }

    let config = MetricsConfig {
        source: SourceConfig::Directory {
            path: "views".to_string(),
        },
        views: vec!["view1".to_string(), "view2".to_string()],
        ..MetricsConfig::default()
    };

    match config.save(config_path) {
        Ok(()) => {
            println!("Configuration file '{}' created successfully!", config_path);
            println!();
            println!("Default configuration includes:");
            println!("  - Views read from ./views/<view_id>.json");
            println!("  - Redis cache at {}, falling back to a file cache", config.cache.redis_url);
            println!("  - {} attempts per background refresh", config.refresh.max_attempts);
            println!();
            println!("To print a report:");
            println!("  {} {} report", args[0], config_path);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to create configuration file: {}", e);
            std::process::exit(1);
        }
    }
}
