use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::QuotaConfig;
use quotagate::ratelimit::{
    Clock, CounterStore, MockClock, RequestContext, SystemClock, TOO_MANY_REQUESTS,
};

#[derive(Parser, Debug)]
#[command(name = "quotagate", version, about = "Multi-scope rate limiting engine")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a configuration file and register every declared policy
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Replay a JSON-lines request trace through the engine
    Simulate {
        #[arg(short, long)]
        config: PathBuf,
        /// One JSON object per line: {"route": ..., "user_id": ..., "at_ms": ...}
        #[arg(short, long)]
        trace: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// One request in a simulation trace.
#[derive(Debug, Deserialize)]
struct TraceLine {
    route: String,
    #[serde(flatten)]
    ctx: RequestContext,
    /// Wall-clock milliseconds since the Unix epoch; defaults to the
    /// previous line's instant
    #[serde(default)]
    at_ms: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Simulate { config, trace } => simulate(&config, &trace).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = QuotaConfig::from_file(path)?;
    let store: Arc<dyn CounterStore> = Arc::new(config.memory_store());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let limiter = config
        .build_limiter(store.clone(), clock.clone())
        .with_context(|| format!("invalid rate limit configuration in {}", path.display()))?;
    let sweeper = config.sweeper(store, clock)?;

    let summary = json!({
        "config": path.display().to_string(),
        "routes": limiter.resolver().routes().len(),
        "presets": config.preset_registry()?.names().collect::<Vec<_>>(),
        "fail_mode": limiter.options().fail_mode,
        "sweep_interval_secs": sweeper.map(|s| s.interval().as_secs()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Configuration is valid");
    Ok(())
}

async fn simulate(config_path: &Path, trace_path: &Path) -> anyhow::Result<()> {
    let config = QuotaConfig::from_file(config_path)?;
    let clock = Arc::new(MockClock::from_millis(0));
    let store: Arc<dyn CounterStore> = Arc::new(config.memory_store());
    let limiter = config.build_limiter(store, clock.clone())?;

    let trace = tokio::fs::read_to_string(trace_path)
        .await
        .with_context(|| format!("failed to read trace {}", trace_path.display()))?;

    for (lineno, line) in trace.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let request: TraceLine = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: malformed trace line", trace_path.display(), lineno + 1))?;

        if let Some(at_ms) = request.at_ms {
            match chrono::DateTime::from_timestamp_millis(at_ms) {
                Some(at) => clock.set(at),
                None => warn!(line = lineno + 1, at_ms, "Ignoring out-of-range timestamp"),
            }
        }

        let now = clock.now();
        let result = limiter.admit(&request.route, &request.ctx).await?;
        let headers: serde_json::Map<String, serde_json::Value> = result
            .headers(now)
            .into_iter()
            .map(|(name, value)| (name, value.into()))
            .collect();

        let outcome = match result.denial() {
            Some(denial) => json!({
                "route": request.route,
                "allowed": false,
                "status": TOO_MANY_REQUESTS,
                "headers": headers,
                "body": denial.to_body(),
            }),
            None => json!({
                "route": request.route,
                "allowed": true,
                "headers": headers,
            }),
        };
        println!("{}", serde_json::to_string(&outcome)?);
    }

    let stats = limiter.stats();
    info!(
        admitted = stats.admitted,
        denied = stats.denied,
        store_errors = stats.store_errors,
        "Simulation finished"
    );
    Ok(())
}
