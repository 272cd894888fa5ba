//! Autodeploy CLI
//!
//! The `autodeploy` command runs git webhook payloads through the deploy
//! pipeline.
//!
//! ## Commands
//!
//! - `normalize`: Validate a webhook payload and print the typed event
//! - `plan`: Show the target and runner an event would get, without building
//! - `serve`: Process newline-delimited webhook deliveries from stdin
//! - `runners`: Inspect and reconcile the persisted runner pool

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use autodeploy_core::fakes::{FakeProvisioner, ScriptedExecutor};
use autodeploy_core::{
    Autodeploy, AutodeployConfig, AutodeployError, DeployOutcome, DeployPlan, EventNormalizer,
    GitEvent, IdleReaper, NormalizationError, METRICS,
};
use clap::{Parser, Subcommand, ValueEnum};
use runner_state::{RunnerRecord, RunnerStore, SurrealRunnerStore};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "autodeploy")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy git events to stages on pooled build runners", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a webhook payload and print the normalized event
    Normalize {
        /// Event type header (`push`, `pull_request`); defaults to the payload's `type`
        #[arg(short, long)]
        event: Option<String>,

        /// Payload file, or `-` for stdin
        #[arg(default_value = "-")]
        payload: PathBuf,
    },

    /// Resolve target and runner for a payload without provisioning or building
    Plan {
        /// Configuration file (TOML)
        #[arg(short, long, env = "AUTODEPLOY_CONFIG")]
        config: Option<PathBuf>,

        /// Event type header
        #[arg(short, long)]
        event: Option<String>,

        /// Payload file, or `-` for stdin
        #[arg(default_value = "-")]
        payload: PathBuf,
    },

    /// Process deliveries from stdin, one JSON document per line
    ///
    /// A line is either a raw payload or `{"event": "<type>", "payload": {...}}`.
    /// Provisioning and builds are simulated; the runner pool is persisted.
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long, env = "AUTODEPLOY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Inspect the persisted runner pool
    Runners {
        #[command(subcommand)]
        action: RunnersAction,
    },
}

#[derive(Subcommand)]
enum RunnersAction {
    /// List runner records
    List {
        /// Configuration file (TOML)
        #[arg(short, long, env = "AUTODEPLOY_CONFIG")]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Reconcile records left behind by an unclean shutdown
    Recover {
        /// Configuration file (TOML)
        #[arg(short, long, env = "AUTODEPLOY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    autodeploy_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Normalize { event, payload } => cmd_normalize(&payload, event.as_deref()).await,
        Commands::Plan {
            config,
            event,
            payload,
        } => cmd_plan(config.as_deref(), &payload, event.as_deref()).await,
        Commands::Serve { config } => cmd_serve(config.as_deref()).await,
        Commands::Runners { action } => match action {
            RunnersAction::List { config, format } => {
                cmd_runners_list(config.as_deref(), format).await
            }
            RunnersAction::Recover { config } => cmd_runners_recover(config.as_deref()).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_normalize(payload: &Path, hint: Option<&str>) -> Result<()> {
    let bytes = read_payload(payload).await?;
    let event = normalize_payload(&bytes, hint)?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

async fn cmd_plan(config: Option<&Path>, payload: &Path, hint: Option<&str>) -> Result<()> {
    let config = load_config(config)?;
    let bytes = read_payload(payload).await?;
    match plan_payload(&config, &bytes, hint).await? {
        Some(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
        None => println!("No target: event would be skipped"),
    }
    Ok(())
}

async fn cmd_serve(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let store = open_store(&config).await?;
    let autodeploy = Arc::new(dry_run(&config, Some(store))?);

    let recovered = autodeploy.pool().recover().await?;
    info!(
        restored = recovered.restored,
        discarded = recovered.discarded,
        "runner pool recovered"
    );

    let reaper = IdleReaper::new(autodeploy.pool().clone(), config.reap_interval()).spawn();
    let stdin = BufReader::new(tokio::io::stdin());
    let served = serve_deliveries(autodeploy.clone(), stdin, |report| println!("{report}")).await;
    reaper.stop().await;
    let deliveries = served?;

    let stats = autodeploy.pool().stats();
    info!(
        deliveries,
        provisioned = stats.provisioned,
        reused = stats.reused,
        retired = stats.retired,
        "input closed"
    );
    METRICS.flush();
    Ok(())
}

async fn cmd_runners_list(config: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = load_config(config)?;
    let store = open_store(&config).await?;
    let mut records = store.list().await?;
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => print!("{}", render_runners(&records)),
    }
    Ok(())
}

async fn cmd_runners_recover(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let store = open_store(&config).await?;
    let autodeploy = dry_run(&config, Some(store))?;
    let report = autodeploy.pool().recover().await?;
    println!(
        "Restored {} runner(s), discarded {}",
        report.restored, report.discarded
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<AutodeployConfig> {
    match path {
        Some(path) => AutodeployConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => {
            let mut config = AutodeployConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

async fn open_store(config: &AutodeployConfig) -> Result<Arc<SurrealRunnerStore>> {
    let store = SurrealRunnerStore::connect(&config.store.to_store_config())
        .await
        .with_context(|| format!("Failed to open runner store {}", config.store.url))?;
    Ok(Arc::new(store))
}

/// Pipeline with simulated provisioning and builds.
fn dry_run(
    config: &AutodeployConfig,
    store: Option<Arc<SurrealRunnerStore>>,
) -> Result<Autodeploy> {
    let mut builder = Autodeploy::builder()
        .config(config)?
        .provisioner(Arc::new(FakeProvisioner::new().with_prefix("dry-run")))
        .executor(Arc::new(ScriptedExecutor::succeeding()));
    if let Some(store) = store {
        builder = builder.store(store);
    }
    Ok(builder.build()?)
}

async fn read_payload(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("Failed to read payload from stdin")?;
        return Ok(buf);
    }
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read payload {}", path.display()))
}

fn normalize_payload(bytes: &[u8], hint: Option<&str>) -> Result<GitEvent> {
    Ok(EventNormalizer::normalize_bytes(bytes, hint)?)
}

async fn plan_payload(
    config: &AutodeployConfig,
    bytes: &[u8],
    hint: Option<&str>,
) -> Result<Option<DeployPlan>> {
    let event = normalize_payload(bytes, hint)?;
    let autodeploy = dry_run(config, None)?;
    Ok(autodeploy.plan(&event).await?)
}

/// Split a delivery line into payload and event-type hint.
fn parse_delivery(line: &[u8]) -> std::result::Result<(Value, Option<String>), AutodeployError> {
    let malformed = |reason: String| {
        AutodeployError::from(NormalizationError::MalformedPayload {
            field: "$".to_string(),
            reason,
        })
    };
    let text = std::str::from_utf8(line).map_err(|e| malformed(format!("invalid UTF-8: {e}")))?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let Some(envelope) = value.as_object().filter(|o| o.contains_key("payload")) else {
        return Ok((value, None));
    };
    let hint = envelope
        .get("event")
        .and_then(Value::as_str)
        .map(str::to_string);
    let payload = envelope.get("payload").cloned().unwrap_or(Value::Null);
    Ok((payload, hint))
}

fn delivery_report(line: usize, result: std::result::Result<DeployOutcome, AutodeployError>) -> Value {
    match result {
        Ok(outcome) => json!({ "line": line, "result": outcome }),
        Err(e) => json!({
            "line": line,
            "error": e.to_string(),
            "retryable": e.is_retryable(),
        }),
    }
}

/// Run every delivery on its own task and emit one report per delivery as it
/// finishes. Returns the number of deliveries read.
///
/// A line that cannot be decoded gets its own error report. A read error
/// stops intake, but deliveries already running still report before it is
/// returned.
async fn serve_deliveries<R>(
    autodeploy: Arc<Autodeploy>,
    input: R,
    mut emit: impl FnMut(Value),
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.split(b'\n');
    let mut running = JoinSet::new();
    let mut line_no = 0usize;
    let mut open = true;
    let mut read_error = None;

    while open || !running.is_empty() {
        tokio::select! {
            next = lines.next_segment(), if open => {
                match next {
                    Ok(Some(raw)) if raw.iter().all(u8::is_ascii_whitespace) => line_no += 1,
                    Ok(Some(raw)) => {
                        line_no += 1;
                        let line = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
                        match parse_delivery(line) {
                            Ok((payload, hint)) => {
                                let delivery = autodeploy.spawn_delivery(payload, hint);
                                let n = line_no;
                                running.spawn(async move { (n, delivery.await) });
                            }
                            Err(e) => emit(delivery_report(line_no, Err(e))),
                        }
                    }
                    Ok(None) => open = false,
                    Err(e) => {
                        warn!(line = line_no + 1, error = %e, "failed to read delivery, draining in-flight work");
                        read_error = Some(e);
                        open = false;
                    }
                }
            }
            Some(done) = running.join_next(), if !running.is_empty() => {
                match done {
                    Ok((n, Ok(result))) => emit(delivery_report(n, result)),
                    Ok((n, Err(join))) => {
                        warn!(line = n, error = %join, "delivery task failed");
                        emit(json!({ "line": n, "error": join.to_string(), "retryable": false }));
                    }
                    Err(join) => warn!(error = %join, "delivery task failed"),
                }
            }
        }
    }

    if let Some(e) = read_error {
        return Err(e).context("Failed to read delivery");
    }
    Ok(line_no)
}

fn render_runners(records: &[RunnerRecord]) -> String {
    if records.is_empty() {
        return "No runners\n".to_string();
    }
    let mut out = format!(
        "{:<16} {:<12} {:<16} {:<34} {}\n",
        "KEY", "STATE", "MACHINE", "SPEC", "LAST USED"
    );
    for r in records {
        let machine = r
            .machine_id
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<16} {:<12} {:<16} {:<34} {}\n",
            r.key.short(),
            r.state.as_str(),
            machine,
            r.descriptor,
            r.last_used_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}
