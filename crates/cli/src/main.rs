use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mirra_core::{namespace_key_func, ChangeEvent, EventKind, Resource};
use mirra_reflector::{EventHandler, Handlers, ListerWatcher, MemoryBackend, Reflector, ReflectorConfig};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirra reflector CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror a JSON snapshot, replay a JSON-lines event stream, print transitions
    Replay {
        /// JSON array of objects served by the list call
        #[arg(long = "snapshot")]
        snapshot: Option<String>,
        /// JSON-lines file of watch events, e.g. {"type":"added","data":{"namespace":"a","name":"x"}}
        #[arg(long = "events")]
        events: Option<String>,
        /// Reflector name used in logs and metrics
        #[arg(long = "name", default_value = "mirractl")]
        name: String,
        /// Full resync period (seconds)
        #[arg(long = "resync-secs", env = "MIRRA_RESYNC_SECS")]
        resync_secs: Option<u64>,
        /// How long to let the watch loop drain after the last event (ms)
        #[arg(long = "settle-ms", default_value_t = 200)]
        settle_ms: u64,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Transition<'a> {
    Add { object: &'a Resource },
    Update { old: &'a Resource, new: &'a Resource },
    Delete { object: &'a Resource },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

fn label(o: &Resource) -> String {
    if o.namespace.is_empty() { o.name.clone() } else { format!("{}/{}", o.namespace, o.name) }
}

fn emit(output: Output, t: Transition<'_>) {
    match output {
        Output::Human => match t {
            Transition::Add { object } => println!("+ {}", label(object)),
            Transition::Update { new, .. } => println!("~ {}", label(new)),
            Transition::Delete { object } => println!("- {}", label(object)),
        },
        Output::Json => match serde_json::to_string(&t) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "failed to encode transition"),
        },
    }
}

fn printer(output: Output) -> Handlers<Resource> {
    Handlers::<Resource>::new()
        .add_fn(move |o| emit(output, Transition::Add { object: o }))
        .update_fn(move |old, new| emit(output, Transition::Update { old, new }))
        .delete_fn(move |o| emit(output, Transition::Delete { object: o }))
}

fn parse_snapshot(text: &str) -> Result<Vec<Resource>> {
    serde_json::from_str(text).context("parsing snapshot as a JSON array of objects")
}

fn parse_events(text: &str) -> Result<Vec<ChangeEvent<Resource>>> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| serde_json::from_str(l).with_context(|| format!("parsing event on line {}", i + 1)))
        .collect()
}

/// Feed one recorded event into the backend, keeping its snapshot in step.
fn feed(backend: &MemoryBackend<Resource>, event: ChangeEvent<Resource>) -> Result<()> {
    match (event.kind, event.data) {
        (EventKind::Added | EventKind::Updated, Some(o)) => backend.apply(o)?,
        (EventKind::Synced, Some(o)) => backend.sync(o)?,
        (EventKind::Deleted, Some(o)) => {
            if !backend.remove(o.clone())? {
                backend.emit(ChangeEvent::deleted(o));
            }
        }
        (EventKind::Error, _) => backend.emit(ChangeEvent::error()),
        (kind, None) => warn!(kind = %kind, "event without data skipped"),
    }
    Ok(())
}

async fn replay(
    output: Output,
    name: String,
    snapshot: Option<String>,
    events: Option<String>,
    resync_secs: Option<u64>,
    settle: Duration,
) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new(namespace_key_func::<Resource>()));
    if let Some(path) = snapshot.as_deref() {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading snapshot {}", path))?;
        backend.seed(parse_snapshot(&text)?)?;
    }
    let recorded = match events.as_deref() {
        Some(path) => parse_events(&std::fs::read_to_string(path).with_context(|| format!("reading events {}", path))?)?,
        None => Vec::new(),
    };

    let mut cfg = ReflectorConfig::from_env();
    if let Some(secs) = resync_secs.filter(|s| *s > 0) {
        cfg = cfg.with_resync_period(Duration::from_secs(secs));
    }
    let lw: Arc<dyn ListerWatcher<Resource>> = backend.clone();
    let handler: Arc<dyn EventHandler<Resource>> = Arc::new(printer(output));
    let reflector = Reflector::with_config(name, namespace_key_func(), lw, cfg.clone(), Some(handler));
    let task = reflector.start().await?;

    if !recorded.is_empty() {
        let deadline = Instant::now() + cfg.watch_check_period * 3;
        while backend.subscriber_count() == 0 {
            if Instant::now() >= deadline {
                reflector.stop();
                bail!("watch did not subscribe within {:?}", cfg.watch_check_period * 3);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!(events = recorded.len(), "replaying recorded events");
        for ev in recorded {
            feed(&backend, ev)?;
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(settle) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    let store = reflector.store();
    reflector.stop();
    task.await.context("joining reflector task")?;

    let mut items = store.list();
    items.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.name.cmp(&b.name)));
    match output {
        Output::Human => {
            println!("NAMESPACE   NAME");
            for it in &items {
                let ns = if it.namespace.is_empty() { "-" } else { it.namespace.as_str() };
                println!("{:<11} {}", ns, it.name);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { snapshot, events, name, resync_secs, settle_ms } => {
            info!(name = %name, snapshot = ?snapshot, events = ?events, "replay invoked");
            replay(cli.output, name, snapshot, events, resync_secs, Duration::from_millis(settle_ms)).await?;
        }
    }
    Ok(())
}
