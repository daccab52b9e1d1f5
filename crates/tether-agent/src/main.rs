//! Tether Agent
//!
//! Command-line front end for the modem orchestration engine.
//!
//! - Opens a modem AT port (or a simulated modem with `--simulate`)
//! - Identifies the device and picks its vendor plugin
//! - Runs one operation and prints the result as JSON
//! - `watch` streams state changes as JSON lines until interrupted

mod device;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tether_core::config::TetherConfig;
use tether_core::error::OpError;
use tether_core::op::{AuthMethod, ConnectParams, IpFamily, Operation, Value};
use tether_core::session::SessionHandle;
use tether_plugins::PluginRegistry;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::device::{SimProfile, Source};

/// Modem control agent.
#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "Drive a cellular modem through its AT port")]
struct Cli {
    /// AT port character device.
    #[arg(long, conflicts_with = "simulate", required_unless_present = "simulate")]
    device: Option<PathBuf>,

    /// Run against a simulated modem.
    #[arg(long, value_enum)]
    simulate: Option<SimProfile>,

    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force a plugin instead of selecting one from the device identity.
    #[arg(long)]
    plugin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identification, signal and allowed modes.
    Info,
    /// Bring up a data bearer.
    Connect {
        #[arg(long)]
        apn: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, value_enum, default_value_t = Auth::None)]
        auth: Auth,
        #[arg(long, value_enum, default_value_t = Family::Ipv4)]
        ip: Family,
    },
    /// Tear down the data bearer.
    Disconnect,
    /// Control the location engine.
    Location {
        #[command(subcommand)]
        action: LocationAction,
    },
    /// Stream state changes until interrupted.
    Watch,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum LocationAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Auth {
    None,
    Pap,
    Chap,
}

impl From<Auth> for AuthMethod {
    fn from(a: Auth) -> Self {
        match a {
            Auth::None => AuthMethod::None,
            Auth::Pap => AuthMethod::Pap,
            Auth::Chap => AuthMethod::Chap,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Family {
    Ipv4,
    Ipv6,
    Ipv4v6,
}

impl From<Family> for IpFamily {
    fn from(f: Family) -> Self {
        match f {
            Family::Ipv4 => IpFamily::Ipv4,
            Family::Ipv6 => IpFamily::Ipv6,
            Family::Ipv4v6 => IpFamily::Ipv4v6,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(load_config(cli.config.as_deref())?);
    let registry = PluginRegistry::standard(config.clone());

    let source = match (cli.device, cli.simulate) {
        (Some(path), _) => Source::Serial(path),
        (None, Some(profile)) => Source::Simulated(profile),
        (None, None) => bail!("either --device or --simulate is required"),
    };
    let device = device::open(source, &config, &registry, cli.plugin.as_deref()).await?;
    tracing::info!(
        vendor = %device.identity.vendor,
        model = %device.identity.model,
        plugin = device.plugin,
        "tether-agent ready"
    );

    let result = match cli.command {
        Command::Info => info(&device.session).await,
        Command::Watch => watch(&device.session).await,
        Command::Connect {
            apn,
            user,
            password,
            auth,
            ip,
        } => {
            let params = ConnectParams {
                apn,
                user,
                password,
                auth: auth.into(),
                ip_family: ip.into(),
            };
            single(&device.session, Operation::Connect(params)).await
        }
        Command::Disconnect => single(&device.session, Operation::Disconnect).await,
        Command::Location { action } => {
            let op = match action {
                LocationAction::Start => Operation::LocationStart,
                LocationAction::Stop => Operation::LocationStop,
            };
            single(&device.session, op).await
        }
    };

    device.session.shutdown();
    device.session.closed().await;
    tracing::info!("tether-agent stopped");
    result
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TetherConfig> {
    let Some(path) = path else {
        return Ok(TetherConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    TetherConfig::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
}

/// Run one operation; Ctrl-C cancels it.
async fn execute(session: &SessionHandle, op: Operation) -> Result<Value, OpError> {
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, cancelling");
                cancel.cancel();
            }
        }
    });
    let result = session.execute(op, cancel).await;
    interrupt.abort();
    result
}

fn report(result: &Result<Value, OpError>) -> serde_json::Value {
    match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({ "error": { "kind": e.kind(), "message": e.to_string() } }),
    }
}

async fn single(session: &SessionHandle, op: Operation) -> anyhow::Result<()> {
    let name = op.name();
    let result = execute(session, op).await;
    println!("{}", serde_json::to_string_pretty(&report(&result))?);
    result.map(|_| ()).with_context(|| format!("{name} failed"))
}

async fn info(session: &SessionHandle) -> anyhow::Result<()> {
    let mut out = serde_json::Map::new();
    for op in [
        Operation::LoadManufacturer,
        Operation::LoadModel,
        Operation::LoadRevision,
        Operation::LoadSignal,
        Operation::LoadCurrentModes,
    ] {
        let name = op.name();
        out.insert(name.into(), report(&execute(session, op).await));
    }
    out.insert("state".into(), serde_json::to_value(session.snapshot().await?)?);
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn watch(session: &SessionHandle) -> anyhow::Result<()> {
    let mut changes = session.subscribe();
    println!("{}", serde_json::to_string(&session.snapshot().await?)?);
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => println!("{}", serde_json::to_string(&change)?),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "state changes dropped"),
                Err(RecvError::Closed) => break,
            },
            // Pending changes, including the removal, are printed first.
            _ = session.closed() => {
                tracing::info!("session closed");
                break;
            }
        }
    }
    Ok(())
}
