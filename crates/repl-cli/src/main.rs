//! repl-link - command-line driver for a REPL server.
//!
//! Connects, waits for the session handshake, sends one request and prints
//! its outcome. Ctrl-C interrupts the running evaluation.

mod render;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use repl_link::{
    ClientEvent, ConnectTarget, EvalEventKind, Profile, ReplClient, SessionPhase, Settings,
    SourceContext,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "repl-link")]
#[command(about = "Evaluate code on a running nREPL server")]
struct Args {
    /// `host:port`, a socket path, or `auto` to read `.nrepl-port`
    #[arg(short, long, default_value = "auto")]
    address: String,

    /// Connect to a shadow-cljs build REPL (`node-repl`, `browser-repl` or a build id)
    #[arg(long)]
    shadow_build: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a form
    Eval {
        code: String,
        #[arg(long)]
        ns: Option<String>,
    },
    /// Show documentation for a symbol
    Lookup {
        symbol: String,
        #[arg(long)]
        ns: Option<String>,
    },
    /// Load a source file
    Load { file: PathBuf },
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    if let Some(path) = path {
        return Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()));
    }
    let default = dirs::config_dir().map(|dir| dir.join("repl-link").join("settings.json"));
    match default {
        Some(path) if path.exists() => Ok(Settings::load(&path)?),
        _ => Ok(Settings::default()),
    }
}

fn resolve_target(address: &str) -> Result<ConnectTarget> {
    if address == "auto" {
        let cwd = std::env::current_dir()?;
        return ConnectTarget::discover(&cwd)
            .with_context(|| format!("No running server found in {}", cwd.display()));
    }
    Ok(ConnectTarget::parse(address)?)
}

async fn wait_ready(events: &mut broadcast::Receiver<ClientEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Connection(status)) => {
                if let Some(label) = &status.label {
                    debug!("{}", label);
                }
                match status.phase {
                    SessionPhase::Ready => return Ok(()),
                    SessionPhase::Disconnected => bail!("Connection closed during handshake"),
                    _ => {}
                }
            }
            Ok(ClientEvent::Notice(message)) => bail!(message),
            Ok(ClientEvent::Eval(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("Client event channel closed"),
        }
    }
}

async fn wait_outcome(
    events: &mut broadcast::Receiver<ClientEvent>,
    id: u64,
) -> Result<EvalEventKind> {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Eval(event)) if event.id == id => {
                if event.is_terminal() {
                    return Ok(event.kind);
                }
                if let EvalEventKind::Progress { phase } = &event.kind {
                    debug!("{} eval {}", phase, id);
                }
            }
            Ok(ClientEvent::Notice(message)) => bail!(message),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("Client event channel closed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(args.settings.as_deref())?;

    // Set up logging
    let log_level = if args.debug || settings.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let target = resolve_target(&args.address)?;
    let profile = match args.shadow_build {
        Some(build) => Profile::ShadowCljs { build },
        None => Profile::Clojure,
    };

    let client = ReplClient::new(settings);
    let mut events = client.subscribe();

    client.connect(target.clone(), profile).await?;
    tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_ready(&mut events))
        .await
        .context("Timed out waiting for the session handshake")??;
    info!("Connected to {}", target);

    let id = match &args.command {
        Command::Eval { code, ns } => {
            let context = SourceContext {
                ns: ns.clone(),
                ..SourceContext::default()
            };
            client.send_eval(code, context).await?
        }
        Command::Lookup { symbol, ns } => client.send_lookup(symbol, ns.as_deref()).await?,
        Command::Load { file } => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            client.send_load_file(&content, Some(file)).await?
        }
    };

    let outcome = tokio::select! {
        outcome = wait_outcome(&mut events, id) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupting eval {}", id);
            client.interrupt(id).await?;
            wait_outcome(&mut events, id).await
        }
    };
    client.shutdown().await;

    match render::render_outcome(&outcome?) {
        Ok(text) => {
            println!("{}", text);
            Ok(())
        }
        Err(message) => bail!(message),
    }
}
