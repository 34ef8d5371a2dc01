mod cli;
mod save;

use anyhow::{Context, Result};
use courier_core::{
    ConnectionState, DiskSource, FileSource, Session, TransferStatus, ViewState,
};
use courier_protocol::{CourierConfig, MAX_QR_SIGNAL_LEN};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
fn load_config(path: &Path) -> Result<CourierConfig> {
    if !path.exists() {
        return Ok(CourierConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: CourierConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = cli::parse_args()?;

    let mut config = load_config(&args.config_path)?;
    if !args.stun_urls.is_empty() {
        config.ice.stun_urls = args.stun_urls.clone();
    }
    if args.no_stun {
        config.ice.stun_urls.clear();
    }
    if let Err(issues) = config.validate() {
        let mut fatal = false;
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
                fatal = true;
            } else {
                warn!("{issue}");
            }
        }
        anyhow::ensure!(!fatal, "Invalid configuration");
    }

    let downloads_dir = args
        .downloads_dir
        .clone()
        .or_else(|| {
            config
                .receive
                .downloads_dir
                .as_ref()
                .map(PathBuf::from)
        })
        .unwrap_or_else(save::default_downloads_dir);

    let session = Session::new(config.ice.clone());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    match &args.mode {
        cli::Mode::Send(files) => {
            let sources = open_sources(files)?;
            run_sender(&session, sources, &mut stdin, &downloads_dir).await
        }
        cli::Mode::Receive => run_receiver(&session, &mut stdin, &downloads_dir).await,
    }
}

fn open_sources(files: &[PathBuf]) -> Result<Vec<Arc<dyn FileSource>>> {
    files
        .iter()
        .map(|path| {
            let source = DiskSource::open(path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            Ok(Arc::new(source) as Arc<dyn FileSource>)
        })
        .collect()
}

async fn run_sender(
    session: &Session,
    sources: Vec<Arc<dyn FileSource>>,
    stdin: &mut Lines<BufReader<Stdin>>,
    downloads_dir: &Path,
) -> Result<()> {
    session.create_offer().await;
    let state = wait_for_signal(session).await?;
    print_signal("offer", &state);

    println!("Paste the answer from the receiving side and press enter:");
    let answer = read_line(stdin).await?;
    session.accept_answer(answer.trim()).await;
    bail_on_error(session)?;

    wait_for_connected(session).await?;
    println!("Connected. Sending {} file(s)...", sources.len());
    session.send_files(sources).await;

    event_loop(session, stdin, downloads_dir, true).await
}

async fn run_receiver(
    session: &Session,
    stdin: &mut Lines<BufReader<Stdin>>,
    downloads_dir: &Path,
) -> Result<()> {
    println!("Paste the offer from the sending side and press enter:");
    let offer = read_line(stdin).await?;
    session.accept_offer(offer.trim()).await;
    bail_on_error(session)?;

    let state = wait_for_signal(session).await?;
    print_signal("answer", &state);

    wait_for_connected(session).await?;
    println!(
        "Connected. Receiving into {} (Ctrl-C to quit)...",
        downloads_dir.display()
    );

    event_loop(session, stdin, downloads_dir, false).await
}

/// Shared connected-phase loop: report transfer progress, save received
/// files, relay chat lines from stdin, and exit on disconnect or Ctrl-C.
/// The sender additionally exits once all its transfers are terminal.
async fn event_loop(
    session: &Session,
    stdin: &mut Lines<BufReader<Stdin>>,
    downloads_dir: &Path,
    exit_when_done: bool,
) -> Result<()> {
    let mut state_rx = session.subscribe();
    let mut received = session
        .received_files()
        .context("received-files channel already taken")?;
    let mut reporter = ProgressReporter::default();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                reporter.report(&state);
                if let Some(error) = &state.error {
                    anyhow::bail!("Session failed: {error}");
                }
                if state.connection == ConnectionState::Disconnected {
                    println!("Peer disconnected.");
                    break;
                }
                if exit_when_done
                    && !state.transfers.is_empty()
                    && state.transfers.iter().all(|t| t.status.is_terminal())
                {
                    println!("All transfers finished.");
                    break;
                }
            }
            file = received.recv() => {
                let Some(file) = file else { break };
                match save::save_received(downloads_dir, &file.name, &file.bytes) {
                    Ok(path) => println!("Saved {}", path.display()),
                    Err(e) => warn!("Failed to save {}: {e:#}", file.name),
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(text)) if !text.trim().is_empty() => {
                        session.send_message(text.trim()).await;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        // stdin closed; keep running on the other events
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

/// Prints transfer progress lines and chat messages as state snapshots
/// arrive, deduplicating against what was already shown.
#[derive(Default)]
struct ProgressReporter {
    progress: HashMap<String, u8>,
    statuses: HashMap<String, TransferStatus>,
    messages_seen: usize,
}

impl ProgressReporter {
    fn report(&mut self, state: &ViewState) {
        for t in &state.transfers {
            let last = self.progress.get(&t.id).copied().unwrap_or(0);
            if t.status == TransferStatus::Transferring && t.progress >= last + 10 {
                self.progress.insert(t.id.clone(), t.progress);
                let speed_mib = t.speed / (1024.0 * 1024.0);
                match t.eta {
                    Some(eta) => println!(
                        "{}: {}% ({speed_mib:.1} MiB/s, {eta:.0}s left)",
                        t.name, t.progress
                    ),
                    None => println!("{}: {}%", t.name, t.progress),
                }
            }
            if self.statuses.get(&t.id) != Some(&t.status) && t.status.is_terminal() {
                self.statuses.insert(t.id.clone(), t.status);
                let label = match t.status {
                    TransferStatus::Completed => "completed",
                    TransferStatus::Cancelled => "cancelled",
                    _ => "failed",
                };
                println!("{}: {label}", t.name);
            }
        }
        for msg in state.messages.iter().skip(self.messages_seen) {
            if msg.sender == courier_core::ChatSender::Peer {
                println!("peer: {}", msg.text);
            }
        }
        self.messages_seen = state.messages.len();
    }
}

fn bail_on_error(session: &Session) -> Result<()> {
    if let Some(error) = session.state().error {
        anyhow::bail!("Session failed: {error}");
    }
    Ok(())
}

async fn wait_for_signal(session: &Session) -> Result<ViewState> {
    let mut rx = session.subscribe();
    loop {
        {
            let state = rx.borrow_and_update();
            if state.local_signal.is_some() {
                return Ok(state.clone());
            }
            if let Some(error) = &state.error {
                anyhow::bail!("Session failed: {error}");
            }
        }
        rx.changed().await.context("session state channel closed")?;
    }
}

async fn wait_for_connected(session: &Session) -> Result<()> {
    let mut rx = session.subscribe();
    loop {
        {
            let state = rx.borrow_and_update();
            match state.connection {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Error => {
                    let error = state.error.clone().unwrap_or_else(|| "unknown".to_string());
                    anyhow::bail!("Connection failed: {error}");
                }
                _ => {}
            }
        }
        rx.changed().await.context("session state channel closed")?;
    }
}

fn print_signal(kind: &str, state: &ViewState) {
    let signal = state.local_signal.as_deref().unwrap_or_default();
    println!("Your {kind} (ship it to the peer by QR code or clipboard):");
    println!();
    println!("{signal}");
    println!();
    if signal.len() > MAX_QR_SIGNAL_LEN {
        warn!(
            len = signal.len(),
            "Signal exceeds {MAX_QR_SIGNAL_LEN} characters and will not render as a QR code"
        );
    }
}

async fn read_line(stdin: &mut Lines<BufReader<Stdin>>) -> Result<String> {
    stdin
        .next_line()
        .await
        .context("Failed to read stdin")?
        .context("stdin closed before input arrived")
}
