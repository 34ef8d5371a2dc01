use anyhow::Context;
use std::path::PathBuf;

pub(crate) enum Mode {
    /// Offer side: transfer the given files to the peer.
    Send(Vec<PathBuf>),
    /// Answer side: accept incoming files.
    Receive,
}

pub(crate) struct Args {
    pub mode: Mode,
    pub config_path: PathBuf,
    pub downloads_dir: Option<PathBuf>,
    pub stun_urls: Vec<String>,
    pub no_stun: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut mode: Option<Mode> = None;
    let mut config_path = PathBuf::from("./courier.toml");
    let mut downloads_dir = None;
    let mut stun_urls = Vec::new();
    let mut no_stun = false;
    let mut files = Vec::new();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("courier {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("courier - serverless peer-to-peer file drop");
                println!();
                println!("USAGE:");
                println!("    courier send <FILE>...       Offer files to a peer");
                println!("    courier receive              Accept files from a peer");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>              Config file [default: ./courier.toml]");
                println!("    --downloads-dir <DIR>        Where received files are saved");
                println!("    --stun <URL>                 STUN server (repeatable, replaces defaults)");
                println!("    --no-stun                    Host candidates only (same LAN)");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                println!();
                println!("Ship the printed signal string to the other side by QR code or");
                println!("clipboard, and paste theirs back when prompted.");
                std::process::exit(0);
            }
            "send" if mode.is_none() => {
                mode = Some(Mode::Send(Vec::new()));
            }
            "receive" if mode.is_none() => {
                mode = Some(Mode::Receive);
            }
            "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--downloads-dir" => {
                i += 1;
                downloads_dir = Some(PathBuf::from(
                    args.get(i).context("Missing --downloads-dir value")?,
                ));
            }
            "--stun" => {
                i += 1;
                stun_urls.push(args.get(i).context("Missing --stun value")?.clone());
            }
            "--no-stun" => {
                no_stun = true;
            }
            other if !other.starts_with('-') && matches!(mode, Some(Mode::Send(_))) => {
                files.push(PathBuf::from(other));
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    let mode = match mode {
        Some(Mode::Send(_)) => {
            anyhow::ensure!(!files.is_empty(), "send requires at least one file");
            Mode::Send(files)
        }
        Some(Mode::Receive) => Mode::Receive,
        None => anyhow::bail!("Missing command: expected 'send <FILE>...' or 'receive'"),
    };

    Ok(Args {
        mode,
        config_path,
        downloads_dir,
        stun_urls,
        no_stun,
    })
}
