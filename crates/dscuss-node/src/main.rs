//! # dscuss
//!
//! Headless dscuss node.
//!
//! ```text
//! dscuss [--dir D] register <nickname> <info> <subscriptions>
//! dscuss [--dir D] run <nickname>
//! ```
//!
//! Exit status is 0 on success, 1 when the node fails to start and 2 on
//! invalid arguments.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use dscuss_node::{logging, Dscuss, DscussError};

const PEER_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "dscuss", version, about = "Peer-to-peer discussion node")]
struct Cli {
    /// Node directory. Defaults to ~/.dscuss.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Mirror the log to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user and solve its proof of work.
    Register {
        nickname: String,
        info: String,
        /// Topics separated by newlines or ';', tags within a topic by ','.
        subscriptions: String,
    },
    /// Log in and serve peers until interrupted.
    Run { nickname: String },
}

fn default_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".dscuss"))
        .unwrap_or_else(|| PathBuf::from(".dscuss"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 2 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dscuss: {e:#}");
            let usage = e
                .downcast_ref::<DscussError>()
                .is_some_and(DscussError::is_usage);
            ExitCode::from(if usage { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let dir = cli.dir.unwrap_or_else(default_dir);
    std::fs::create_dir_all(&dir)?;
    logging::init(&dir, cli.verbose)?;
    info!("Starting dscuss v{}", env!("CARGO_PKG_VERSION"));

    let mut node = Dscuss::init(&dir)?;

    match cli.command {
        Command::Register {
            nickname,
            info,
            subscriptions,
        } => {
            let user = node
                .register(&nickname, &info, &subscriptions.replace(';', "\n"))
                .await?;
            println!("registered {} ({})", user.nickname(), user.id().to_base64());
        }
        Command::Run { nickname } => {
            let session = node.login(&nickname).await?;
            match session.listen_addr() {
                Some(addr) => println!("{nickname} listening on {addr}"),
                None => println!("{nickname} logged in (offline)"),
            }

            let mut report = tokio::time::interval(PEER_REPORT_INTERVAL);
            report.tick().await;
            loop {
                tokio::select! {
                    _ = report.tick() => {
                        let peers = node.session()?.list_peers();
                        info!(count = peers.len(), "connected peers");
                        for peer in peers {
                            info!("  {peer}");
                        }
                    }
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            error!(error = %e, "failed to listen for interrupt");
                        }
                        break;
                    }
                }
            }
            info!("shutting down");
            node.logout().await?;
        }
    }

    node.uninit().await;
    Ok(())
}
