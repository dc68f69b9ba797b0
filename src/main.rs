//! Thin CLI launcher (§6). Owns argument parsing, subscriber setup, and
//! translating a download failure into a process exit code. All download
//! logic lives in the library; this binary never touches the scheduler,
//! tracker, or file writer directly.
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rs_torrent_client::Orchestrator;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstc", version, about = "A download-only BitTorrent client")]
struct Cli {
    /// Raise the tracing filter to `debug` (pass twice for `trace`).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a torrent's content into a destination directory.
    Download {
        /// Path to the `.torrent` metainfo file.
        torrent_path: PathBuf,
        /// Directory the content is written into (created if absent).
        destination_path: PathBuf,
    },
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "rs_torrent_client=info",
        1 => "rs_torrent_client=debug",
        _ => "rs_torrent_client=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Download { torrent_path, destination_path } => {
            run_download(&torrent_path, &destination_path).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "download failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_download(torrent_path: &std::path::Path, destination_path: &std::path::Path) -> Result<()> {
    if !destination_path.exists() {
        std::fs::create_dir_all(destination_path)?;
    }
    let orchestrator = Orchestrator::load(torrent_path, destination_path)?;
    let summary = orchestrator.run().await?;
    tracing::info!(
        downloaded = summary.downloaded,
        total = summary.total,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        throughput_bps = summary.throughput(),
        "download complete"
    );
    Ok(())
}
