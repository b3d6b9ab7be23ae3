//! cdcsync-agent: remote-side sync server.
//!
//! Deployed to the instance out-of-band and reached through an SSH-forwarded
//! port; each accepted connection runs one sync conversation against the
//! exported directory.

use std::net::TcpListener;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};

use cdcsync_sync::SyncServer;

#[derive(Parser)]
#[command(name = "cdcsync-agent")]
#[command(version)]
#[command(about = "Remote sync server for cdcsync")]
struct Cli {
    /// Directory this agent exports as the sync destination
    #[arg(long, value_name = "DIR")]
    dir: PathBuf,

    /// Listen port
    #[arg(long, default_value_t = 45870)]
    port: u16,

    /// Listen address; keep loopback when tunnelling over SSH
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Exit after serving one sync
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .with_target(false)
        .init();

    std::fs::create_dir_all(&cli.dir)?;
    let listener = TcpListener::bind((cli.bind.as_str(), cli.port))?;
    info!(
        "serving {} on {}:{}",
        cli.dir.display(),
        cli.bind,
        cli.port
    );

    let server = SyncServer::new(&cli.dir);
    loop {
        let (stream, peer) = listener.accept()?;
        info!("sync from {peer}");
        match server.serve(stream) {
            Ok(summary) => info!(
                "done: {} files ({} missing, {} changed, {} deleted)",
                summary.files_total,
                summary.files_missing,
                summary.files_changed,
                summary.files_deleted,
            ),
            Err(err) => warn!("sync failed: {err}"),
        }
        if cli.once {
            break;
        }
    }
    Ok(())
}
