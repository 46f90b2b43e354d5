//! shapingmgrd - declarative traffic shaping manager
//!
//! Entry point: parses the command line, loads the shaping document and
//! converges every declared interface.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use shapingmgrd::shaping_mgr::run_document;

#[derive(Parser, Debug)]
#[command(name = "shapingmgrd", about = "Declarative HTB traffic shaping manager")]
struct Args {
    /// Path to the shaping document (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Converge only this interface
    #[arg(short, long)]
    interface: Option<String>,

    /// Print the commands a run would execute, without executing them
    #[arg(long)]
    dry_run: bool,

    /// Maximum log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Initializes tracing/logging subsystem
fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);

    info!("--- Starting shapingmgrd ---");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping between operations");
            signal_cancel.cancel();
        }
    });

    match run_document(
        &args.config,
        args.interface.as_deref(),
        args.dry_run,
        &cancel,
    )
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("shapingmgrd failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
