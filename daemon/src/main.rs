//! Katulong daemon binary: owns all PTY sessions and serves NDJSON RPCs on a
//! unix socket. Run one per host; the relay and SSH front-door connect to it.

use std::path::PathBuf;

use clap::Parser;
use katulong_core::{config, daemon};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "katulong-daemon", version, about)]
struct Cli {
    /// Control socket path.
    #[arg(long, env = "KATULONG_SOCK")]
    socket: Option<PathBuf>,

    /// Data directory (shortcuts file lives here).
    #[arg(long, env = "KATULONG_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let opts = daemon::DaemonOpts {
        socket: cli.socket.unwrap_or_else(config::default_socket_path),
        data_dir: cli.data_dir.unwrap_or_else(config::default_data_dir),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(daemon::run(opts))
}
