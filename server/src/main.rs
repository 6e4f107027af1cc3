//! Katulong relay binary. Every environment variable maps to a flag here, so
//! `PORT=8080 katulong-server` and `katulong-server --port 8080` are the
//! same thing.

use std::path::PathBuf;

use clap::Parser;
use katulong_core::config;
use katulong_server::ssh::resolve_ssh_password;
use katulong_server::state::ServerConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "katulong-server", version, about)]
struct Cli {
    /// HTTP port.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// HTTPS port; TLS material is generated under the data dir on first use.
    #[arg(long, env = "HTTPS_PORT")]
    https_port: Option<u16>,

    /// SSH front-door port; disabled when unset.
    #[arg(long, env = "SSH_PORT")]
    ssh_port: Option<u16>,

    /// Data directory for the auth store, uploads, TLS material.
    #[arg(long, env = "KATULONG_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Daemon control socket path.
    #[arg(long, env = "KATULONG_SOCK")]
    socket: Option<PathBuf>,

    /// Directory with the web terminal's static assets.
    #[arg(long, default_value = "public")]
    public_dir: PathBuf,

    /// SSH password; falls back to SETUP_TOKEN, then to a generated one.
    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    /// One-use string that authorizes a registration on an untrusted network.
    #[arg(long, env = "SETUP_TOKEN", hide_env_values = true)]
    setup_token: Option<String>,

    /// Test bypass: treat every request as localhost.
    #[arg(
        long,
        env = "KATULONG_NO_AUTH",
        value_parser = clap::builder::BoolishValueParser::new(),
        default_value = "false",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    no_auth: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = ServerConfig {
        http_port: cli.port,
        https_port: cli.https_port,
        ssh_port: cli.ssh_port,
        data_dir: cli.data_dir.unwrap_or_else(config::default_data_dir),
        socket: cli.socket.unwrap_or_else(config::default_socket_path),
        public_dir: cli.public_dir,
        ssh_password: resolve_ssh_password(cli.ssh_password, cli.setup_token.clone()),
        setup_token_env: cli.setup_token,
        no_auth: cli.no_auth,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(katulong_server::run(cfg))
}
