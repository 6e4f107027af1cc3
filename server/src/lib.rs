//! Katulong relay server: HTTP+WS gateway in front of the PTY daemon, plus
//! the SSH front-door. Serves plain HTTP for localhost/trust bootstrap and
//! HTTPS with locally-generated certificates for everything else.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use axum::Extension;
use axum_server::tls_rustls::RustlsConfig;
use katulong_core::auth::AuthStore;
use katulong_core::client::DaemonClient;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

pub mod access;
pub mod auth_routes;
pub mod error;
pub mod pairing;
pub mod ssh;
pub mod state;
pub mod static_files;
pub mod tls;
pub mod upload;
pub mod web_server;
pub mod webauthn;
pub mod ws;

use state::{AppState, ListenerTls, ServerConfig};

const PID_FILE: &str = "katulong-server.pid";
/// How long in-flight HTTP gets to finish after the drain begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the relay until SIGINT/SIGTERM, then drain and exit.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let store = AuthStore::open(&cfg.data_dir).context("opening auth store")?;
    let daemon = DaemonClient::new(cfg.socket.clone());
    let state = AppState::new(store, daemon, cfg.clone());
    let _sweeper = state.lockouts.spawn_sweeper();

    let pid_path = cfg.data_dir.join(PID_FILE);
    std::fs::write(&pid_path, std::process::id().to_string()).context("writing pid file")?;

    let app = web_server::router(state.clone());

    // Plain HTTP: localhost access and the CA trust bootstrap.
    let http_addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let http_listener =
        tokio::net::TcpListener::bind(http_addr).await.context("binding http listener")?;
    info!(addr = %http_addr, "http listening");
    let http_app = app.clone().layer(Extension(ListenerTls(false)));
    let mut http_shutdown = state.shutdown.subscribe();
    let http_task = tokio::spawn(async move {
        axum::serve(
            http_listener,
            http_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        })
        .await
    });

    // HTTPS with the locally-generated CA; Secure cookies live here.
    let mut https_handle = None;
    if let Some(port) = cfg.https_port {
        let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        names.extend(web_server::mdns_name());
        names.extend(web_server::lan_ip());
        let material = tls::ensure_tls_material(&state.tls_dir(), &names)?;
        let rustls_cfg = RustlsConfig::from_pem(material.cert_chain_pem, material.key_pem)
            .await
            .context("loading tls material")?;
        let handle = axum_server::Handle::new();
        https_handle = Some(handle.clone());
        let https_app = app.clone().layer(Extension(ListenerTls(true)));
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        info!(addr = %addr, "https listening");
        tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(addr, rustls_cfg)
                .handle(handle)
                .serve(https_app.into_make_service_with_connect_info::<SocketAddr>())
                .await
            {
                warn!(error = %e, "https listener failed");
            }
        });
    }

    if let Some(port) = cfg.ssh_port {
        let ssh_state = state.clone();
        let ssh_shutdown = state.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = ssh::run_ssh(ssh_state, port, ssh_shutdown).await {
                warn!(error = %e, "ssh front-door failed");
            }
        });
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("got SIGINT"),
        _ = sigterm.recv() => info!("got SIGTERM"),
    }

    // Drain: flag first so /health flips to 503, then close every WS with
    // 1001 and stop accepting, then give in-flight requests a bounded grace.
    state.draining.store(true, Ordering::Release);
    let _ = state.shutdown.send(true);
    if let Some(handle) = https_handle {
        handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, http_task).await.is_err() {
        warn!("http drain timed out");
    }

    // Only remove the pid file if it is still ours; a replacement server may
    // have already claimed it.
    if let Ok(content) = std::fs::read_to_string(&pid_path) {
        if content.trim() == std::process::id().to_string() {
            let _ = std::fs::remove_file(&pid_path);
        }
    }
    info!("shutdown complete");
    Ok(())
}
