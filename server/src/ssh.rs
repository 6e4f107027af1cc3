//! SSH front-door: a password-auth listener that bridges SSH channels to
//! daemon sessions. The username picks the session name, so `ssh dev@host`
//! lands in the same scrollback a browser viewing "dev" sees. The host key
//! is generated once and persisted under the data dir.

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::KeyPair;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use katulong_core::client::DaemonEvent;
use katulong_core::protocol::{sanitize_session_name, DaemonMsg};
use katulong_core::pty;

use crate::access::constant_time_eq;
use crate::state::AppState;

const HOST_KEY_FILE: &str = "ssh_host_key";

/// Run the SSH listener until shutdown is signalled.
pub async fn run_ssh(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let key = load_or_generate_host_key(&state.cfg.data_dir)?;
    let config = Arc::new(Config {
        methods: MethodSet::PASSWORD,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: None,
        keys: vec![key],
        ..Config::default()
    });
    info!(port, "ssh front-door listening");

    let mut front_door = SshFrontDoor { state };
    tokio::select! {
        result = front_door.run_on_address(config, ("0.0.0.0", port)) => {
            result.context("ssh listener")
        }
        _ = shutdown.changed() => Ok(()),
    }
}

fn load_or_generate_host_key(data_dir: &Path) -> anyhow::Result<KeyPair> {
    let path = data_dir.join(HOST_KEY_FILE);
    if path.is_file() {
        return russh_keys::load_secret_key(&path, None).context("loading ssh host key");
    }
    let key = KeyPair::generate_ed25519().context("generating ssh host key")?;
    fs::create_dir_all(data_dir).context("creating data dir")?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .context("creating ssh host key file")?;
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("encoding ssh host key")?;
    file.write_all(&pem).context("writing ssh host key")?;
    info!(path = %path.display(), "generated ssh host key");
    Ok(key)
}

struct SshFrontDoor {
    state: AppState,
}

impl Server for SshFrontDoor {
    type Handler = SshConnection;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshConnection {
        debug!(peer = ?peer, "ssh connection");
        SshConnection {
            state: self.state.clone(),
            client_id: format!("ssh-{}", uuid::Uuid::new_v4()),
            username: None,
            dims: None,
            attached: false,
        }
    }
}

struct SshConnection {
    state: AppState,
    client_id: String,
    username: Option<String>,
    dims: Option<(u16, u16)>,
    attached: bool,
}

impl SshConnection {
    fn lockout_key(user: &str) -> String {
        format!("ssh:{user}")
    }
}

#[async_trait::async_trait]
impl Handler for SshConnection {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let key = Self::lockout_key(user);
        if self.state.lockouts.is_locked(&key).is_some() {
            warn!(user, "ssh auth rejected: locked out");
            return Ok(Auth::Reject { proceed_with_methods: None });
        }
        if constant_time_eq(password, &self.state.cfg.ssh_password) {
            self.state.lockouts.record_success(&key);
            self.username = Some(user.to_string());
            info!(user, "ssh auth ok");
            Ok(Auth::Accept)
        } else {
            self.state.lockouts.record_failure(&key);
            warn!(user, "ssh auth failed");
            Ok(Auth::Reject { proceed_with_methods: None })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dims = Some((col_width as u16, row_height as u16));
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let requested = self.username.clone().unwrap_or_else(|| "default".into());
        let name = sanitize_session_name(&requested).unwrap_or_else(|| "default".into());
        let (cols, rows) = self.dims.unwrap_or((pty::DEFAULT_COLS, pty::DEFAULT_ROWS));

        let (buffer, _alive) = self
            .state
            .daemon
            .attach(&self.client_id, &name, Some(cols), Some(rows))
            .await
            .context("attaching ssh client")?;
        self.attached = true;
        session.channel_success(channel);

        let handle = session.handle();
        if !buffer.is_empty() {
            let _ = handle.data(channel, CryptoVec::from(buffer.into_bytes())).await;
        }

        // Stream daemon output for this session to the SSH channel until the
        // shell exits or the session goes away.
        let daemon = self.state.daemon.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            let mut session_name = name;
            let mut events = daemon.subscribe();
            loop {
                match events.recv().await {
                    Ok(DaemonEvent::Broadcast(DaemonMsg::Output { session, data }))
                        if session == session_name =>
                    {
                        if handle.data(channel, CryptoVec::from(data.into_bytes())).await.is_err() {
                            break;
                        }
                    }
                    Ok(DaemonEvent::Broadcast(DaemonMsg::Exit { session, .. }))
                    | Ok(DaemonEvent::Broadcast(DaemonMsg::SessionRemoved { session }))
                        if session == session_name =>
                    {
                        let _ = handle.eof(channel).await;
                        let _ = handle.close(channel).await;
                        break;
                    }
                    Ok(DaemonEvent::Broadcast(DaemonMsg::SessionRenamed { session, new_name }))
                        if session == session_name =>
                    {
                        session_name = new_name;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            daemon.detach(&client_id).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.attached {
            let text = String::from_utf8_lossy(data).into_owned();
            let _ = self.state.daemon.input(&self.client_id, &text).await;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dims = Some((col_width as u16, row_height as u16));
        if self.attached {
            let _ = self
                .state
                .daemon
                .resize(&self.client_id, col_width as u16, row_height as u16)
                .await;
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.attached {
            self.state.daemon.detach(&self.client_id).await;
            self.attached = false;
        }
        Ok(())
    }
}

/// Resolve the active SSH password: SSH_PASSWORD, else SETUP_TOKEN, else a
/// random one (shown to localhost callers via /ssh/password).
pub fn resolve_ssh_password(ssh_password: Option<String>, setup_token: Option<String>) -> String {
    ssh_password
        .filter(|p| !p.is_empty())
        .or_else(|| setup_token.filter(|t| !t.is_empty()))
        .unwrap_or_else(|| {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            (0..24).map(|_| rng.sample(rand::distributions::Alphanumeric) as char).collect()
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn password_resolution_prefers_ssh_password() {
        assert_eq!(
            resolve_ssh_password(Some("a".into()), Some("b".into())),
            "a"
        );
        assert_eq!(resolve_ssh_password(None, Some("b".into())), "b");
        assert_eq!(resolve_ssh_password(Some(String::new()), Some("b".into())), "b");
        let generated = resolve_ssh_password(None, None);
        assert_eq!(generated.len(), 24);
    }

    #[test]
    fn host_key_is_generated_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_host_key(dir.path()).unwrap();
        let second = load_or_generate_host_key(dir.path()).unwrap();
        assert_eq!(
            russh_keys::PublicKeyBase64::public_key_base64(&first),
            russh_keys::PublicKeyBase64::public_key_base64(&second)
        );
    }
}
