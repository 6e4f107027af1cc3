//! Client side of the daemon control socket. One instance is shared by all
//! relay workers: RPCs are matched to replies through a pending map keyed by
//! request id, broadcasts fan out to subscribers, and a supervisor task keeps
//! reconnecting with exponential backoff when the daemon goes away.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{encode_line, ClientMsg, DaemonMsg, NdjsonDecoder, SessionInfo, Shortcut, RPC_TIMEOUT};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAP: usize = 1024;

/// What subscribers see: daemon broadcasts plus connection transitions.
/// `Connected` is the signal to re-issue live attachments.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Broadcast(DaemonMsg),
    Connected,
    Disconnected,
}

/// Errors surfaced to callers of the RPC helpers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("daemon unavailable")]
    Unavailable,
    #[error("daemon rpc timed out")]
    Timeout,
    /// The daemon processed the request and said no.
    #[error("{0}")]
    Daemon(String),
}

struct ClientInner {
    socket: PathBuf,
    writer: tokio::sync::Mutex<Option<tokio::net::unix::OwnedWriteHalf>>,
    pending: Mutex<HashMap<String, oneshot::Sender<DaemonMsg>>>,
    events: broadcast::Sender<DaemonEvent>,
    connected: AtomicBool,
}

#[derive(Clone)]
pub struct DaemonClient {
    inner: Arc<ClientInner>,
}

impl DaemonClient {
    /// Create the client and start its reconnect supervisor.
    pub fn new(socket: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let inner = Arc::new(ClientInner {
            socket,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events,
            connected: AtomicBool::new(false),
        });
        tokio::spawn(supervise(Arc::clone(&inner)));
        Self { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.inner.events.subscribe()
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RpcError> {
        let id = new_id();
        match self.rpc(id.clone(), ClientMsg::ListSessions { id }).await? {
            DaemonMsg::Sessions { sessions, .. } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_session(&self, name: &str) -> Result<String, RpcError> {
        let id = new_id();
        match self.rpc(id.clone(), ClientMsg::CreateSession { id, name: name.into() }).await? {
            DaemonMsg::Created { name, .. } => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_session(&self, name: &str) -> Result<(), RpcError> {
        let id = new_id();
        match self.rpc(id.clone(), ClientMsg::DeleteSession { id, name: name.into() }).await? {
            DaemonMsg::Ok { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn rename_session(&self, old_name: &str, new_name: &str) -> Result<String, RpcError> {
        let id = new_id();
        let msg = ClientMsg::RenameSession {
            id: id.clone(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        };
        match self.rpc(id, msg).await? {
            DaemonMsg::Renamed { name, .. } => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    /// Attach a client to a session (created lazily by the daemon). Returns
    /// the scrollback snapshot and whether the shell is still running.
    pub async fn attach(
        &self,
        client_id: &str,
        session: &str,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<(String, bool), RpcError> {
        let id = new_id();
        let msg = ClientMsg::Attach {
            id: id.clone(),
            client_id: client_id.into(),
            session: session.into(),
            cols,
            rows,
        };
        match self.rpc(id, msg).await? {
            DaemonMsg::Attached { buffer, alive, .. } => Ok((buffer, alive)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn detach(&self, client_id: &str) {
        let _ = self.send(&ClientMsg::Detach { id: None, client_id: client_id.into() }).await;
    }

    pub async fn input(&self, client_id: &str, data: &str) -> Result<(), RpcError> {
        self.send(&ClientMsg::Input { client_id: client_id.into(), data: data.into() }).await
    }

    pub async fn resize(&self, client_id: &str, cols: u16, rows: u16) -> Result<(), RpcError> {
        self.send(&ClientMsg::Resize { client_id: client_id.into(), cols, rows }).await
    }

    pub async fn get_shortcuts(&self) -> Result<Vec<Shortcut>, RpcError> {
        let id = new_id();
        match self.rpc(id.clone(), ClientMsg::GetShortcuts { id }).await? {
            DaemonMsg::Shortcuts { shortcuts, .. } => Ok(shortcuts),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_shortcuts(&self, shortcuts: Vec<Shortcut>) -> Result<(), RpcError> {
        let id = new_id();
        match self.rpc(id.clone(), ClientMsg::SetShortcuts { id, shortcuts }).await? {
            DaemonMsg::Ok { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Fire-and-forget write; no reply is expected.
    async fn send(&self, msg: &ClientMsg) -> Result<(), RpcError> {
        self.write_line(msg).await
    }

    async fn rpc(&self, id: String, msg: ClientMsg) -> Result<DaemonMsg, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending_insert(id.clone(), tx);
        if let Err(e) = self.write_line(&msg).await {
            self.pending_remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(DaemonMsg::Error { error, .. })) => Err(RpcError::Daemon(error)),
            Ok(Ok(reply)) => Ok(reply),
            // The connection died and the pending map was flushed.
            Ok(Err(_)) => Err(RpcError::Unavailable),
            Err(_) => {
                self.pending_remove(&id);
                Err(RpcError::Timeout)
            }
        }
    }

    async fn write_line(&self, msg: &ClientMsg) -> Result<(), RpcError> {
        let line = encode_line(msg).map_err(|_| RpcError::Unavailable)?;
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(RpcError::Unavailable);
        };
        if writer.write_all(&line).await.is_err() {
            *guard = None;
            return Err(RpcError::Unavailable);
        }
        Ok(())
    }

    fn pending_insert(&self, id: String, tx: oneshot::Sender<DaemonMsg>) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
    }

    fn pending_remove(&self, id: &str) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn unexpected(msg: DaemonMsg) -> RpcError {
    RpcError::Daemon(format!("unexpected daemon reply: {msg:?}"))
}

/// Keep one connection to the daemon alive. Backoff doubles from 1 s to a
/// 30 s cap and resets after a successful connect.
async fn supervise(inner: Arc<ClientInner>) {
    let mut backoff = BACKOFF_START;
    loop {
        match UnixStream::connect(&inner.socket).await {
            Ok(stream) => {
                info!(socket = %inner.socket.display(), "connected to daemon");
                backoff = BACKOFF_START;
                let (read_half, write_half) = stream.into_split();
                *inner.writer.lock().await = Some(write_half);
                inner.connected.store(true, Ordering::Release);
                let _ = inner.events.send(DaemonEvent::Connected);

                read_loop(&inner, read_half).await;

                inner.connected.store(false, Ordering::Release);
                *inner.writer.lock().await = None;
                // Waiters learn immediately instead of running out the clock.
                inner.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
                let _ = inner.events.send(DaemonEvent::Disconnected);
                warn!("daemon connection lost");
            }
            Err(e) => {
                debug!(error = %e, backoff = ?backoff, "daemon not reachable");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

async fn read_loop(inner: &Arc<ClientInner>, mut read_half: tokio::net::unix::OwnedReadHalf) {
    let mut dec = NdjsonDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                dec.extend(&buf[..n]);
                while let Some(parsed) = dec.next_message::<DaemonMsg>() {
                    match parsed {
                        Ok(msg) => dispatch(inner, msg),
                        Err(e) => warn!(error = %e, "unparseable daemon message"),
                    }
                }
            }
        }
    }
}

fn dispatch(inner: &Arc<ClientInner>, msg: DaemonMsg) {
    let id = msg.id().map(str::to_string);
    match id {
        Some(id) => {
            let waiter = inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => debug!(%id, "reply for unknown or timed-out request"),
            }
        }
        None => {
            let _ = inner.events.send(DaemonEvent::Broadcast(msg));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal daemon stand-in: answers create-session and pushes one output
    /// broadcast afterwards.
    async fn fake_daemon(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        let mut dec = NdjsonDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            dec.extend(&buf[..n]);
            while let Some(msg) = dec.next_message::<ClientMsg>() {
                if let Ok(ClientMsg::CreateSession { id, name }) = msg {
                    let reply = encode_line(&DaemonMsg::Created { id, name: name.clone() }).unwrap();
                    write_half.write_all(&reply).await.unwrap();
                    let push = encode_line(&DaemonMsg::Output {
                        session: name,
                        data: "ready".into(),
                    })
                    .unwrap();
                    write_half.write_all(&push).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn rpc_round_trip_and_broadcast_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(fake_daemon(listener));

        let client = DaemonClient::new(sock);
        let mut events = client.subscribe();

        // Wait for the supervisor to connect.
        loop {
            match events.recv().await.unwrap() {
                DaemonEvent::Connected => break,
                _ => continue,
            }
        }

        let name = client.create_session("dev").await.unwrap();
        assert_eq!(name, "dev");

        match events.recv().await.unwrap() {
            DaemonEvent::Broadcast(DaemonMsg::Output { session, data }) => {
                assert_eq!(session, "dev");
                assert_eq!(data, "ready");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rpc_without_daemon_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("missing.sock"));
        match client.create_session("dev").await {
            Err(RpcError::Unavailable) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
