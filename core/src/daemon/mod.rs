//! The PTY multiplexing daemon. Owns every shell session and its scrollback,
//! serves NDJSON RPCs on a unix socket, and fans PTY output out to all
//! connected sockets through bounded per-connection queues.
//!
//! All session state lives behind one mutex: scrollback appends, attach
//! snapshots, and broadcasts are serialized, so an attach reply is always a
//! consistent prefix of the output stream that follows it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config;
use crate::protocol::{
    encode_line, sanitize_session_name, ClientMsg, DaemonMsg, NdjsonDecoder, SessionInfo, Shortcut,
};
use crate::pty::{self, PtyHandle, ResizeSender};
use crate::scrollback::Scrollback;

/// Broadcast queue depth per connection. A connection that cannot drain this
/// many pending lines is disconnected rather than backpressuring the PTYs.
const CONN_QUEUE_CAP: usize = 256;

pub struct DaemonOpts {
    pub socket: PathBuf,
    pub data_dir: PathBuf,
}

struct Session {
    name: String,
    pty: Option<PtyHandle>,
    resize_tx: Option<ResizeSender>,
    scrollback: Scrollback,
    alive: bool,
    pid: Option<u32>,
}

struct Attachment {
    session: u64,
    conn: u64,
}

struct Conn {
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_session: u64,
    next_conn: u64,
    sessions: HashMap<u64, Session>,
    names: HashMap<String, u64>,
    /// clientId -> live attachment. One session per client.
    attachments: HashMap<String, Attachment>,
    conns: HashMap<u64, Conn>,
}

struct Daemon {
    state: Mutex<State>,
    data_dir: PathBuf,
}

/// Run the daemon until SIGINT/SIGTERM. Kills all live PTYs and removes the
/// socket file on the way out.
pub async fn run(opts: DaemonOpts) -> anyhow::Result<()> {
    std::fs::create_dir_all(&opts.data_dir)
        .with_context(|| format!("creating data dir {}", opts.data_dir.display()))?;
    claim_socket(&opts.socket).await?;
    let listener = UnixListener::bind(&opts.socket)
        .with_context(|| format!("binding {}", opts.socket.display()))?;
    info!(socket = %opts.socket.display(), "daemon listening");

    let daemon = Arc::new(Daemon { state: Mutex::new(State::default()), data_dir: opts.data_dir });

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_conn(Arc::clone(&daemon), stream));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("daemon shutting down");
    daemon.kill_all();
    let _ = std::fs::remove_file(&opts.socket);
    Ok(())
}

/// Probe an existing socket file. A live daemon answering the connect means
/// we must not start; a dead file is unlinked so the bind can proceed.
async fn claim_socket(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(path)).await {
        Ok(Ok(_)) => bail!("another daemon is already listening on {}", path.display()),
        _ => {
            warn!(socket = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
            Ok(())
        }
    }
}

async fn serve_conn(daemon: Arc<Daemon>, stream: UnixStream) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CONN_QUEUE_CAP);
    let conn_id = {
        let mut st = daemon.lock();
        let id = st.next_conn;
        st.next_conn += 1;
        st.conns.insert(id, Conn { tx });
        id
    };
    debug!(conn = conn_id, "socket connected");

    // Writer task: drains the queue. Ends when the conn entry is dropped
    // (normal close or fan-out overflow) or the peer goes away.
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut dec = NdjsonDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                dec.extend(&buf[..n]);
                while let Some(parsed) = dec.next_message::<ClientMsg>() {
                    match parsed {
                        Ok(msg) => daemon.handle(conn_id, msg).await,
                        Err(e) => warn!(conn = conn_id, error = %e, "unparseable message"),
                    }
                }
            }
        }
    }
    daemon.drop_conn(conn_id);
    debug!(conn = conn_id, "socket disconnected");
}

impl Daemon {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn handle(self: &Arc<Self>, conn_id: u64, msg: ClientMsg) {
        match msg {
            ClientMsg::ListSessions { id } => {
                let mut st = self.lock();
                let mut sessions: Vec<SessionInfo> = st
                    .sessions
                    .values()
                    .map(|s| SessionInfo { name: s.name.clone(), pid: s.pid, alive: s.alive })
                    .collect();
                sessions.sort_by(|a, b| a.name.cmp(&b.name));
                send_to(&mut st, conn_id, &DaemonMsg::Sessions { id, sessions });
            }
            ClientMsg::CreateSession { id, name } => {
                let mut st = self.lock();
                match self.create_session(&mut st, &name) {
                    Ok(uid) => {
                        let name = st.sessions[&uid].name.clone();
                        send_to(&mut st, conn_id, &DaemonMsg::Created { id, name });
                    }
                    Err(error) => send_to(&mut st, conn_id, &DaemonMsg::Error { id, error }),
                }
            }
            ClientMsg::DeleteSession { id, name } => {
                let mut st = self.lock();
                let Some(&uid) = st.names.get(&name) else {
                    send_to(&mut st, conn_id, &DaemonMsg::Error {
                        id,
                        error: format!("no such session: {name}"),
                    });
                    return;
                };
                if let Some(sess) = st.sessions.remove(&uid) {
                    st.names.remove(&sess.name);
                    if let Some(pty) = &sess.pty {
                        pty.kill();
                    }
                }
                st.attachments.retain(|_, a| a.session != uid);
                broadcast(&mut st, &DaemonMsg::SessionRemoved { session: name });
                send_to(&mut st, conn_id, &DaemonMsg::Ok { id });
            }
            ClientMsg::RenameSession { id, old_name, new_name } => {
                let mut st = self.lock();
                let Some(new_name) = sanitize_session_name(&new_name) else {
                    send_to(&mut st, conn_id, &DaemonMsg::Error {
                        id,
                        error: "invalid session name".into(),
                    });
                    return;
                };
                let Some(&uid) = st.names.get(&old_name) else {
                    send_to(&mut st, conn_id, &DaemonMsg::Error {
                        id,
                        error: format!("no such session: {old_name}"),
                    });
                    return;
                };
                if st.names.contains_key(&new_name) {
                    send_to(&mut st, conn_id, &DaemonMsg::Error {
                        id,
                        error: format!("session already exists: {new_name}"),
                    });
                    return;
                }
                st.names.remove(&old_name);
                st.names.insert(new_name.clone(), uid);
                if let Some(sess) = st.sessions.get_mut(&uid) {
                    sess.name = new_name.clone();
                }
                // Attachments key sessions by uid, so they follow the rename.
                broadcast(&mut st, &DaemonMsg::SessionRenamed {
                    session: old_name,
                    new_name: new_name.clone(),
                });
                send_to(&mut st, conn_id, &DaemonMsg::Renamed { id, name: new_name });
            }
            ClientMsg::Attach { id, client_id, session, cols, rows } => {
                let mut st = self.lock();
                let Some(name) = sanitize_session_name(&session) else {
                    send_to(&mut st, conn_id, &DaemonMsg::Error {
                        id,
                        error: "invalid session name".into(),
                    });
                    return;
                };
                let uid = match st.names.get(&name).copied() {
                    Some(uid) => uid,
                    None => match self.create_session(&mut st, &name) {
                        Ok(uid) => uid,
                        Err(error) => {
                            send_to(&mut st, conn_id, &DaemonMsg::Error { id, error });
                            return;
                        }
                    },
                };
                let (buffer, alive) = {
                    let sess = &st.sessions[&uid];
                    if let (Some(tx), Some(c), Some(r)) = (&sess.resize_tx, cols, rows) {
                        let _ = tx.send((c, r));
                    }
                    (sess.scrollback.snapshot(), sess.alive)
                };
                st.attachments.insert(client_id, Attachment { session: uid, conn: conn_id });
                send_to(&mut st, conn_id, &DaemonMsg::Attached { id, buffer, alive });
            }
            ClientMsg::Detach { id, client_id } => {
                let mut st = self.lock();
                st.attachments.remove(&client_id);
                if let Some(id) = id {
                    send_to(&mut st, conn_id, &DaemonMsg::Ok { id });
                }
            }
            ClientMsg::Input { client_id, data } => {
                // Input to a dead or missing session is dropped by design.
                let writer = {
                    let st = self.lock();
                    st.attachments
                        .get(&client_id)
                        .and_then(|a| st.sessions.get(&a.session))
                        .filter(|s| s.alive)
                        .and_then(|s| s.pty.as_ref())
                        .map(|p| Arc::clone(&p.writer))
                };
                if let Some(writer) = writer {
                    // Awaited so a connection's inputs reach the PTY in the
                    // order they were sent.
                    let _ = tokio::task::spawn_blocking(move || {
                        if let Ok(mut guard) = writer.lock() {
                            let _ = guard.write_all(data.as_bytes());
                            let _ = guard.flush();
                        }
                    })
                    .await;
                }
            }
            ClientMsg::Resize { client_id, cols, rows } => {
                let st = self.lock();
                if let Some(tx) = st
                    .attachments
                    .get(&client_id)
                    .and_then(|a| st.sessions.get(&a.session))
                    .and_then(|s| s.resize_tx.as_ref())
                {
                    let _ = tx.send((cols, rows));
                }
            }
            ClientMsg::GetShortcuts { id } => {
                let shortcuts = self.load_shortcuts();
                let mut st = self.lock();
                send_to(&mut st, conn_id, &DaemonMsg::Shortcuts { id, shortcuts });
            }
            ClientMsg::SetShortcuts { id, shortcuts } => {
                let result = self.store_shortcuts(&shortcuts);
                let mut st = self.lock();
                match result {
                    Ok(()) => send_to(&mut st, conn_id, &DaemonMsg::Ok { id }),
                    Err(e) => send_to(&mut st, conn_id, &DaemonMsg::Error {
                        id,
                        error: format!("persisting shortcuts: {e}"),
                    }),
                }
            }
        }
    }

    /// Spawn a shell session under the state lock. Exactly one concurrent
    /// create for a given name can succeed because the name is claimed while
    /// the lock is held.
    fn create_session(self: &Arc<Self>, st: &mut State, name: &str) -> Result<u64, String> {
        let Some(name) = sanitize_session_name(name) else {
            return Err("invalid session name".into());
        };
        if st.names.contains_key(&name) {
            return Err(format!("session already exists: {name}"));
        }
        let (pty, mut pty_rx, resize_tx, mut exit_rx) =
            pty::spawn_shell(pty::DEFAULT_COLS, pty::DEFAULT_ROWS)
                .map_err(|e| format!("spawning shell: {e}"))?;
        let uid = st.next_session;
        st.next_session += 1;
        let pid = pty.pid();
        st.sessions.insert(uid, Session {
            name: name.clone(),
            pty: Some(pty),
            resize_tx: Some(resize_tx),
            scrollback: Scrollback::new(),
            alive: true,
            pid,
        });
        st.names.insert(name.clone(), uid);
        info!(session = %name, pid, "session created");

        // Pump: append to scrollback and broadcast, both under the state
        // lock, keeping attach snapshots consistent with the stream.
        let pump = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(data) = pty_rx.recv().await {
                let mut st = pump.lock();
                let Some(sess) = st.sessions.get_mut(&uid) else { break };
                let chunk = Bytes::from(data);
                sess.scrollback.push(chunk.clone());
                let session = sess.name.clone();
                let data = String::from_utf8_lossy(&chunk).into_owned();
                broadcast(&mut st, &DaemonMsg::Output { session, data });
            }
        });

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(code) = exit_rx.recv().await {
                let mut st = watcher.lock();
                if let Some(sess) = st.sessions.get_mut(&uid) {
                    sess.alive = false;
                    sess.pty = None;
                    sess.resize_tx = None;
                    let session = sess.name.clone();
                    info!(session = %session, code, "session exited");
                    broadcast(&mut st, &DaemonMsg::Exit { session, code });
                }
            }
        });

        Ok(uid)
    }

    fn drop_conn(&self, conn_id: u64) {
        let mut st = self.lock();
        st.conns.remove(&conn_id);
        st.attachments.retain(|_, a| a.conn != conn_id);
    }

    fn kill_all(&self) {
        let st = self.lock();
        for sess in st.sessions.values() {
            if let Some(pty) = &sess.pty {
                pty.kill();
            }
        }
    }

    fn load_shortcuts(&self) -> Vec<Shortcut> {
        let path = config::shortcuts_path(&self.data_dir);
        let Ok(data) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        serde_json::from_str(&data).unwrap_or_default()
    }

    fn store_shortcuts(&self, shortcuts: &[Shortcut]) -> std::io::Result<()> {
        let path = config::shortcuts_path(&self.data_dir);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(shortcuts)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)
    }
}

/// Queue one message on a single connection. Best-effort: an unknown or
/// overflowing connection is dropped.
fn send_to(st: &mut State, conn_id: u64, msg: &DaemonMsg) {
    let Ok(line) = encode_line(msg) else { return };
    let full = match st.conns.get(&conn_id) {
        Some(conn) => conn.tx.try_send(line).is_err(),
        None => return,
    };
    if full {
        warn!(conn = conn_id, "reply queue overflow, disconnecting");
        st.conns.remove(&conn_id);
        st.attachments.retain(|_, a| a.conn != conn_id);
    }
}

/// Fan one message out to every connection. A connection whose queue is full
/// is disconnected; the broadcast never blocks on a slow client.
fn broadcast(st: &mut State, msg: &DaemonMsg) {
    let Ok(line) = encode_line(msg) else { return };
    let mut dropped: Vec<u64> = Vec::new();
    for (&id, conn) in &st.conns {
        if let Err(mpsc::error::TrySendError::Full(_)) = conn.tx.try_send(line.clone()) {
            dropped.push(id);
        }
    }
    for id in dropped {
        warn!(conn = id, "broadcast queue overflow, disconnecting");
        st.conns.remove(&id);
        st.attachments.retain(|_, a| a.conn != id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_daemon(dir: &Path) -> Arc<Daemon> {
        Arc::new(Daemon {
            state: Mutex::new(State::default()),
            data_dir: dir.to_path_buf(),
        })
    }

    fn add_conn(d: &Arc<Daemon>, cap: usize) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(cap);
        let mut st = d.lock();
        let id = st.next_conn;
        st.next_conn += 1;
        st.conns.insert(id, Conn { tx });
        (id, rx)
    }

    /// Insert an exited session directly, sidestepping the shell spawn.
    fn add_dead_session(d: &Arc<Daemon>, name: &str, scrollback: &str) -> u64 {
        let mut st = d.lock();
        let uid = st.next_session;
        st.next_session += 1;
        let mut sb = Scrollback::new();
        sb.push(Bytes::copy_from_slice(scrollback.as_bytes()));
        st.sessions.insert(uid, Session {
            name: name.to_string(),
            pty: None,
            resize_tx: None,
            scrollback: sb,
            alive: false,
            pid: None,
        });
        st.names.insert(name.to_string(), uid);
        uid
    }

    fn recv_msg(rx: &mut mpsc::Receiver<Vec<u8>>) -> DaemonMsg {
        let line = rx.try_recv().expect("expected a queued message");
        serde_json::from_slice(&line).expect("daemon wrote valid json")
    }

    #[tokio::test]
    async fn attach_to_dead_session_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        add_dead_session(&d, "dev", "hello from before");
        let (conn, mut rx) = add_conn(&d, 8);

        d.handle(conn, ClientMsg::Attach {
            id: "r1".into(),
            client_id: "c1".into(),
            session: "dev".into(),
            cols: None,
            rows: None,
        }).await;
        match recv_msg(&mut rx) {
            DaemonMsg::Attached { id, buffer, alive } => {
                assert_eq!(id, "r1");
                assert_eq!(buffer, "hello from before");
                assert!(!alive);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(d.lock().attachments.contains_key("c1"));
    }

    #[tokio::test]
    async fn input_to_dead_session_is_silently_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        add_dead_session(&d, "dev", "");
        let (conn, mut rx) = add_conn(&d, 8);
        d.handle(conn, ClientMsg::Attach {
            id: "r1".into(),
            client_id: "c1".into(),
            session: "dev".into(),
            cols: None,
            rows: None,
        }).await;
        let _ = recv_msg(&mut rx);

        d.handle(conn, ClientMsg::Input { client_id: "c1".into(), data: "ls\n".into() }).await;
        assert!(rx.try_recv().is_err(), "input must not produce a reply");
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        add_dead_session(&d, "dev", "");
        let (conn, mut rx) = add_conn(&d, 8);

        d.handle(conn, ClientMsg::CreateSession { id: "r1".into(), name: "dev".into() }).await;
        match recv_msg(&mut rx) {
            DaemonMsg::Error { id, error } => {
                assert_eq!(id, "r1");
                assert!(error.contains("already exists"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rename_rewrites_attachments_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        let uid = add_dead_session(&d, "old", "");
        add_dead_session(&d, "taken", "");
        let (conn, mut rx) = add_conn(&d, 8);
        d.handle(conn, ClientMsg::Attach {
            id: "r0".into(),
            client_id: "c1".into(),
            session: "old".into(),
            cols: None,
            rows: None,
        }).await;
        let _ = recv_msg(&mut rx);

        d.handle(conn, ClientMsg::RenameSession {
            id: "r1".into(),
            old_name: "old".into(),
            new_name: "taken".into(),
        }).await;
        assert!(matches!(recv_msg(&mut rx), DaemonMsg::Error { .. }));

        d.handle(conn, ClientMsg::RenameSession {
            id: "r2".into(),
            old_name: "old".into(),
            new_name: "fresh".into(),
        }).await;
        match recv_msg(&mut rx) {
            DaemonMsg::SessionRenamed { session, new_name } => {
                assert_eq!(session, "old");
                assert_eq!(new_name, "fresh");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(matches!(recv_msg(&mut rx), DaemonMsg::Renamed { .. }));
        let st = d.lock();
        assert_eq!(st.names.get("fresh"), Some(&uid));
        assert!(!st.names.contains_key("old"));
        assert_eq!(st.attachments.get("c1").map(|a| a.session), Some(uid));
    }

    #[tokio::test]
    async fn delete_drops_attachments_and_broadcasts_removed() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        add_dead_session(&d, "dev", "");
        let (conn, mut rx) = add_conn(&d, 8);
        d.handle(conn, ClientMsg::Attach {
            id: "r0".into(),
            client_id: "c1".into(),
            session: "dev".into(),
            cols: None,
            rows: None,
        }).await;
        let _ = recv_msg(&mut rx);

        d.handle(conn, ClientMsg::DeleteSession { id: "r1".into(), name: "dev".into() }).await;
        assert!(matches!(recv_msg(&mut rx), DaemonMsg::SessionRemoved { .. }));
        assert!(matches!(recv_msg(&mut rx), DaemonMsg::Ok { .. }));
        let st = d.lock();
        assert!(st.sessions.is_empty());
        assert!(st.attachments.is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_not_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        let (slow, _slow_rx) = add_conn(&d, 1);
        let (fast, mut fast_rx) = add_conn(&d, 64);

        {
            let mut st = d.lock();
            for _ in 0..4 {
                broadcast(&mut st, &DaemonMsg::Output {
                    session: "dev".into(),
                    data: "x".into(),
                });
            }
            assert!(!st.conns.contains_key(&slow), "overflowing conn dropped");
            assert!(st.conns.contains_key(&fast));
        }
        for _ in 0..4 {
            let _ = recv_msg(&mut fast_rx);
        }
    }

    #[tokio::test]
    async fn shortcuts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let d = test_daemon(dir.path());
        let want = vec![
            Shortcut { keys: "ctrl+shift+t".into(), action: "new-session".into() },
            Shortcut { keys: "ctrl+shift+w".into(), action: "close-session".into() },
        ];
        d.store_shortcuts(&want).unwrap();
        assert_eq!(d.load_shortcuts(), want);
    }
}
