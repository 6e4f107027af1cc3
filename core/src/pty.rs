//! Portable PTY: spawn the user's shell and bridge its I/O to the daemon.
//! The reader runs on a blocking thread feeding a tokio channel; resize and
//! exit-watching each get their own thread, so input, resize, and kill never
//! contend on the same lock.

use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

/// Initial PTY dimensions when the client does not say otherwise.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 40;

/// Secrets and test flags that must never leak into a user shell.
pub const FILTERED_ENV: &[&str] = &["SSH_PASSWORD", "SETUP_TOKEN", "KATULONG_NO_AUTH"];

/// Login shell from $SHELL (fallback bash), seen as a modern 256/truecolor
/// terminal to match the browser terminal emulator.
fn shell_command() -> CommandBuilder {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string());
    let mut c = CommandBuilder::new(shell);
    c.arg("-l");
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    for key in FILTERED_ENV {
        c.env_remove(key);
    }
    c
}

/// Sender to request a PTY resize (cols, rows). A dedicated thread runs
/// master.resize() so resizes never block an async task.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// PTY bridge: shared writer for input, child handle for kill/pid.
pub struct PtyHandle {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Kill the PTY child process. Used on session delete and daemon shutdown.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            let _ = guard.kill();
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write input bytes to the shell. Blocking; call off the async path.
    pub fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer mutex poisoned"))?;
        guard.write_all(data)?;
        guard.flush()
    }
}

/// Spawn the shell in a PTY. Returns the handle, an output receiver, a resize
/// sender, and a receiver that yields the exit code exactly once.
pub fn spawn_shell(
    cols: u16,
    rows: u16,
) -> anyhow::Result<(PtyHandle, mpsc::Receiver<Vec<u8>>, ResizeSender, mpsc::Receiver<u32>)> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let child = pair.slave.spawn_command(shell_command())?;
    let pid = child.process_id();

    let mut reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = mpsc::channel::<u32>(1);

    let child = Arc::new(Mutex::new(child));

    // Blocking thread: read PTY output and hand it to the async side.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated thread: apply resizes as they come in.
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let _ = master.resize(PtySize { cols, rows, pixel_width: 0, pixel_height: 0 });
        }
    });

    // Poll child.try_wait(); report the exit code once when the shell ends.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let status = {
            let mut guard = match child_poll.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(s)) => Some(s.exit_code()),
                Err(_) => break,
            }
        };
        if let Some(code) = status {
            let _ = exit_tx.blocking_send(code);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
    });

    let handle = PtyHandle { writer: Arc::new(Mutex::new(writer)), child, pid };
    Ok((handle, rx, resize_tx, exit_rx))
}
