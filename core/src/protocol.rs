//! Daemon IPC: newline-delimited JSON over the control socket.
//! Requests carry a random `id` echoed by the reply; fire-and-forget messages
//! (input, resize, detach without id) produce no reply. Broadcasts have no id.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// How long the relay waits for a daemon reply before failing the caller.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Session names: 1-64 chars from [A-Za-z0-9_-].
pub const MAX_SESSION_NAME_LEN: usize = 64;

/// Messages sent to the daemon (from the relay, the SSH front-door, or any
/// local client on the socket).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    ListSessions {
        id: String,
    },
    CreateSession {
        id: String,
        name: String,
    },
    DeleteSession {
        id: String,
        name: String,
    },
    RenameSession {
        id: String,
        old_name: String,
        new_name: String,
    },
    Attach {
        id: String,
        client_id: String,
        session: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Detach {
        /// Absent for the fire-and-forget variant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        client_id: String,
    },
    Input {
        client_id: String,
        data: String,
    },
    Resize {
        client_id: String,
        cols: u16,
        rows: u16,
    },
    GetShortcuts {
        id: String,
    },
    SetShortcuts {
        id: String,
        shortcuts: Vec<Shortcut>,
    },
}

impl ClientMsg {
    /// The request id, if this message expects a reply.
    pub fn id(&self) -> Option<&str> {
        match self {
            ClientMsg::ListSessions { id }
            | ClientMsg::CreateSession { id, .. }
            | ClientMsg::DeleteSession { id, .. }
            | ClientMsg::RenameSession { id, .. }
            | ClientMsg::Attach { id, .. }
            | ClientMsg::GetShortcuts { id }
            | ClientMsg::SetShortcuts { id, .. } => Some(id),
            ClientMsg::Detach { id, .. } => id.as_deref(),
            ClientMsg::Input { .. } | ClientMsg::Resize { .. } => None,
        }
    }
}

/// Messages sent by the daemon: replies (with id) and broadcasts (without).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DaemonMsg {
    Sessions {
        id: String,
        sessions: Vec<SessionInfo>,
    },
    Created {
        id: String,
        name: String,
    },
    Renamed {
        id: String,
        name: String,
    },
    Attached {
        id: String,
        /// Scrollback snapshot at the moment the attach completed.
        buffer: String,
        alive: bool,
    },
    Shortcuts {
        id: String,
        shortcuts: Vec<Shortcut>,
    },
    Ok {
        id: String,
    },
    Error {
        id: String,
        error: String,
    },
    // Broadcasts, pushed to every connected socket.
    Output {
        session: String,
        data: String,
    },
    Exit {
        session: String,
        code: u32,
    },
    SessionRemoved {
        session: String,
    },
    SessionRenamed {
        session: String,
        new_name: String,
    },
}

impl DaemonMsg {
    /// The echoed request id; None for broadcasts.
    pub fn id(&self) -> Option<&str> {
        match self {
            DaemonMsg::Sessions { id, .. }
            | DaemonMsg::Created { id, .. }
            | DaemonMsg::Renamed { id, .. }
            | DaemonMsg::Attached { id, .. }
            | DaemonMsg::Shortcuts { id, .. }
            | DaemonMsg::Ok { id }
            | DaemonMsg::Error { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.id().is_none()
    }
}

/// One entry in the daemon's session list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub alive: bool,
}

/// One keyboard shortcut mapping, persisted by the daemon as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shortcut {
    pub keys: String,
    pub action: String,
}

/// Serialize a message as one NDJSON line (trailing `\n` included).
pub fn encode_line<T: Serialize>(msg: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

/// Longest accepted line; a peer exceeding it has its current line discarded.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Incremental NDJSON line splitter. Feed arbitrary byte chunks; complete
/// lines come out in order, a partial trailing line is held until its
/// newline arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    overflowed: bool,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_LINE_BYTES && !self.buf.contains(&b'\n') {
            self.buf.clear();
            self.overflowed = true;
        }
    }

    /// Next complete line, without the trailing newline. Empty lines are
    /// skipped. Returns None once only a partial line remains buffered.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if self.overflowed {
                // Tail of an oversized line; drop it and resume normally.
                self.overflowed = false;
                continue;
            }
            if line.is_empty() {
                continue;
            }
            return Some(line);
        }
    }

    /// Decode the next buffered line into a message. `Some(Err(..))` means a
    /// complete line arrived but was not valid JSON for `T`.
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Option<serde_json::Result<T>> {
        self.next_line().map(|line| serde_json::from_slice(&line))
    }
}

/// Sanitize user input into a session name: drop characters outside
/// [A-Za-z0-9_-], truncate to 64, reject if nothing is left.
pub fn sanitize_session_name(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_SESSION_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decoder_reassembles_any_split() {
        let msgs = vec![
            ClientMsg::CreateSession { id: "a".into(), name: "dev".into() },
            ClientMsg::Input { client_id: "c1".into(), data: "echo hi\n".into() },
            ClientMsg::Resize { client_id: "c1".into(), cols: 80, rows: 24 },
        ];
        let mut stream = Vec::new();
        for m in &msgs {
            stream.extend_from_slice(&encode_line(m).unwrap());
        }

        // Every split point, including byte-at-a-time.
        for split in 0..=stream.len() {
            let mut dec = NdjsonDecoder::new();
            dec.extend(&stream[..split]);
            let mut got: Vec<ClientMsg> = Vec::new();
            while let Some(m) = dec.next_message() {
                got.push(m.unwrap());
            }
            dec.extend(&stream[split..]);
            while let Some(m) = dec.next_message() {
                got.push(m.unwrap());
            }
            assert_eq!(got.len(), msgs.len(), "split at {split}");
            for (a, b) in got.iter().zip(msgs.iter()) {
                assert_eq!(
                    serde_json::to_string(a).unwrap(),
                    serde_json::to_string(b).unwrap()
                );
            }
        }
    }

    #[test]
    fn partial_trailing_line_is_not_dispatched() {
        let mut dec = NdjsonDecoder::new();
        dec.extend(br#"{"type":"list-sessions","id":"x"}"#);
        assert!(dec.next_message::<ClientMsg>().is_none());
        dec.extend(b"\n");
        let msg = dec.next_message::<ClientMsg>().unwrap().unwrap();
        assert!(matches!(msg, ClientMsg::ListSessions { id } if id == "x"));
    }

    #[test]
    fn wire_shapes_use_camel_case_fields_and_kebab_tags() {
        let line = encode_line(&ClientMsg::RenameSession {
            id: "1".into(),
            old_name: "a".into(),
            new_name: "b".into(),
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["type"], "rename-session");
        assert_eq!(v["oldName"], "a");
        assert_eq!(v["newName"], "b");

        let line = encode_line(&DaemonMsg::SessionRenamed {
            session: "a".into(),
            new_name: "b".into(),
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["type"], "session-renamed");
        assert_eq!(v["newName"], "b");
    }

    #[test]
    fn broadcast_has_no_id() {
        let m = DaemonMsg::Output { session: "dev".into(), data: "x".into() };
        assert!(m.is_broadcast());
        let m = DaemonMsg::Ok { id: "7".into() };
        assert!(!m.is_broadcast());
    }

    #[test]
    fn sanitize_drops_truncates_rejects() {
        assert_eq!(sanitize_session_name("dev box!"), Some("devbox".into()));
        assert_eq!(sanitize_session_name("a_b-C9"), Some("a_b-C9".into()));
        assert_eq!(sanitize_session_name("../../etc"), Some("etc".into()));
        assert_eq!(sanitize_session_name("!!!"), None);
        assert_eq!(sanitize_session_name(""), None);
        let long = "x".repeat(200);
        assert_eq!(sanitize_session_name(&long).unwrap().len(), MAX_SESSION_NAME_LEN);
    }
}
