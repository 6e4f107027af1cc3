//! Filesystem defaults shared by the daemon and the relay: data directory
//! and control-socket path, overridable through the environment.

use std::path::PathBuf;

/// Data directory: $KATULONG_DATA_DIR, else ~/.katulong, preferring an
/// already-initialized ~/.config/katulong if one exists.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("KATULONG_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    let xdg = home.join(".config").join("katulong");
    if xdg.is_dir() {
        return xdg;
    }
    home.join(".katulong")
}

/// Control socket: $KATULONG_SOCK, else /tmp/katulong-daemon.sock.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("KATULONG_SOCK")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/katulong-daemon.sock"))
}

/// Shortcuts file persisted by the daemon inside the data dir.
pub fn shortcuts_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("shortcuts.json")
}
