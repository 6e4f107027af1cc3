//! Katulong core: PTY daemon, scrollback, daemon IPC protocol + client, auth
//! store, lockout. No HTTP; the relay and SSH front-door live in the server
//! crate and talk to the daemon through [`client::DaemonClient`].

pub mod auth;
pub mod client;
pub mod config;
pub mod daemon;
pub mod protocol;
pub mod pty;
pub mod scrollback;
