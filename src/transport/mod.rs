//! Transport module - listeners the server accepts connections on.
//!
//! Provides abstraction over:
//! - TCP sockets
//! - Unix Domain Sockets (Linux/macOS)

mod listener;

pub use listener::{temp_socket_path, Listener};

#[cfg(unix)]
pub use listener::UnixSocketListener;
