//! Listeners the server accept loop can run on.
//!
//! - TCP: `tokio::net::TcpListener`
//! - Unix: Unix Domain Socket, with socket-file cleanup
//!
//! # Example
//!
//! ```no_run
//! use trpc::transport::UnixSocketListener;
//!
//! # async fn run() -> trpc::Result<()> {
//! let listener = UnixSocketListener::bind("/tmp/trpc.sock")?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Source of incoming connections.
pub trait Listener: Send + Sync + 'static {
    /// Connection type produced by [`accept_conn`](Self::accept_conn).
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    fn accept_conn(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept_conn(&self) -> io::Result<TcpStream> {
        let (stream, _addr) = self.accept().await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Generate a unique socket path in the temp directory.
///
/// Format: `{tmp}/trpc-{pid}-{random}.sock`
pub fn temp_socket_path() -> std::path::PathBuf {
    let name = format!("trpc-{}-{:x}.sock", std::process::id(), rand_u64());
    std::env::temp_dir().join(name)
}

/// Simple random u64 using system time, a counter and the process ID.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;

    (nanos ^ count.rotate_left(32)).wrapping_mul(0x517cc1b727220a95) ^ pid
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};

    impl Listener for UnixListener {
        type Conn = UnixStream;

        async fn accept_conn(&self) -> io::Result<UnixStream> {
            let (stream, _addr) = self.accept().await?;
            Ok(stream)
        }
    }

    /// Unix Domain Socket listener that owns its socket file.
    #[derive(Debug)]
    pub struct UnixSocketListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl UnixSocketListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes a stale socket file at the path before binding. Must be
        /// called inside a tokio runtime.
        pub fn bind<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
            let path = path.as_ref();
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;
            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        /// Get the socket path.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Listener for UnixSocketListener {
        type Conn = UnixStream;

        async fn accept_conn(&self) -> io::Result<UnixStream> {
            self.listener.accept_conn().await
        }
    }

    impl Drop for UnixSocketListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
pub use unix_impl::UnixSocketListener;
