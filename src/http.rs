//! HTTP `CONNECT` tunnel into the RPC protocol.
//!
//! A client sends `CONNECT /_trpc_ HTTP/1.0`; the server answers with a
//! fixed `200 Connected` status line and from then on treats the raw
//! connection exactly like one accepted by the native listener. Any other
//! method is answered with `405` and the connection is closed.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::error::{Result, RpcError};
use crate::server::Server;
use crate::transport::Listener;

/// Request path the tunnel is served on.
pub const DEFAULT_RPC_PATH: &str = "/_trpc_";

/// Status sent once the tunnel is established.
pub const CONNECTED: &str = "200 Connected to Trpc";

/// Maximum size of a request or response head.
const MAX_HEAD_SIZE: usize = 8 * 1024;

const METHOD_NOT_ALLOWED: &str = "HTTP/1.0 405 Method Not Allowed\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 17\r\n\
\r\n\
405 must CONNECT\n";

const NOT_FOUND: &str = "HTTP/1.0 404 Not Found\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 10\r\n\
\r\n\
not found\n";

/// Read an HTTP head: start line plus header lines, up to the blank line.
///
/// Returns the start line; header lines are read and ignored.
async fn read_head<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_HEAD_SIZE as u64);
    let mut start_line: Option<String> = None;

    loop {
        let mut line = String::new();
        let n = limited.read_line(&mut line).await?;
        if n == 0 {
            return Err(match start_line {
                None => RpcError::ConnectionClosed,
                Some(_) => RpcError::Protocol("HTTP head truncated or too large".to_string()),
            });
        }

        let line = line.trim_end_matches(&['\r', '\n'][..]);
        match start_line {
            None => start_line = Some(line.to_string()),
            Some(start) if line.is_empty() => return Ok(start),
            Some(_) => {}
        }
    }
}

/// Server side: read the request and answer it.
///
/// Returns `true` if the tunnel was established and RPC traffic follows.
pub(crate) async fn accept_tunnel<S>(stream: &mut BufReader<S>) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_line = read_head(stream).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    if method != "CONNECT" {
        tracing::debug!("rpc server: rejecting HTTP {} {}", method, path);
        stream.write_all(METHOD_NOT_ALLOWED.as_bytes()).await?;
        stream.flush().await?;
        return Ok(false);
    }
    if path != DEFAULT_RPC_PATH {
        tracing::debug!("rpc server: CONNECT to unknown path {}", path);
        stream.write_all(NOT_FOUND.as_bytes()).await?;
        stream.flush().await?;
        return Ok(false);
    }

    stream
        .write_all(format!("HTTP/1.0 {}\n\n", CONNECTED).as_bytes())
        .await?;
    stream.flush().await?;
    Ok(true)
}

/// Client side: request the tunnel and check the status line.
pub(crate) async fn connect_tunnel<S>(stream: &mut BufReader<S>, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("CONNECT {} HTTP/1.0\n\n", path).as_bytes())
        .await?;
    stream.flush().await?;

    let status_line = read_head(stream).await?;
    let status = status_line
        .split_once(' ')
        .map(|(_, status)| status)
        .unwrap_or_default();
    if status != CONNECTED {
        return Err(RpcError::Protocol(format!(
            "unexpected HTTP response: {}",
            status_line
        )));
    }
    Ok(())
}

impl Server {
    /// Serve one HTTP connection.
    ///
    /// `CONNECT` on [`DEFAULT_RPC_PATH`] turns the connection into an RPC
    /// connection served by [`Server::serve_conn`].
    pub async fn serve_http_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = BufReader::new(stream);
        match accept_tunnel(&mut stream).await {
            Ok(true) => self.serve_conn(stream).await,
            Ok(false) => {}
            Err(RpcError::ConnectionClosed) => {}
            Err(e) => tracing::error!("rpc server: HTTP tunnel error: {}", e),
        }
    }

    /// Accept HTTP connections and serve each on its own task.
    pub async fn accept_http(&self, listener: TcpListener) {
        loop {
            let stream = match listener.accept_conn().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return;
                }
            };

            let server = self.clone();
            tokio::spawn(async move { server.serve_http_conn(stream).await });
        }
    }
}
