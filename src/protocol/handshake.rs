//! Connection options and the handshake that carries them.
//!
//! Immediately after connecting, the client writes its [`Options`] as one
//! JSON object terminated by `\n`. The server reads exactly that line,
//! checks the magic number, and resolves the codec. Everything after the
//! newline is codec-framed traffic.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use trpc::codec::CodecType;
//! use trpc::protocol::Options;
//!
//! let options = Options::default()
//!     .codec(CodecType::Json)
//!     .handle_timeout(Duration::from_millis(100));
//! assert_eq!(options.magic_number, trpc::protocol::MAGIC_NUMBER);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Constant identifying this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default time allowed for dialing plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum length of the handshake line, newline included.
pub const MAX_HANDSHAKE_SIZE: usize = 4096;

/// Connection-level options negotiated by the handshake.
///
/// A zero timeout means "unbounded".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`] or the server drops the connection.
    pub magic_number: u32,
    /// Codec for all frames after the handshake.
    pub codec_type: CodecType,
    /// Limit on dialing plus handshake (client side only).
    pub connect_timeout: Duration,
    /// Limit on each handler invocation (enforced by the server).
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Set the codec.
    pub fn codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    /// Set the connect timeout (zero = unbounded).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the server-side handle timeout (zero = unbounded).
    pub fn handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }
}

/// Wire form of [`Options`].
#[derive(Debug, Serialize, Deserialize)]
struct OptionRecord {
    magic_number: u32,
    codec_type: String,
    #[serde(default)]
    connect_timeout_ms: u64,
    #[serde(default)]
    handle_timeout_ms: u64,
}

impl From<&Options> for OptionRecord {
    fn from(options: &Options) -> Self {
        Self {
            magic_number: options.magic_number,
            codec_type: options.codec_type.to_string(),
            connect_timeout_ms: options.connect_timeout.as_millis() as u64,
            handle_timeout_ms: options.handle_timeout.as_millis() as u64,
        }
    }
}

/// Write the handshake line.
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(&OptionRecord::from(options))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and validate the handshake line.
///
/// Fails with [`RpcError::InvalidMagicNumber`] before looking at the codec,
/// and with [`RpcError::UnknownCodec`] if the codec identifier is not one
/// this crate implements. Reads nothing past the newline.
pub async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let n = reader
        .take(MAX_HANDSHAKE_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Err(RpcError::ConnectionClosed);
    }
    if line.last() != Some(&b'\n') {
        if n >= MAX_HANDSHAKE_SIZE {
            return Err(RpcError::Handshake(format!(
                "option record longer than {} bytes",
                MAX_HANDSHAKE_SIZE
            )));
        }
        return Err(RpcError::Handshake("option record truncated".to_string()));
    }

    let record: OptionRecord = serde_json::from_slice(&line)?;
    if record.magic_number != MAGIC_NUMBER {
        return Err(RpcError::InvalidMagicNumber {
            expected: MAGIC_NUMBER,
            actual: record.magic_number,
        });
    }
    let codec_type = record.codec_type.parse::<CodecType>()?;

    Ok(Options {
        magic_number: record.magic_number,
        codec_type,
        connect_timeout: Duration::from_millis(record.connect_timeout_ms),
        handle_timeout: Duration::from_millis(record.handle_timeout_ms),
    })
}
