//! Frame encoding and the header/body reader and writer.
//!
//! A frame is one header segment followed by one body segment:
//!
//! ```text
//! ┌────────────┬──────────────┬────────────┬──────────────┐
//! │ Header len │ Header bytes │ Body len   │ Body bytes   │
//! │ uint32 BE  │ (codec)      │ uint32 BE  │ (codec)      │
//! └────────────┴──────────────┴────────────┴──────────────┘
//! ```
//!
//! Both segments are encoded with the codec negotiated in the handshake.
//! Reading is split into [`FrameReader::read_header`] and
//! [`FrameReader::read_body`] so a reader can decide, after looking at the
//! header, to skip the body with [`FrameReader::discard_body`].

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Header;
use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Size of a segment length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum size of a single header or body segment (64 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// A frame ready to be written: both segments already length-prefixed.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Length-prefixed, encoded header.
    pub header: Bytes,
    /// Length-prefixed, encoded body.
    pub body: Bytes,
}

impl OutboundFrame {
    /// Encode a header and a serializable body.
    pub fn encode<T: serde::Serialize>(codec: CodecType, header: &Header, body: &T) -> Result<Self> {
        let body = codec.encode(body)?;
        Self::from_encoded_body(codec, header, &body)
    }

    /// Encode a header around a body that is already encoded with `codec`.
    pub fn from_encoded_body(codec: CodecType, header: &Header, body: &[u8]) -> Result<Self> {
        let header = codec.encode(header)?;
        Ok(Self {
            header: segment(&header)?,
            body: segment(body)?,
        })
    }

    /// Error response carrying the "invalid body" sentinel.
    pub fn error(codec: CodecType, header: &Header) -> Result<Self> {
        Self::encode(codec, header, &())
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }

    /// Concatenate both segments (mainly for tests and captures).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Prefix `data` with its length.
fn segment(data: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(data.len()).map_err(|_| RpcError::FrameTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + data.len());
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Reads frames from one direction of a connection.
pub struct FrameReader<R> {
    reader: R,
    codec: CodecType,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default segment limit.
    pub fn new(reader: R, codec: CodecType) -> Self {
        Self::with_max_frame_size(reader, codec, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a reader with a custom segment limit.
    pub fn with_max_frame_size(reader: R, codec: CodecType, max_frame_size: u32) -> Self {
        Self {
            reader,
            codec,
            max_frame_size,
        }
    }

    /// Codec used to decode headers and bodies.
    #[inline]
    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Read the next header.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// frames. A stream that ends anywhere else is a protocol error.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = self.reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(RpcError::Protocol(
                    "stream truncated inside header length".to_string(),
                ));
            }
            filled += n;
        }

        let len = self.check_len(u32::from_be_bytes(prefix))?;
        let data = self.read_exact(len, "header").await?;
        let header = self.codec.decode(&data)?;
        Ok(Some(header))
    }

    /// Read the raw (still encoded) body that follows a header.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        let len = self.read_len("body").await?;
        let data = self.read_exact(len, "body").await?;
        Ok(Bytes::from(data))
    }

    /// Read the body and decode it as `T`.
    pub async fn read_body_as<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.read_body().await?;
        self.codec.decode(&body)
    }

    /// Skip the body that follows a header without interpreting it.
    pub async fn discard_body(&mut self) -> Result<()> {
        let len = self.read_len("body").await? as u64;
        let skipped = tokio::io::copy(&mut (&mut self.reader).take(len), &mut tokio::io::sink()).await?;
        if skipped != len {
            return Err(RpcError::Protocol(format!(
                "stream truncated inside body ({} of {} bytes)",
                skipped, len
            )));
        }
        Ok(())
    }

    async fn read_len(&mut self, what: &str) -> Result<u32> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.reader
            .read_exact(&mut prefix)
            .await
            .map_err(|e| truncated(e, what))?;
        self.check_len(u32::from_be_bytes(prefix))
    }

    async fn read_exact(&mut self, len: u32, what: &str) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut data)
            .await
            .map_err(|e| truncated(e, what))?;
        Ok(data)
    }

    fn check_len(&self, len: u32) -> Result<u32> {
        if len > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(len)
    }
}

fn truncated(e: std::io::Error, what: &str) -> RpcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::Protocol(format!("stream truncated inside {}", what))
    } else {
        RpcError::Io(e)
    }
}

/// Writes whole frames to one direction of a connection.
///
/// Not synchronized: callers sharing a writer hold it behind a lock or feed
/// it from a single task.
pub struct FrameWriter<W> {
    writer: W,
    codec: CodecType,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a frame writer.
    pub fn new(writer: W, codec: CodecType) -> Self {
        Self { writer, codec }
    }

    /// Codec used to encode headers and bodies.
    #[inline]
    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Encode and write one frame, flushing before returning.
    ///
    /// A failed write leaves the stream in an unknown state; the connection
    /// must be closed.
    pub async fn write<T: serde::Serialize>(&mut self, header: &Header, body: &T) -> Result<()> {
        let frame = OutboundFrame::encode(self.codec, header, body)?;
        self.write_frame(&frame).await
    }

    /// Write one pre-encoded frame, flushing before returning.
    pub async fn write_frame(&mut self, frame: &OutboundFrame) -> Result<()> {
        self.writer.write_all(&frame.header).await?;
        self.writer.write_all(&frame.body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
