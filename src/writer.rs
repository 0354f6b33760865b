//! Dedicated writer task for the server side of a connection.
//!
//! Every handling unit of a connection sends its single response frame
//! through an mpsc channel to one writer task, which is the only code that
//! touches the write half. Frames are therefore never interleaved on the
//! wire, whatever order the handlers finish in.
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► write half
//! Handler N ─┘
//! ```
//!
//! Ready frames are batched into one vectored write. A failed write ends the
//! task; later sends fail with [`RpcError::ConnectionClosed`].

use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::protocol::OutboundFrame;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued ahead of the writer before senders wait.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; one clone per handling unit.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame for the writer task.
    ///
    /// Waits while the queue is full; a slow peer slows the handlers down
    /// but never loses a frame. Fails only once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| RpcError::ConnectionClosed)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped (after flushing and shutting
/// down the write half) or on the first write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            // Fail queued and future senders instead of letting them wait.
            rx.close();
            return Err(e);
        }
    }

    writer.shutdown().await?;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header, &frame.body] {
            let end = offset + part.len();
            if skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
