//! Dedicated writer task - the write and close primitives of a connection.
//!
//! Every write on a connection, ordinary or streamed, goes through one
//! writer task fed by an mpsc channel. Commands are executed strictly in
//! the order they were queued, so a `Close` queued after a `Write` closes
//! the connection only once that write has been flushed.
//!
//! # Architecture
//!
//! ```text
//! Connection::send ───┐
//! Stream responder ───┼─► mpsc::Sender<WriteCommand> ─► Writer Task ─► AsyncWrite
//! Connection::close ──┘
//! ```
//!
//! Ready writes are batched into a single `write_vectored` call.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, StagewireError};

/// Default maximum pending commands before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum commands to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Instruction for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCommand {
    /// Put these bytes on the wire.
    Write(Bytes),
    /// Flush everything queued before, then shut the writer down.
    Close,
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending commands before backpressure kicks in.
    pub max_pending_writes: usize,
    /// Channel capacity for the command queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing commands on the writer task.
///
/// This is cheaply cloneable; the connection and every stream responder
/// hold one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteCommand>,
    /// Queued but not yet executed commands.
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<WriteCommand>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a write.
    ///
    /// Waits if backpressure is active, timing out after the configured
    /// duration.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        self.send(WriteCommand::Write(bytes)).await
    }

    /// Queue a close after every command already queued.
    ///
    /// Closing an already closed writer is a no-op.
    pub async fn close(&self) -> Result<()> {
        match self.send(WriteCommand::Close).await {
            Err(StagewireError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    async fn send(&self, command: WriteCommand) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(command).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            StagewireError::ConnectionClosed
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(StagewireError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(StagewireError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Try to queue a write without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_write(&self, bytes: Bytes) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(StagewireError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(WriteCommand::Write(bytes)).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => StagewireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => StagewireError::ConnectionClosed,
            }
        })
    }

    /// Queue a close without waiting.
    ///
    /// A writer that has already stopped counts as closed.
    pub fn try_close(&self) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        match self.tx.try_send(WriteCommand::Close) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::Release);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(StagewireError::BackpressureTimeout),
                    mpsc::error::TrySendError::Closed(_) => Ok(()),
                }
            }
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending command count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the writer task has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Spawn the writer task and return a handle for queueing commands.
///
/// The `JoinHandle` resolves when the writer is closed, all handles are
/// dropped, or an I/O error occurs.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_writes,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Main writer loop - receives commands and executes them in order.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<WriteCommand>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(command) => command,
            None => {
                // Every handle dropped
                writer.shutdown().await?;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut close = matches!(first, WriteCommand::Close);
        let mut taken = 1;
        if let WriteCommand::Write(bytes) = first {
            batch.push(bytes);
        }

        // Collect additional ready writes, never past a Close
        while !close && taken < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriteCommand::Write(bytes)) => batch.push(bytes),
                Ok(WriteCommand::Close) => close = true,
                Err(_) => break,
            }
            taken += 1;
        }

        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(taken, Ordering::Release);
        result?;

        if close {
            tracing::debug!("Writer closing after {} queued bytes", batch_len(&batch));
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

fn batch_len(batch: &[Bytes]) -> usize {
    batch.iter().map(Bytes::len).sum()
}

/// Write a batch of buffers using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size = batch_len(batch);
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(StagewireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut start = 0;

    for bytes in batch {
        let end = start + bytes.len();
        if !bytes.is_empty() && skip_bytes < end {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&bytes[offset..]));
        }
        start = end;
    }

    slices
}
