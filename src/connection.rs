//! Connection driver - runs an [`Engine`] over a tokio byte stream.
//!
//! The [`ConnectionBuilder`] wraps an engine and transport settings; the
//! [`Connection`] manages the lifecycle:
//! 1. Split the stream into read and write halves
//! 2. Spawn the writer task on the write half
//! 3. Spawn the read loop: append received bytes, decode, deliver values
//! 4. Encode outbound values on `send`, starting stream responders as needed
//!
//! A decode or I/O error ends the read loop and closes the connection. A
//! clean end of input only stops the read side: the peer may have
//! half-closed and still expect answers. A streamed value that breaks the
//! streaming contract closes the connection and is returned from
//! [`Connection::wait_for_shutdown`].
//!
//! Dropping a [`Connection`] without waiting for shutdown stops the read
//! loop and closes the writer after the writes already queued.
//!
//! # Example
//!
//! ```ignore
//! use stagewire::{Connection, Engine};
//!
//! let engine = Engine::builder(my_stage(), my_encoder()).build();
//! let mut conn = Connection::builder(engine).start(tcp_stream);
//!
//! while let Some(request) = conn.recv().await {
//!     conn.send(handle(request)).await?;
//! }
//! conn.wait_for_shutdown().await?;
//! ```

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::decode::Decoder;
use crate::encode::{Dispatch, EncodePath, Encoded, PendingStream, Signals};
use crate::engine::Engine;
use crate::error::{ErrorSlot, Result, StagewireError};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default capacity of the decoded-value channel.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Default size of a single socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and starting a [`Connection`].
pub struct ConnectionBuilder<T, P, M> {
    engine: Engine<T, P, M>,
    writer_config: WriterConfig,
    inbound_capacity: usize,
    read_buffer_size: usize,
}

impl<T, P, M> ConnectionBuilder<T, P, M>
where
    T: Send + 'static,
    P: Send + 'static,
    M: Signals + Send + 'static,
{
    pub fn new(engine: Engine<T, P, M>) -> Self {
        Self {
            engine,
            writer_config: WriterConfig::default(),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Set the maximum pending writes for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_writes(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_writes = limit;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Number of decoded values buffered before the read loop waits for
    /// `recv`.
    ///
    /// Default: 256
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// Size of a single read from the stream.
    ///
    /// Default: 64KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Start driving `io`. Must be called within a tokio runtime.
    pub fn start<IO>(self, io: IO) -> Connection<T, P, M>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(write_half, self.writer_config);

        let (decoder, encode) = self.engine.into_parts();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity.max(1));

        let read_task = tokio::spawn(read_loop(
            reader,
            decoder,
            inbound_tx,
            writer.clone(),
            self.read_buffer_size.max(1),
        ));
        let close_on_drop = CloseOnDrop {
            writer: Some(writer.clone()),
            read_task: read_task.abort_handle(),
        };

        Connection {
            encode,
            writer,
            inbound: inbound_rx,
            read_task,
            writer_task,
            failure: ErrorSlot::default(),
            close_on_drop,
        }
    }
}

/// A running connection.
pub struct Connection<T, P, M> {
    encode: Arc<EncodePath<P, M>>,
    writer: WriterHandle,
    inbound: mpsc::Receiver<T>,
    read_task: JoinHandle<Result<()>>,
    writer_task: JoinHandle<Result<()>>,
    /// First fatal error raised by a stream responder.
    failure: ErrorSlot,
    close_on_drop: CloseOnDrop,
}

/// Stops both tasks when a `Connection` goes away without
/// `wait_for_shutdown`.
struct CloseOnDrop {
    writer: Option<WriterHandle>,
    read_task: AbortHandle,
}

impl CloseOnDrop {
    fn disarm(mut self) {
        self.writer = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        self.read_task.abort();
        if let Err(e) = writer.try_close() {
            tracing::debug!("Close on drop not queued: {}", e);
        }
    }
}

impl<T, M> Connection<T, M, M>
where
    T: Send + 'static,
    M: Signals + Send + 'static,
{
    pub fn builder(engine: Engine<T, M, M>) -> ConnectionBuilder<T, M, M> {
        ConnectionBuilder::new(engine)
    }
}

impl<T, P, M> Connection<T, P, M>
where
    T: Send + 'static,
    P: Send + 'static,
    M: Signals + Send + 'static,
{
    /// Next decoded value, `None` once the read side has stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.inbound.recv().await
    }

    /// Encode and write an outbound value.
    ///
    /// Returns `Ok(Some(value))` unchanged when the engine's route passes it
    /// through, so the caller can hand it to the next layer.
    ///
    /// # Errors
    ///
    /// `WriteWhileStreaming` if a stream session is open; encoder errors;
    /// `ConnectionClosed` once the writer has stopped.
    pub async fn send(&self, value: P) -> Result<Option<P>> {
        match self.encode.encode(value)? {
            Dispatch::PassThrough(value) => Ok(Some(value)),
            Dispatch::Encoded(encoded) => {
                let stream = write_encoded(&self.writer, encoded).await?;
                if let Some(stream) = stream {
                    tokio::spawn(stream_responder(
                        self.encode.clone(),
                        self.writer.clone(),
                        stream,
                        self.failure.clone(),
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Close after every queued write has been flushed.
    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }

    /// Whether a streaming session is open.
    pub fn is_streaming(&self) -> bool {
        self.encode.is_streaming()
    }

    /// Whether the writer has stopped.
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Get the current pending write count.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending_count()
    }

    /// Wait until both halves have stopped, returning the first error.
    ///
    /// A streaming contract violation takes precedence over errors of the
    /// read and write halves. Drops the inbound channel first so a read
    /// loop blocked on delivering values can finish; the writer stops once
    /// it is closed or every handle is gone.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let Connection {
            writer,
            inbound,
            read_task,
            writer_task,
            failure,
            close_on_drop,
            ..
        } = self;
        close_on_drop.disarm();
        drop(inbound);

        let read = read_task.await.map_err(StagewireError::evaluation)?;
        drop(writer);
        let write = writer_task.await.map_err(StagewireError::evaluation)?;

        if let Some(e) = failure.take() {
            return Err(e);
        }
        read.and(write)
    }
}

/// Queue the encoded bytes and apply their signals.
///
/// Returns the stream the encoder opened, if any; it must only be started
/// after this returns so its writes follow the initiating one.
async fn write_encoded<M>(
    writer: &WriterHandle,
    encoded: Encoded<M>,
) -> Result<Option<PendingStream<M>>> {
    let Encoded {
        bytes,
        flags,
        stream,
    } = encoded;

    if let Some(bytes) = bytes {
        writer.write(bytes).await?;
    }
    if flags.disconnect() {
        tracing::debug!("Disconnect requested, closing after write");
        writer.close().await?;
    }
    Ok(stream)
}

/// Encode and write every value pushed through a streaming session.
///
/// Ends when the session closes, an encode or write fails, or the
/// connection goes away. The streaming flag is released in every case.
/// An encode error is handed to the session's producer; a fatal one also
/// closes the connection and is kept in `failure`.
async fn stream_responder<P, M>(
    encode: Arc<EncodePath<P, M>>,
    writer: WriterHandle,
    stream: PendingStream<M>,
    failure: ErrorSlot,
) where
    P: 'static,
    M: Signals + 'static,
{
    let PendingStream {
        mut rx,
        guard: _guard,
        failure: session_failure,
    } = stream;

    loop {
        let value = tokio::select! {
            value = rx.recv() => match value {
                Some(value) => value,
                None => break,
            },
            _ = writer.closed() => {
                tracing::debug!("Connection closed with an open stream session");
                break;
            }
        };

        let encoded = match encode.encode_streamed(&value) {
            Ok(encoded) => encoded,
            Err(e) => {
                if let Some(fatal) = e.fatal_copy() {
                    tracing::error!("Streaming contract violated, closing connection: {}", e);
                    failure.record(fatal);
                    if let Err(close_err) = writer.close().await {
                        tracing::warn!("Close after stream failure failed: {}", close_err);
                    }
                } else {
                    tracing::warn!("Stream encode error: {}", e);
                }
                session_failure.record(e);
                break;
            }
        };
        if let Err(e) = write_encoded(&writer, encoded).await {
            tracing::warn!("Stream write failed: {}", e);
            break;
        }
    }
}

/// Main read loop - reads chunks, decodes values and delivers them.
async fn read_loop<R, T>(
    mut reader: R,
    mut decoder: Decoder<T>,
    inbound: mpsc::Sender<T>,
    writer: WriterHandle,
    read_buffer_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_buffer_size];

    let result = loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(StagewireError::Io(e)),
            },
            _ = writer.closed() => break Ok(()),
        };

        match deliver(&mut decoder, &buf[..n], &inbound).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match &result {
        Ok(()) => tracing::debug!("Read side finished"),
        Err(e) => {
            tracing::error!("Read loop error: {}", e);
            writer.close().await?;
        }
    }
    result
}

/// Decode every value completed by `chunk` and hand it to the application.
///
/// Returns `Ok(false)` once the application has dropped its receiver.
async fn deliver<T>(
    decoder: &mut Decoder<T>,
    chunk: &[u8],
    inbound: &mpsc::Sender<T>,
) -> Result<bool> {
    let mut next = decoder.decode(chunk)?;
    while let Some(value) = next {
        if inbound.send(value).await.is_err() {
            return Ok(false);
        }
        next = decoder.decode(&[])?;
    }
    Ok(true)
}
