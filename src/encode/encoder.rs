//! Encode path - outbound filter, encoder invocation and byte accounting.
//!
//! An [`EncodePath`] turns pipeline values of type `P` into wire bytes:
//!
//! 1. The route chosen at construction decides whether the value is one the
//!    engine handles (`Routed::Encode`) or must be forwarded untouched
//!    (`Routed::PassThrough`). Pass-through values never reach the encoder.
//! 2. Ordinary writes are refused while a streaming session is open.
//! 3. The [`Encoder`] yields zero or one buffer and may open a stream.
//! 4. The produced size goes to the bytes-written sink.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use stagewire::encode::{encoder, Dispatch, EncodePath};
//!
//! let path = EncodePath::new(encoder::from_fn(|value: &String, _ctl| {
//!     Ok(Some(Bytes::copy_from_slice(value.as_bytes())))
//! }));
//!
//! match path.encode("hi".to_string()).unwrap() {
//!     Dispatch::Encoded(encoded) => assert_eq!(encoded.len(), 2),
//!     Dispatch::PassThrough(_) => unreachable!(),
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::signal::{SignalFlags, Signals};
use super::streaming::{self, PendingStream, StreamSession, StreamingFlag, DEFAULT_STREAM_CAPACITY};
use crate::accounting::{self, ByteCounter};
use crate::error::{Result, StagewireError};

/// Converts outbound values of type `M` into wire bytes.
pub trait Encoder<M>: Send + Sync {
    /// Encode `value`.
    ///
    /// `Ok(None)` suppresses the write. `ctl` lets the encoder open a
    /// streaming session for follow-up values.
    fn encode(&self, value: &M, ctl: &mut EncodeControl<'_, M>) -> Result<Option<Bytes>>;
}

/// Encoder backed by a closure.
pub struct FnEncoder<F>(F);

impl<M, F> Encoder<M> for FnEncoder<F>
where
    F: Fn(&M, &mut EncodeControl<'_, M>) -> Result<Option<Bytes>> + Send + Sync,
{
    #[inline]
    fn encode(&self, value: &M, ctl: &mut EncodeControl<'_, M>) -> Result<Option<Bytes>> {
        (self.0)(value, ctl)
    }
}

/// Build a shared encoder from a closure.
pub fn from_fn<M, F>(f: F) -> Arc<dyn Encoder<M>>
where
    M: 'static,
    F: Fn(&M, &mut EncodeControl<'_, M>) -> Result<Option<Bytes>> + Send + Sync + 'static,
{
    Arc::new(FnEncoder(f))
}

/// Control handle given to the encoder for one invocation.
pub struct EncodeControl<'a, M> {
    flag: &'a StreamingFlag,
    capacity: usize,
    pending: Option<PendingStream<M>>,
}

impl<'a, M> EncodeControl<'a, M> {
    fn new(flag: &'a StreamingFlag, capacity: usize) -> Self {
        Self {
            flag,
            capacity,
            pending: None,
        }
    }

    /// Open a streaming session.
    ///
    /// Values sent through the returned session are encoded with the same
    /// encoder and written after the buffer returned by the current call.
    ///
    /// # Errors
    ///
    /// `StreamingAlreadyActive` if a session is already open on this engine.
    /// The failed call has no side effects.
    pub fn start_streaming(&mut self) -> Result<StreamSession<M>> {
        if self.pending.is_some() {
            return Err(StagewireError::StreamingAlreadyActive);
        }
        let (session, pending) = streaming::open(self.flag, self.capacity)?;
        self.pending = Some(pending);
        Ok(session)
    }

    /// Whether this engine currently has an open session.
    pub fn is_streaming(&self) -> bool {
        self.flag.is_active()
    }
}

/// Routing decision for a pipeline value.
#[derive(Debug)]
pub enum Routed<M, P> {
    /// Handled by this engine.
    Encode(M),
    /// Not ours - forward unchanged.
    PassThrough(P),
}

/// Route function, fixed when the encode path is built.
pub type Route<P, M> = Arc<dyn Fn(P) -> Routed<M, P> + Send + Sync>;

/// Output of a handled value.
#[derive(Debug)]
pub struct Encoded<M> {
    /// Bytes to write, `None` if the encoder suppressed the write.
    pub bytes: Option<Bytes>,
    /// Signals of the encoded value.
    pub flags: SignalFlags,
    /// Stream opened by the encoder, to be started after `bytes` are queued.
    pub stream: Option<PendingStream<M>>,
}

impl<M> Encoded<M> {
    /// Produced size, 0 when suppressed.
    pub fn len(&self) -> usize {
        self.bytes.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of [`EncodePath::encode`].
#[derive(Debug)]
pub enum Dispatch<M, P> {
    Encoded(Encoded<M>),
    PassThrough(P),
}

/// Outbound half of an engine.
pub struct EncodePath<P, M> {
    encoder: Arc<dyn Encoder<M>>,
    route: Route<P, M>,
    streaming: StreamingFlag,
    bytes_written: ByteCounter,
    stream_capacity: usize,
}

impl<M: Signals + 'static> EncodePath<M, M> {
    /// Encode path handling every value it receives.
    pub fn new(encoder: Arc<dyn Encoder<M>>) -> Self {
        Self::filtered(encoder, Routed::Encode)
    }
}

impl<P: 'static, M: Signals + 'static> EncodePath<P, M> {
    /// Encode path for a pipeline carrying mixed values: only values that
    /// `route` maps to `Routed::Encode` are encoded.
    pub fn filtered<R>(encoder: Arc<dyn Encoder<M>>, route: R) -> Self
    where
        R: Fn(P) -> Routed<M, P> + Send + Sync + 'static,
    {
        Self {
            encoder,
            route: Arc::new(route),
            streaming: StreamingFlag::new(),
            bytes_written: accounting::noop(),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }

    /// Set the bytes-written sink.
    pub fn with_counter(mut self, bytes_written: ByteCounter) -> Self {
        self.bytes_written = bytes_written;
        self
    }

    /// Set the channel capacity of streaming sessions.
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Whether a streaming session is open.
    #[inline]
    pub fn is_streaming(&self) -> bool {
        self.streaming.is_active()
    }

    /// Shared handle to the streaming flag.
    pub fn streaming_flag(&self) -> StreamingFlag {
        self.streaming.clone()
    }

    /// Encode an ordinary outbound value.
    ///
    /// # Errors
    ///
    /// `WriteWhileStreaming` if a session is open (the encoder is not
    /// invoked), or whatever the encoder returns.
    pub fn encode(&self, value: P) -> Result<Dispatch<M, P>> {
        let value = match (self.route)(value) {
            Routed::Encode(value) => value,
            Routed::PassThrough(other) => return Ok(Dispatch::PassThrough(other)),
        };

        if self.streaming.is_active() {
            tracing::error!("Ordinary write attempted while a streaming session is open");
            return Err(StagewireError::WriteWhileStreaming);
        }

        self.encode_value(&value).map(Dispatch::Encoded)
    }

    /// Encode a value pushed through the open streaming session.
    pub fn encode_streamed(&self, value: &M) -> Result<Encoded<M>> {
        self.encode_value(value)
    }

    fn encode_value(&self, value: &M) -> Result<Encoded<M>> {
        let mut ctl = EncodeControl::new(&self.streaming, self.stream_capacity);
        let result = self.encoder.encode(value, &mut ctl);

        let produced = match &result {
            Ok(Some(bytes)) => bytes.len(),
            _ => 0,
        };
        (self.bytes_written)(produced);

        Ok(Encoded {
            bytes: result?,
            flags: value.signal_flags(),
            stream: ctl.pending,
        })
    }
}
