//! Encode module - outbound path, streaming sessions and signal flags.
//!
//! Provides:
//! - [`Encoder`] / [`EncodePath`] - turns outbound values into bytes
//! - [`StreamSession`] - follow-up writes opened by an encoder
//! - [`SignalFlags`] / [`Signaled`] - post-write instructions such as disconnect

pub mod encoder;
mod signal;
mod streaming;

pub use encoder::{
    from_fn, Dispatch, EncodeControl, EncodePath, Encoded, Encoder, Route, Routed,
};
pub use signal::{SignalFlags, Signaled, Signals};
pub use streaming::{
    PendingStream, StreamSession, StreamingFlag, StreamingGuard, DEFAULT_STREAM_CAPACITY,
};
