//! # stagewire
//!
//! Incremental decode/encode engine for byte-oriented connections.
//!
//! Application protocols are written as pluggable parsing stages instead of
//! hand-rolled buffering logic; the engine takes care of fragmentation,
//! state resets, outbound encoding, streaming follow-up writes and
//! post-write signals.
//!
//! ## Architecture
//!
//! - **Decode** ([`decode`]): a [`Decoder`] evaluates [`Stage`]s against
//!   buffered input until one produces a value. Partial input survives
//!   between reads; errors reset the stage pointer.
//! - **Encode** ([`encode`]): an [`EncodePath`] filters outbound values,
//!   runs the [`Encoder`], tracks the single open [`StreamSession`] and
//!   carries [`SignalFlags`].
//! - **Driver** ([`Connection`]): tokio read loop and writer task wiring an
//!   [`Engine`] to an `AsyncRead + AsyncWrite` stream.
//!
//! ## Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use stagewire::decode::{stage, Outcome};
//! use stagewire::encode::encoder;
//! use stagewire::{Connection, Engine};
//!
//! #[tokio::main]
//! async fn main() -> stagewire::Result<()> {
//!     let frame = stage::from_fn(|input| {
//!         let Some(len) = input.take_u32() else {
//!             return Ok(Outcome::Incomplete);
//!         };
//!         Ok(Outcome::transition(move |input| {
//!             Ok(input.take(len as usize).map_or(Outcome::Incomplete, Outcome::Produce))
//!         }))
//!     });
//!     let echo = encoder::from_fn(|payload: &Bytes, _ctl| Ok(Some(payload.clone())));
//!
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//!     let mut conn = Connection::builder(Engine::builder(frame, echo).build()).start(stream);
//!
//!     while let Some(payload) = conn.recv().await {
//!         conn.send(payload).await?;
//!     }
//!     conn.wait_for_shutdown().await
//! }
//! ```

pub mod accounting;
pub mod decode;
pub mod encode;
pub mod error;
pub mod writer;

mod connection;
mod engine;

pub use connection::{
    Connection, ConnectionBuilder, DEFAULT_INBOUND_CAPACITY, DEFAULT_READ_BUFFER_SIZE,
};
pub use decode::{Decoder, Outcome, Stage, StageRef};
pub use encode::{EncodePath, Encoder, SignalFlags, Signaled, Signals, StreamSession};
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{Result, StagewireError};
