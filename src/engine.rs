//! Per-connection engine: decode loop plus encode path.
//!
//! An [`Engine`] is created once per connection and never shared between
//! connections. It owns the stage pointer and input buffer of the decoder,
//! and the streaming flag and counters of the encode path.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use stagewire::decode::{stage, Outcome};
//! use stagewire::encode::{encoder, Dispatch};
//! use stagewire::Engine;
//!
//! let byte = stage::from_fn(|input| {
//!     Ok(input.take_u8().map_or(Outcome::Incomplete, Outcome::Produce))
//! });
//! let echo = encoder::from_fn(|value: &Bytes, _ctl| Ok(Some(value.clone())));
//!
//! let mut engine = Engine::builder(byte, echo).build();
//!
//! assert_eq!(engine.decode(&[42]).unwrap(), Some(42));
//! assert!(matches!(
//!     engine.encode(Bytes::from_static(b"ok")).unwrap(),
//!     Dispatch::Encoded(_)
//! ));
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::accounting::{self, ByteCounter};
use crate::decode::{Decoder, StageRef, DEFAULT_MAX_IDLE_TRANSITIONS};
use crate::encode::{Dispatch, EncodePath, Encoder, Route, Routed, Signals, DEFAULT_STREAM_CAPACITY};
use crate::error::Result;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive transitions allowed without consuming input before the
    /// decode loop fails with `TransitionLimit`.
    pub max_idle_transitions: usize,
    /// Channel capacity of streaming sessions.
    pub stream_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_idle_transitions: DEFAULT_MAX_IDLE_TRANSITIONS,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

/// Builder for an [`Engine`].
///
/// `T` is the decoded type, `P` the outbound pipeline type and `M` the type
/// the encoder handles.
pub struct EngineBuilder<T, P, M> {
    stage: StageRef<T>,
    encoder: Arc<dyn Encoder<M>>,
    route: Route<P, M>,
    bytes_read: ByteCounter,
    bytes_written: ByteCounter,
    config: EngineConfig,
}

impl<T, M: 'static> EngineBuilder<T, M, M> {
    fn new(stage: StageRef<T>, encoder: Arc<dyn Encoder<M>>) -> Self {
        Self {
            stage,
            encoder,
            route: Arc::new(Routed::Encode),
            bytes_read: accounting::noop(),
            bytes_written: accounting::noop(),
            config: EngineConfig::default(),
        }
    }
}

impl<T, P, M> EngineBuilder<T, P, M> {
    /// Accept a mixed outbound type `Q`, encoding only what `route` selects.
    pub fn filter<Q, R>(self, route: R) -> EngineBuilder<T, Q, M>
    where
        R: Fn(Q) -> Routed<M, Q> + Send + Sync + 'static,
    {
        EngineBuilder {
            stage: self.stage,
            encoder: self.encoder,
            route: Arc::new(route),
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
            config: self.config,
        }
    }

    /// Sink for the size of every inbound chunk.
    pub fn bytes_read(mut self, counter: ByteCounter) -> Self {
        self.bytes_read = counter;
        self
    }

    /// Sink for the size of every encoded buffer.
    pub fn bytes_written(mut self, counter: ByteCounter) -> Self {
        self.bytes_written = counter;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Limit of consecutive zero-progress transitions.
    ///
    /// Default: 1024
    pub fn max_idle_transitions(mut self, limit: usize) -> Self {
        self.config.max_idle_transitions = limit;
        self
    }

    /// Channel capacity of streaming sessions.
    ///
    /// Default: 64
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.config.stream_capacity = capacity;
        self
    }
}

impl<T, P: 'static, M: Signals + 'static> EngineBuilder<T, P, M> {
    pub fn build(self) -> Engine<T, P, M> {
        let decoder = Decoder::new(self.stage)
            .with_counter(self.bytes_read)
            .with_max_idle_transitions(self.config.max_idle_transitions);

        let route = self.route;
        let encode = EncodePath::filtered(self.encoder, move |value| route(value))
            .with_counter(self.bytes_written)
            .with_stream_capacity(self.config.stream_capacity);

        Engine {
            decoder,
            encode: Arc::new(encode),
        }
    }
}

/// Decode and encode state of one connection.
pub struct Engine<T, P, M> {
    decoder: Decoder<T>,
    encode: Arc<EncodePath<P, M>>,
}

impl<T, M: 'static> Engine<T, M, M> {
    /// Start configuring an engine from its initial stage and encoder.
    pub fn builder(stage: StageRef<T>, encoder: Arc<dyn Encoder<M>>) -> EngineBuilder<T, M, M> {
        EngineBuilder::new(stage, encoder)
    }
}

impl<T, P: 'static, M: Signals + 'static> Engine<T, P, M> {
    /// Append an inbound chunk and decode at most one value.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Option<T>> {
        self.decoder.decode(chunk)
    }

    /// Encode an ordinary outbound value.
    pub fn encode(&self, value: P) -> Result<Dispatch<M, P>> {
        self.encode.encode(value)
    }

    /// Whether a streaming session is open.
    pub fn is_streaming(&self) -> bool {
        self.encode.is_streaming()
    }

    pub fn decoder(&self) -> &Decoder<T> {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut Decoder<T> {
        &mut self.decoder
    }

    pub fn encode_path(&self) -> &Arc<EncodePath<P, M>> {
        &self.encode
    }

    /// Split into the decoder and the shareable encode path.
    pub fn into_parts(self) -> (Decoder<T>, Arc<EncodePath<P, M>>) {
        (self.decoder, self.encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::ByteTally;
    use crate::decode::{stage, Outcome};
    use crate::encode::encoder;
    use bytes::Bytes;

    fn byte_stage() -> StageRef<u8> {
        stage::from_fn(|input| Ok(input.take_u8().map_or(Outcome::Incomplete, Outcome::Produce)))
    }

    fn bytes_encoder() -> Arc<dyn Encoder<Bytes>> {
        encoder::from_fn(|value: &Bytes, _ctl| Ok(Some(value.clone())))
    }

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_idle_transitions, DEFAULT_MAX_IDLE_TRANSITIONS);
        assert_eq!(config.stream_capacity, DEFAULT_STREAM_CAPACITY);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = EngineConfig {
            max_idle_transitions: 7,
            stream_capacity: 3,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let partial: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(partial, EngineConfig::default());
    }

    #[test]
    fn test_builder_wires_counters() {
        let read = ByteTally::new();
        let written = ByteTally::new();
        let mut engine = Engine::builder(byte_stage(), bytes_encoder())
            .bytes_read(read.sink())
            .bytes_written(written.sink())
            .build();

        assert_eq!(engine.decode(&[1, 2, 3]).unwrap(), Some(1));
        engine.encode(Bytes::from_static(b"four")).unwrap();

        assert_eq!(read.total(), 3);
        assert_eq!(written.total(), 4);
        assert_eq!(engine.decoder().len(), 2);
    }

    #[test]
    fn test_builder_filter() {
        let engine = Engine::builder(byte_stage(), bytes_encoder())
            .filter(|value: std::result::Result<Bytes, u32>| match value {
                Ok(bytes) => Routed::Encode(bytes),
                Err(other) => Routed::PassThrough(Err(other)),
            })
            .build();

        assert!(matches!(engine.encode(Err(9)).unwrap(), Dispatch::PassThrough(Err(9))));
        assert!(matches!(
            engine.encode(Ok(Bytes::from_static(b"x"))).unwrap(),
            Dispatch::Encoded(_)
        ));
    }

    #[test]
    fn test_builder_applies_transition_limit() {
        fn spin() -> StageRef<u8> {
            stage::from_fn(|_| Ok(Outcome::Transition(spin())))
        }
        let mut engine = Engine::builder(spin(), bytes_encoder())
            .max_idle_transitions(3)
            .build();

        assert!(engine.decode(&[]).is_err());
        assert!(engine.decoder().is_at_initial_stage());
    }
}
