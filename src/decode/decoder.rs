//! Decode loop - drives stage evaluation over accumulated input.
//!
//! The decoder owns the connection's input buffer. Each call to
//! [`Decoder::decode`] appends a newly received chunk and then evaluates
//! the current stage repeatedly:
//!
//! - `Incomplete`: return `None`, keep the stage pointer and the unread tail
//! - `Transition(next)`: switch to `next` and evaluate again (iteratively)
//! - `Produce(value)`: reset to the initial stage and return the value
//!
//! An evaluation error resets the stage pointer before it propagates, so a
//! connection is never left stuck mid-parse.
//!
//! Stage graphs that never consume input are cut off: more than
//! `max_idle_transitions` consecutive transitions within one call, or as
//! many consecutive values produced without consuming a byte, fail with
//! `TransitionLimit`. The second rule keeps drain loops such as
//! [`Decoder::decode_all`] from spinning forever.
//!
//! # Example
//!
//! ```
//! use stagewire::decode::{stage, Decoder, Outcome};
//!
//! let line = stage::from_fn(|input| {
//!     Ok(match input.position_of(b'\n') {
//!         Some(end) => {
//!             let line = input.take(end).unwrap();
//!             input.skip(1);
//!             Outcome::Produce(line)
//!         }
//!         None => Outcome::Incomplete,
//!     })
//! });
//!
//! let mut decoder = Decoder::new(line);
//! assert!(decoder.decode(b"hel").unwrap().is_none());
//! assert_eq!(&decoder.decode(b"lo\n").unwrap().unwrap()[..], b"hello");
//! ```

use bytes::BytesMut;

use super::{Cursor, Outcome, StageRef};
use crate::accounting::{self, ByteCounter};
use crate::error::{Result, StagewireError};

/// Default initial capacity of the input buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default limit of consecutive transitions that consume no input.
pub const DEFAULT_MAX_IDLE_TRANSITIONS: usize = 1024;

/// Incremental decoder over a stage graph.
pub struct Decoder<T> {
    /// Accumulated unread bytes.
    buffer: BytesMut,
    /// Stage every protocol unit starts from.
    initial: StageRef<T>,
    /// Stage to evaluate next.
    current: StageRef<T>,
    /// Receives the input size of every `decode` call.
    bytes_read: ByteCounter,
    max_idle_transitions: usize,
    /// Values produced in a row without consuming input.
    idle_produces: usize,
}

impl<T> Decoder<T> {
    /// Create a decoder starting at `initial` with default settings.
    pub fn new(initial: StageRef<T>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            current: initial.clone(),
            initial,
            bytes_read: accounting::noop(),
            max_idle_transitions: DEFAULT_MAX_IDLE_TRANSITIONS,
            idle_produces: 0,
        }
    }

    /// Set the bytes-read sink.
    pub fn with_counter(mut self, bytes_read: ByteCounter) -> Self {
        self.bytes_read = bytes_read;
        self
    }

    /// Set the limit of consecutive zero-progress transitions.
    pub fn with_max_idle_transitions(mut self, limit: usize) -> Self {
        self.max_idle_transitions = limit;
        self
    }

    /// Append `chunk` to the input buffer and try to decode one value.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Only one value is
    /// returned per call; call again with an empty chunk to drain values
    /// that are already buffered, or use [`decode_all`](Self::decode_all).
    ///
    /// The bytes-read sink receives `chunk.len()` exactly once per call,
    /// whatever the outcome. A drain call with an empty chunk therefore
    /// reports 0 even when it completes an already buffered value.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Option<T>> {
        self.buffer.extend_from_slice(chunk);
        (self.bytes_read)(chunk.len());

        let result = self.run();
        if let Err(ref e) = result {
            tracing::debug!("Decode failed, resetting to initial stage: {}", e);
            self.reset();
        }
        result
    }

    /// Append `chunk` and extract every value that can be completed.
    ///
    /// Stops at the first error; values decoded before it are lost with it.
    pub fn decode_all(&mut self, chunk: &[u8]) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let mut next = self.decode(chunk)?;
        while let Some(value) = next {
            values.push(value);
            next = self.decode(&[])?;
        }
        Ok(values)
    }

    /// Evaluate stages until a value is produced or input runs out.
    fn run(&mut self) -> Result<Option<T>> {
        let mut idle_transitions = 0usize;
        let mut progressed = 0usize;

        loop {
            let mut cursor = Cursor::new(&mut self.buffer);
            let outcome = match self.current.evaluate(&mut cursor) {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Bytes the failing stage read are dropped with it.
                    cursor.commit();
                    return Err(e);
                }
            };
            tracing::trace!(outcome = outcome.kind(), read = cursor.consumed(), "stage evaluated");

            match outcome {
                Outcome::Incomplete => return Ok(None),
                Outcome::Transition(next) => {
                    let n = cursor.commit();
                    progressed += n;
                    if n == 0 {
                        idle_transitions += 1;
                        if idle_transitions > self.max_idle_transitions {
                            return Err(StagewireError::TransitionLimit {
                                limit: self.max_idle_transitions,
                            });
                        }
                    } else {
                        idle_transitions = 0;
                    }
                    self.current = next;
                }
                Outcome::Produce(value) => {
                    progressed += cursor.commit();
                    if progressed == 0 {
                        self.idle_produces += 1;
                        if self.idle_produces > self.max_idle_transitions {
                            return Err(StagewireError::TransitionLimit {
                                limit: self.max_idle_transitions,
                            });
                        }
                    } else {
                        self.idle_produces = 0;
                    }
                    self.current = self.initial.clone();
                    return Ok(Some(value));
                }
            }
        }
    }

    /// Return to the initial stage. Buffered bytes are kept.
    pub fn reset(&mut self) {
        self.current = self.initial.clone();
        self.idle_produces = 0;
    }

    /// Drop buffered bytes and return to the initial stage.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.reset();
    }

    /// Whether the next evaluation starts a fresh protocol unit.
    pub fn is_at_initial_stage(&self) -> bool {
        std::sync::Arc::ptr_eq(&self.current, &self.initial)
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::ByteTally;
    use crate::decode::stage;
    use bytes::Bytes;

    /// 4-byte big-endian length followed by that many bytes.
    fn length_prefixed() -> StageRef<Bytes> {
        stage::from_fn(|input| {
            let Some(len) = input.take_u32() else {
                return Ok(Outcome::Incomplete);
            };
            Ok(Outcome::transition(move |input| {
                Ok(match input.take(len as usize) {
                    Some(payload) => Outcome::Produce(payload),
                    None => Outcome::Incomplete,
                })
            }))
        })
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_single_complete_unit() {
        let mut decoder = Decoder::new(length_prefixed());

        let value = decoder.decode(&frame(b"hello")).unwrap();

        assert_eq!(value.as_deref(), Some(&b"hello"[..]));
        assert!(decoder.is_empty());
        assert!(decoder.is_at_initial_stage());
    }

    #[test]
    fn test_fragmented_header_keeps_stage() {
        let mut decoder = Decoder::new(length_prefixed());
        let bytes = frame(b"abc");

        assert!(decoder.decode(&bytes[..2]).unwrap().is_none());
        assert!(decoder.is_at_initial_stage());
        assert_eq!(decoder.len(), 2);

        assert!(decoder.decode(&bytes[2..5]).unwrap().is_none());
        assert!(!decoder.is_at_initial_stage());
        assert_eq!(decoder.len(), 1);

        let value = decoder.decode(&bytes[5..]).unwrap();
        assert_eq!(value.as_deref(), Some(&b"abc"[..]));
        assert!(decoder.is_at_initial_stage());
    }

    #[test]
    fn test_one_value_per_call() {
        let mut decoder = Decoder::new(length_prefixed());
        let mut bytes = frame(b"first");
        bytes.extend(frame(b"second"));

        let first = decoder.decode(&bytes).unwrap();
        assert_eq!(first.as_deref(), Some(&b"first"[..]));
        assert_eq!(decoder.len(), 4 + 6);

        let second = decoder.decode(&[]).unwrap();
        assert_eq!(second.as_deref(), Some(&b"second"[..]));
        assert!(decoder.decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_decode_all_drains_buffered_units() {
        let mut decoder = Decoder::new(length_prefixed());
        let mut bytes = frame(b"a");
        bytes.extend(frame(b"bb"));
        bytes.extend(frame(b"ccc"));
        bytes.extend_from_slice(&[0, 0]);

        let values = decoder.decode_all(&bytes).unwrap();

        assert_eq!(values.len(), 3);
        assert_eq!(&values[2][..], b"ccc");
        assert_eq!(decoder.len(), 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = Decoder::new(length_prefixed());
        let bytes = frame(b"hi");

        let mut values = Vec::new();
        for byte in &bytes {
            values.extend(decoder.decode(&[*byte]).unwrap());
        }

        assert_eq!(values.len(), 1);
        assert_eq!(&values[0][..], b"hi");
    }

    #[test]
    fn test_empty_payload_unit() {
        let mut decoder = Decoder::new(length_prefixed());

        let value = decoder.decode(&frame(b"")).unwrap();

        assert_eq!(value.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn test_counter_reports_chunk_sizes() {
        let tally = ByteTally::new();
        let mut decoder = Decoder::new(length_prefixed()).with_counter(tally.sink());

        decoder.decode(&[0x00, 0x00]).unwrap();
        assert_eq!(tally.total(), 2);
        decoder.decode(&[0x00, 0x03, b'a', b'b']).unwrap();
        assert_eq!(tally.total(), 6);
        decoder.decode(&[b'c']).unwrap();

        assert_eq!(tally.total(), 7);
        assert_eq!(tally.calls(), 3);
    }

    #[test]
    fn test_error_resets_to_initial_stage() {
        let tally = ByteTally::new();
        let strict = stage::from_fn(|input| {
            let Some(tag) = input.take_u8() else {
                return Ok(Outcome::Incomplete);
            };
            if tag != b'#' {
                return Err(StagewireError::protocol(format!("unexpected tag {:#04x}", tag)));
            }
            Ok(Outcome::transition(|input| {
                Ok(match input.take_u8() {
                    Some(0xFF) => return Err(StagewireError::protocol("reserved value")),
                    Some(v) => Outcome::Produce(v),
                    None => Outcome::Incomplete,
                })
            }))
        });
        let mut decoder = Decoder::new(strict).with_counter(tally.sink());

        assert!(decoder.decode(b"#").unwrap().is_none());
        assert!(!decoder.is_at_initial_stage());

        let err = decoder.decode(&[0xFF]).unwrap_err();
        assert!(err.to_string().contains("reserved value"));
        assert!(decoder.is_at_initial_stage());
        assert!(decoder.is_empty());
        assert_eq!(tally.calls(), 2);

        // Starts over from the tag stage, not the value stage.
        assert_eq!(decoder.decode(b"#\x07").unwrap(), Some(7));
    }

    #[test]
    fn test_zero_byte_transition_chain_is_iterative() {
        fn countdown(n: u32) -> StageRef<u32> {
            stage::from_fn(move |_| {
                Ok(if n == 0 {
                    Outcome::Produce(0)
                } else {
                    Outcome::Transition(countdown(n - 1))
                })
            })
        }

        let mut decoder = Decoder::new(countdown(100_000)).with_max_idle_transitions(usize::MAX);

        assert_eq!(decoder.decode(&[]).unwrap(), Some(0));
    }

    #[test]
    fn test_idle_transition_limit() {
        fn spin() -> StageRef<()> {
            stage::from_fn(|_| Ok(Outcome::Transition(spin())))
        }

        let mut decoder = Decoder::new(spin()).with_max_idle_transitions(16);

        let err = decoder.decode(b"x").unwrap_err();
        assert!(matches!(err, StagewireError::TransitionLimit { limit: 16 }));
        assert!(decoder.is_at_initial_stage());
        assert_eq!(decoder.len(), 1);
    }

    #[test]
    fn test_incomplete_keeps_partially_read_bytes() {
        // Two magic bytes, then a one-byte value.
        let tagged = stage::from_fn(|input| {
            let Some(magic) = input.take(2) else {
                return Ok(Outcome::Incomplete);
            };
            if &magic[..] != b"AB" {
                return Err(StagewireError::protocol("bad magic"));
            }
            Ok(input.take_u8().map_or(Outcome::Incomplete, Outcome::Produce))
        });
        let mut decoder = Decoder::new(tagged);

        assert!(decoder.decode(b"AB").unwrap().is_none());
        assert_eq!(decoder.len(), 2);
        assert!(decoder.is_at_initial_stage());

        assert_eq!(decoder.decode(&[9]).unwrap(), Some(9));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_zero_progress_produce_is_cut_off() {
        let forever = stage::from_fn(|_| Ok(Outcome::Produce(())));
        let mut decoder = Decoder::new(forever).with_max_idle_transitions(8);

        let err = decoder.decode_all(&[]).unwrap_err();

        assert!(matches!(err, StagewireError::TransitionLimit { limit: 8 }));
        // The count starts over after the error.
        assert_eq!(decoder.decode(&[]).unwrap(), Some(()));
    }

    #[test]
    fn test_consuming_produce_resets_idle_count() {
        let mut decoder = Decoder::new(length_prefixed()).with_max_idle_transitions(0);
        let mut bytes = frame(b"x");
        bytes.extend(frame(b""));

        let values = decoder.decode_all(&bytes).unwrap();

        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut decoder = Decoder::new(length_prefixed());
        decoder.decode(&frame(b"abc")[..6]).unwrap();
        assert!(!decoder.is_at_initial_stage());

        decoder.clear();

        assert!(decoder.is_at_initial_stage());
        assert!(decoder.is_empty());
    }
}
