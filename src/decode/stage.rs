//! Stage contract - the interface a parsing unit implements.
//!
//! A stage is evaluated against the current [`Cursor`] and returns exactly
//! one [`Outcome`] per invocation:
//!
//! - `Incomplete`: nothing more can be done until more bytes arrive
//! - `Transition(next)`: no value yet, continue with `next` on the same input
//! - `Produce(value)`: a complete value was decoded
//!
//! Stages are immutable and shared behind an `Arc`. A continuation stage
//! that needs earlier partial results captures them when it is built.
//!
//! # Example
//!
//! ```
//! use stagewire::decode::{stage, Outcome, StageRef};
//!
//! // One byte tells how many bytes follow.
//! fn short_string() -> StageRef<Vec<u8>> {
//!     stage::from_fn(|input| match input.take_u8() {
//!         None => Ok(Outcome::Incomplete),
//!         Some(len) => Ok(Outcome::transition(move |input| {
//!             Ok(match input.take(len as usize) {
//!                 Some(body) => Outcome::Produce(body.to_vec()),
//!                 None => Outcome::Incomplete,
//!             })
//!         })),
//!     })
//! }
//! # let _ = short_string();
//! ```

use std::fmt;
use std::sync::Arc;

use super::Cursor;
use crate::error::Result;

/// A unit of incremental parsing logic producing values of type `T`.
pub trait Stage<T>: Send + Sync {
    /// Evaluate against the bytes available in `input`.
    ///
    /// Bytes read through `input` are kept only if the outcome is
    /// `Transition` or `Produce`.
    fn evaluate(&self, input: &mut Cursor<'_>) -> Result<Outcome<T>>;
}

/// Shared handle to a stage. The decoder holds one as its stage pointer.
pub type StageRef<T> = Arc<dyn Stage<T>>;

/// Result of evaluating a stage once.
pub enum Outcome<T> {
    /// More bytes are needed before any progress is possible.
    Incomplete,
    /// Continue immediately with the given stage.
    Transition(StageRef<T>),
    /// A fully decoded value.
    Produce(T),
}

impl<T: 'static> Outcome<T> {
    /// Transition to a stage built from a closure.
    pub fn transition<F>(f: F) -> Self
    where
        F: Fn(&mut Cursor<'_>) -> Result<Outcome<T>> + Send + Sync + 'static,
    {
        Outcome::Transition(from_fn(f))
    }
}

impl<T> Outcome<T> {
    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Incomplete => "incomplete",
            Outcome::Transition(_) => "transition",
            Outcome::Produce(_) => "produce",
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Outcome::Incomplete)
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Incomplete => f.write_str("Incomplete"),
            Outcome::Transition(_) => f.write_str("Transition(..)"),
            Outcome::Produce(v) => f.debug_tuple("Produce").field(v).finish(),
        }
    }
}

/// Stage backed by a closure.
pub struct FnStage<F>(F);

impl<T, F> Stage<T> for FnStage<F>
where
    F: Fn(&mut Cursor<'_>) -> Result<Outcome<T>> + Send + Sync,
{
    #[inline]
    fn evaluate(&self, input: &mut Cursor<'_>) -> Result<Outcome<T>> {
        (self.0)(input)
    }
}

/// Build a shared stage from a closure.
pub fn from_fn<T, F>(f: F) -> StageRef<T>
where
    T: 'static,
    F: Fn(&mut Cursor<'_>) -> Result<Outcome<T>> + Send + Sync + 'static,
{
    Arc::new(FnStage(f))
}
