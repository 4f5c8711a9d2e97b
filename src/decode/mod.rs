//! Decode module - stage contract and the incremental decode loop.
//!
//! This module implements the inbound half of the engine:
//! - [`Cursor`] - tentative read window over buffered input
//! - [`Stage`] / [`Outcome`] - the contract every parsing unit satisfies
//! - [`Decoder`] - the loop that evaluates stages as bytes arrive

mod cursor;
mod decoder;
pub mod stage;

pub use cursor::Cursor;
pub use decoder::{Decoder, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE_TRANSITIONS};
pub use stage::{Outcome, Stage, StageRef};
