//! Signal flags - post-write instructions attached to outbound values.
//!
//! Flags are fixed when the value is built and read once, after the value's
//! write has been handed to the writer. The only defined flag is
//! [`SignalFlags::DISCONNECT`], which closes the connection once that write
//! has been flushed.

use std::ops::Deref;

use bytes::Bytes;

/// Immutable set of post-write signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SignalFlags(u8);

impl SignalFlags {
    /// Close the connection after this write completes.
    pub const DISCONNECT: SignalFlags = SignalFlags(0x01);

    /// No signals.
    #[inline]
    pub const fn empty() -> Self {
        SignalFlags(0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: SignalFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: SignalFlags) -> Self {
        SignalFlags(self.0 | other.0)
    }

    /// Shorthand for `contains(DISCONNECT)`.
    #[inline]
    pub const fn disconnect(self) -> bool {
        self.contains(Self::DISCONNECT)
    }
}

impl std::ops::BitOr for SignalFlags {
    type Output = SignalFlags;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Optional capability of outbound values: expose post-write signals.
///
/// The default implementation carries no signals, so plain message types
/// only need an empty `impl Signals for MyMessage {}`.
pub trait Signals {
    fn signal_flags(&self) -> SignalFlags {
        SignalFlags::empty()
    }
}

impl Signals for Bytes {}
impl Signals for Vec<u8> {}
impl Signals for String {}
impl Signals for &'static str {}

/// A value paired with the signals fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signaled<M> {
    value: M,
    flags: SignalFlags,
}

impl<M> Signaled<M> {
    pub fn new(value: M, flags: SignalFlags) -> Self {
        Self { value, flags }
    }

    /// Value that closes the connection once written.
    pub fn closing(value: M) -> Self {
        Self::new(value, SignalFlags::DISCONNECT)
    }

    /// Value without signals.
    pub fn plain(value: M) -> Self {
        Self::new(value, SignalFlags::empty())
    }

    #[inline]
    pub fn get(&self) -> &M {
        &self.value
    }

    pub fn into_inner(self) -> M {
        self.value
    }
}

impl<M> Signals for Signaled<M> {
    fn signal_flags(&self) -> SignalFlags {
        self.flags
    }
}

impl<M> Deref for Signaled<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.value
    }
}

impl<M> From<M> for Signaled<M> {
    fn from(value: M) -> Self {
        Self::plain(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_operations() {
        let none = SignalFlags::empty();
        let both = none | SignalFlags::DISCONNECT;

        assert!(none.is_empty());
        assert!(!none.disconnect());
        assert!(both.disconnect());
        assert!(both.contains(SignalFlags::DISCONNECT));
        assert_eq!(
            SignalFlags::DISCONNECT.union(SignalFlags::DISCONNECT),
            SignalFlags::DISCONNECT
        );
    }

    #[test]
    fn test_plain_values_have_no_signals() {
        assert!(Bytes::from_static(b"x").signal_flags().is_empty());
        assert!(String::from("x").signal_flags().is_empty());
        assert!(vec![1u8].signal_flags().is_empty());
    }

    #[test]
    fn test_signaled_wrapper() {
        let closing = Signaled::closing(String::from("bye"));
        let plain: Signaled<String> = String::from("hi").into();

        assert!(closing.signal_flags().disconnect());
        assert!(plain.signal_flags().is_empty());
        assert_eq!(closing.len(), 3);
        assert_eq!(closing.get(), "bye");
        assert_eq!(plain.into_inner(), "hi");
    }
}
