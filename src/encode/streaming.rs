//! Streaming controller - at most one follow-up write session per engine.
//!
//! An encoder may open a [`StreamSession`] through its
//! [`EncodeControl`](super::EncodeControl). Values pushed into the session
//! travel over a bounded channel to a responder task that encodes and
//! writes each of them after the initiating write.
//!
//! ```text
//! encoder ── start_streaming() ──► StreamSession ─► mpsc ─► responder ─► writer
//!                                        │
//!                   StreamingFlag ◄──────┴── StreamingGuard (clears on drop)
//! ```
//!
//! The engine-wide [`StreamingFlag`] is an atomic so the responder, which
//! may run on another worker thread, and the connection's own context always
//! agree on whether a session is open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{ErrorSlot, Result, StagewireError};

/// Default capacity of a stream session's channel.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Engine-owned "a stream session is open" flag.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct StreamingFlag {
    active: Arc<AtomicBool>,
}

impl StreamingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session is currently open.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark streaming as active, failing without side effects if it
    /// already is.
    pub fn acquire(&self) -> Result<StreamingGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StagewireError::StreamingAlreadyActive)?;
        Ok(StreamingGuard {
            flag: self.clone(),
        })
    }
}

/// Clears the streaming flag when dropped.
#[derive(Debug)]
pub struct StreamingGuard {
    flag: StreamingFlag,
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.flag.active.store(false, Ordering::Release);
        tracing::debug!("Streaming session released");
    }
}

/// Producer side of an open streaming session.
///
/// Every value sent here is encoded and written asynchronously. Closing the
/// session (or dropping it) ends the stream once queued values are written.
///
/// If the responder stopped because a streamed value failed to encode,
/// the next send returns that error instead of `ConnectionClosed`.
#[derive(Debug)]
pub struct StreamSession<M> {
    tx: mpsc::Sender<M>,
    failure: ErrorSlot,
}

impl<M> StreamSession<M> {
    /// Push a value, waiting for channel capacity.
    pub async fn send(&self, value: M) -> Result<()> {
        self.tx.send(value).await.map_err(|_| self.closed_error())
    }

    /// Push a value without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if the channel is full.
    pub fn try_send(&self, value: M) -> Result<()> {
        self.tx.try_send(value).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StagewireError::BackpressureTimeout,
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
        })
    }

    fn closed_error(&self) -> StagewireError {
        self.failure
            .take()
            .unwrap_or(StagewireError::ConnectionClosed)
    }

    /// Whether the responder has gone away (connection closed or an encode
    /// failure ended the stream).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// End the session.
    pub fn close(self) {}
}

/// Consumer side of a session, waiting to be handed to a responder.
///
/// Holds the streaming guard: dropping an unstarted stream releases the
/// flag.
#[derive(Debug)]
pub struct PendingStream<M> {
    pub(crate) rx: mpsc::Receiver<M>,
    pub(crate) guard: StreamingGuard,
    /// Read by the session once `rx` is gone.
    pub(crate) failure: ErrorSlot,
}

impl<M> PendingStream<M> {
    /// Receive the next streamed value, `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Split into the receiver and the guard keeping the flag set.
    pub fn into_parts(self) -> (mpsc::Receiver<M>, StreamingGuard) {
        (self.rx, self.guard)
    }
}

/// Open a session against `flag`.
pub(crate) fn open<M>(
    flag: &StreamingFlag,
    capacity: usize,
) -> Result<(StreamSession<M>, PendingStream<M>)> {
    let guard = flag.acquire()?;
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let failure = ErrorSlot::default();
    Ok((
        StreamSession {
            tx,
            failure: failure.clone(),
        },
        PendingStream { rx, guard, failure },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_acquire_and_release() {
        let flag = StreamingFlag::new();
        assert!(!flag.is_active());

        let guard = flag.acquire().unwrap();
        assert!(flag.is_active());

        drop(guard);
        assert!(!flag.is_active());
    }

    #[test]
    fn test_second_acquire_fails_without_side_effects() {
        let flag = StreamingFlag::new();
        let _guard = flag.acquire().unwrap();

        let err = flag.acquire().unwrap_err();
        assert!(matches!(err, StagewireError::StreamingAlreadyActive));
        // The failed attempt must not clear the flag held by the first guard.
        assert!(flag.is_active());
    }

    #[test]
    fn test_clone_shares_state() {
        let flag = StreamingFlag::new();
        let other = flag.clone();

        let _guard = other.acquire().unwrap();
        assert!(flag.is_active());
    }

    #[tokio::test]
    async fn test_session_delivers_in_order() {
        let flag = StreamingFlag::new();
        let (session, mut pending) = open::<u32>(&flag, 8).unwrap();

        for i in 0..5 {
            session.send(i).await.unwrap();
        }
        session.close();

        let mut received = Vec::new();
        while let Some(v) = pending.recv().await {
            received.push(v);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(flag.is_active());

        drop(pending);
        assert!(!flag.is_active());
    }

    #[tokio::test]
    async fn test_try_send_when_full() {
        let flag = StreamingFlag::new();
        let (session, _pending) = open::<u32>(&flag, 1).unwrap();

        session.try_send(1).unwrap();
        let result = session.try_send(2);
        assert!(matches!(result, Err(StagewireError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_dropping_pending_stream_closes_session() {
        let flag = StreamingFlag::new();
        let (session, pending) = open::<u32>(&flag, 4).unwrap();

        drop(pending);

        assert!(session.is_closed());
        assert!(!flag.is_active());
        let result = session.send(1).await;
        assert!(matches!(result, Err(StagewireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_session_reports_recorded_failure() {
        let flag = StreamingFlag::new();
        let (session, pending) = open::<u32>(&flag, 4).unwrap();

        pending
            .failure
            .record(StagewireError::StreamingAlreadyActive);
        drop(pending);

        let result = session.send(1).await;
        assert!(matches!(result, Err(StagewireError::StreamingAlreadyActive)));
        let result = session.try_send(2);
        assert!(matches!(result, Err(StagewireError::ConnectionClosed)));
    }
}
