//! Cancellation token threaded through every blocking wait
//!
//! Cancelling drops the token's only sender, so every receiver clone wakes
//! with `Disconnected` at once. Waits select on that receiver next to their
//! data channel instead of polling a stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvError, Selector, Sender};

use crate::utils::lock;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Outcome of a cancellable receive
#[derive(Debug, PartialEq, Eq)]
pub enum Wait<T> {
    Ready(T),
    TimedOut,
    Cancelled,
    /// Every sender of the data channel is gone
    Closed,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = flume::bounded(1);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Cancel and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        lock(&self.inner.trigger).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Receiver that disconnects when the token is cancelled
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Receive from `rx`, giving up at `timeout` or on cancellation
    pub fn recv_timeout<T>(&self, rx: &Receiver<T>, timeout: Duration) -> Wait<T> {
        self.recv_deadline(rx, Instant::now() + timeout)
    }

    pub fn recv_deadline<T>(&self, rx: &Receiver<T>, deadline: Instant) -> Wait<T> {
        if self.is_cancelled() {
            return Wait::Cancelled;
        }
        let outcome = Selector::new()
            .recv(rx, |res: Result<T, RecvError>| match res {
                Ok(value) => Wait::Ready(value),
                Err(RecvError::Disconnected) => Wait::Closed,
            })
            .recv(self.signal(), |_| Wait::Cancelled)
            .wait_deadline(deadline);
        match outcome {
            Ok(wait) => wait,
            Err(_) if self.is_cancelled() => Wait::Cancelled,
            Err(_) => Wait::TimedOut,
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns false on cancel.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.signal().recv_timeout(duration) {
            Err(flume::RecvTimeoutError::Timeout) => true,
            _ => !self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_wakes_blocked_receiver() {
        let token = CancelToken::new();
        let (_tx, rx) = flume::bounded::<u32>(1);

        let waiter = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let outcome = token.recv_timeout(&rx, Duration::from_secs(10));
                (outcome, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (outcome, elapsed) = waiter.join().unwrap();
        assert_eq!(outcome, Wait::Cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn receive_and_timeout() {
        let token = CancelToken::new();
        let (tx, rx) = flume::bounded::<u32>(1);
        tx.send(7).unwrap();
        assert_eq!(token.recv_timeout(&rx, Duration::from_millis(10)), Wait::Ready(7));
        assert_eq!(
            token.recv_timeout(&rx, Duration::from_millis(10)),
            Wait::TimedOut
        );
        drop(tx);
        assert_eq!(token.recv_timeout(&rx, Duration::from_millis(10)), Wait::Closed);
    }

    #[test]
    fn sleep_is_interrupted() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(1)));
        token.cancel();
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(10)));
    }
}
