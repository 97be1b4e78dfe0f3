//! Run-wide cancellation backed by a `tokio::sync::watch` channel.
//!
//! Every poll in the restore and verification paths waits through
//! [`CancelSignal::sleep`], so a single [`CancelHandle::cancel`] aborts all
//! in-flight waits while still letting the run reach cleanup.

use std::time::Duration;

use tokio::sync::watch;

/// Returned by a timed wait that was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Owner side: triggers cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Recorded even if no signal is alive yet.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal linked to this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side: cloned into every component that waits.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let (_handle, signal) = cancellation();
        assert_eq!(signal.sleep(Duration::from_secs(30)).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let (handle, signal) = cancellation();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Cancelled));
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_is_not_cancelled() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        assert_eq!(signal.sleep(Duration::from_secs(1)).await, Ok(()));
    }

    #[test]
    fn test_cancel_is_kept_without_live_signals() {
        let (handle, signal) = cancellation();
        drop(signal);
        handle.cancel();
        assert!(handle.signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_sleep_returns_immediately() {
        let (handle, signal) = cancellation();
        handle.cancel();
        assert_eq!(signal.sleep(Duration::from_secs(3600)).await, Err(Cancelled));
    }
}
