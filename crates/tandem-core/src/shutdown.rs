//! Cooperative cancellation.
//!
//! Every suspension point of the engine (packet waits, the announce
//! retransmission loop, awaiting a peer) selects on [`Shutdown::cancelled`]
//! and returns a `Cancelled` error once the matching [`ShutdownTrigger`]
//! fires.

use tokio::sync::watch;

/// Fires the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Requests shutdown. Every current and future [`Shutdown`] observes it.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Handle that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true once shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown was requested.
    ///
    /// Pends forever if the trigger was dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::never()
    }
}

/// Creates a connected trigger and handle.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn trigger_wakes_waiters() {
        let (trigger, shutdown) = channel();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!shutdown.is_triggered());

        trigger.trigger();
        handle.await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_fire() {
        let shutdown = Shutdown::never();
        let fired = tokio::time::timeout(Duration::from_secs(60), shutdown.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn late_handles_see_earlier_trigger() {
        let (trigger, shutdown) = channel();
        trigger.trigger();
        shutdown.clone().cancelled().await;
    }
}
