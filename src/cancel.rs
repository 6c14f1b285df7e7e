//! Cancellation signal shared by the orchestrator and every worker.
//!
//! A thin wrapper over a `tokio::sync::watch` channel. The orchestrator
//! holds the handle; workers hold cheap clones of the token and either
//! poll `is_cancelled` between units of work or `select!` on `cancelled()`
//! around long-running awaits (subprocess waits, HTTP requests).

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling; park forever so that
                // select! arms fall through to the work branch.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        // Must resolve immediately once cancelled
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_pending_until_cancelled() {
        let (handle, token) = cancel_pair();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move {
                token.cancelled().await;
                true
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        handle.cancel();
        assert!(waiter.await.unwrap());
    }
}
