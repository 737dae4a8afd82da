use lazy_static::lazy_static;
use tokio::sync::watch;

lazy_static! {
    // backing channel for tokens that can never fire
    static ref NEVER: (watch::Sender<bool>, watch::Receiver<bool>) = watch::channel(false);
}

/// Requests cancellation of a resolution. Dropping the source without
/// calling [`CancelSource::cancel`] leaves its tokens inert.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// A cancellation token threaded through the resolver. Checked at the top
/// of every driver iteration and before each transport query; in-flight
/// transport futures are raced against [`CancelToken::cancelled`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> CancelToken {
        CancelToken { rx: NEVER.1.clone() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. Pends forever if the
    /// source is gone without having cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelSource, CancelToken};
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (source, token) = CancelSource::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() should have resolved")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let result =
            tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(result.is_err());
    }
}
