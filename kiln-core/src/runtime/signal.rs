//! Per-call cancellation scope.

use crate::error::KilnError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancellation signal for one call.
///
/// A child of the caller's token, additionally cancelled by a timer once the
/// deadline passes. Dropping the signal stops the timer.
#[derive(Debug)]
pub(crate) struct CallSignal {
    token: CancellationToken,
    timeout: Option<Duration>,
    timed_out: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl CallSignal {
    pub(crate) fn new(cancel: Option<&CancellationToken>, timeout: Option<Duration>) -> Self {
        let token = match cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = timeout.map(|deadline| {
            let token = token.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                timed_out.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });
        Self {
            token,
            timeout,
            timed_out,
            timer,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Timeout` if the deadline fired, `Cancelled` otherwise
    pub(crate) fn error(&self) -> KilnError {
        if self.timed_out.load(Ordering::SeqCst) {
            KilnError::timeout(format!(
                "call exceeded {:?}",
                self.timeout.unwrap_or_default()
            ))
        } else {
            KilnError::Cancelled
        }
    }

    pub(crate) fn check(&self) -> Result<(), KilnError> {
        if self.is_cancelled() {
            Err(self.error())
        } else {
            Ok(())
        }
    }

    /// Run `fut` unless the signal fires first
    pub(crate) async fn race<T, F>(&self, fut: F) -> Result<T, KilnError>
    where
        F: Future<Output = Result<T, KilnError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.error()),
            result = fut => result,
        }
    }
}

impl Drop for CallSignal {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let signal = CallSignal::new(Some(&parent), None);
        assert!(signal.check().is_ok());

        parent.cancel();
        assert!(matches!(signal.check(), Err(KilnError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_timeout() {
        let signal = CallSignal::new(None, Some(Duration::from_secs(1)));
        let result = signal
            .race(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(KilnError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_race_returns_result_when_not_cancelled() {
        let signal = CallSignal::new(None, None);
        assert_eq!(signal.race(async { Ok(7) }).await.unwrap(), 7);
    }
}
