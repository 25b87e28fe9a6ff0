use crate::shutdown::ShutdownSignal;
use chainscan_common::{ScanError, ScanResult, SourceError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-delay retry for transient source errors.
///
/// Transient errors are retried without bound; the stop signal is checked
/// between attempts. Fatal errors are returned on first sight.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, shutdown: &ShutdownSignal, mut op: F) -> ScanResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempts: u64 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    warn!("{} not available (attempt {}), retrying: {}", what, attempts, e);
                    if !shutdown.sleep(self.delay).await {
                        return Err(ScanError::Stopped);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (_trigger, signal) = shutdown_channel();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(Duration::from_millis(1));

        let value = policy
            .run("block 7", &signal, move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(SourceError::Transient("empty".into()))
                } else {
                    Ok(7u32)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let (_trigger, signal) = shutdown_channel();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(Duration::from_millis(1));

        let err = policy
            .run("block 7", &signal, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(SourceError::Fatal("bad request".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(err, ScanError::Source(SourceError::Fatal("bad request".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry() {
        let (trigger, signal) = shutdown_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(Duration::from_secs(60));

        let task = {
            let calls = calls.clone();
            tokio::spawn(async move {
                policy
                    .run("block 7", &signal, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<u32, _>(SourceError::Transient("empty".into()))
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(result, Err(ScanError::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
