//! Backoff-retried I/O operations.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::FiberGroup;

/// A non-decreasing backoff schedule for retrying failed file I/O.
#[derive(Clone)]
pub struct RetrySchedule {
    intervals: Arc<[Duration]>,
}

impl RetrySchedule {
    pub fn new(intervals: Vec<Duration>) -> Self {
        debug_assert!(intervals.windows(2).all(|w| w[0] <= w[1]));
        Self {
            intervals: intervals.into(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.intervals.len()
    }
}

impl From<&[Duration]> for RetrySchedule {
    fn from(intervals: &[Duration]) -> Self {
        Self::new(intervals.to_vec())
    }
}

/// Run `op`, retrying failures against the schedule. Each failure sleeps
/// the next interval before retrying; exhaustion returns the last error.
/// A stop request on the group cancels further retries with
/// [`RaftError::Stopped`]; the first attempt always runs, so shutdown
/// paths can still write.
pub async fn retry_io<T, F, Fut>(
    group: &FiberGroup,
    what: &str,
    schedule: &RetrySchedule,
    mut op: F,
) -> RaftResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt >= schedule.intervals.len() {
                    tracing::error!(what, error = %err, attempts = attempt, "i/o retries exhausted");
                    return Err(RaftError::Io(err));
                }
                let pause = schedule.intervals[attempt];
                attempt += 1;
                tracing::warn!(what, error = %err, attempt, pause_ms = pause.as_millis() as u64, "i/o failed, will retry");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = group.stopped() => return Err(RaftError::Stopped),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Dispatcher;
    use crate::fiber::FiberFuture;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let dispatcher = Dispatcher::spawn("retry-ok").unwrap();
        let group = dispatcher.create_group("g").await.unwrap();
        let (fut, completer) = FiberFuture::new();
        group
            .run(move |g| {
                let g2 = g.clone();
                g.spawn("op", async move {
                    let schedule = RetrySchedule::new(vec![Duration::from_millis(1); 4]);
                    let tries = AtomicUsize::new(0);
                    let res = retry_io(&g2, "flaky", &schedule, || {
                        let n = tries.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n < 2 {
                                Err(io::Error::new(io::ErrorKind::Other, "transient"))
                            } else {
                                Ok(7u32)
                            }
                        }
                    })
                    .await;
                    completer.complete(res);
                });
            })
            .unwrap();
        let res = fut.await.unwrap();
        assert_eq!(res.unwrap(), 7);
        group.request_stop();
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let dispatcher = Dispatcher::spawn("retry-fail").unwrap();
        let group = dispatcher.create_group("g").await.unwrap();
        let (fut, completer) = FiberFuture::new();
        group
            .run(move |g| {
                let g2 = g.clone();
                g.spawn("op", async move {
                    let schedule = RetrySchedule::new(vec![Duration::from_millis(1); 2]);
                    let res: RaftResult<u32> = retry_io(&g2, "doomed", &schedule, || async {
                        Err(io::Error::new(io::ErrorKind::Other, "persistent"))
                    })
                    .await;
                    completer.complete(res);
                });
            })
            .unwrap();
        let res = fut.await.unwrap();
        assert!(matches!(res, Err(RaftError::Io(_))));
        group.request_stop();
        dispatcher.shutdown();
    }
}
