//! Bounded polling against the resource store.

use std::future::Future;
use std::time::Duration;

use drydock_kubehub::StoreError;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    /// Not there yet; check again after the interval.
    Pending,
    Done(T),
    /// The awaited state can no longer be reached.
    Fail(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("timed out after {waited:?}")]
    Timeout { waited: Duration },
    #[error("{0}")]
    Failed(String),
    #[error("read failed: {0}")]
    Read(#[source] StoreError),
}

impl PollError {
    /// `true` for conditions that cannot recover by waiting longer.
    pub fn is_hard_failure(&self) -> bool {
        !matches!(self, PollError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

/// Run `check` immediately, then once per `interval`, until it reports `Done` or
/// `Fail`, a read fails, or `timeout` elapses. Sleeps never overrun the deadline.
pub async fn poll_until<T, F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Check<T>, StoreError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut ticks = 0u32;
    loop {
        ticks += 1;
        match check().await.map_err(PollError::Read)? {
            Check::Done(v) => return Ok(v),
            Check::Fail(reason) => return Err(PollError::Failed(reason)),
            Check::Pending => {}
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(ticks, waited_ms = (now - start).as_millis() as u64, "poll timed out");
            return Err(PollError::Timeout { waited: now - start });
        }
        sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn first_check_runs_without_sleeping() {
        let t0 = Instant::now();
        let out = poll_until(Duration::from_secs(5), Duration::from_secs(60), || async { Ok::<_, StoreError>(Check::Done(7)) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn checks_every_interval_until_done() {
        let calls = &AtomicU32::new(0);
        let t0 = Instant::now();
        let out = poll_until(Duration::from_secs(1), Duration::from_secs(60), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, StoreError>(if n == 4 { Check::Done(n) } else { Check::Pending })
        })
        .await
        .unwrap();
        assert_eq!(out, 4);
        assert_eq!(t0.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_not_a_hard_failure() {
        let calls = &AtomicU32::new(0);
        let t0 = Instant::now();
        let err = poll_until(Duration::from_secs(3), Duration::from_secs(10), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(Check::<()>::Pending)
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_hard_failure());
        // checks at 0, 3, 6, 9 and the clamped 10
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(t0.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_stops_immediately() {
        let t0 = Instant::now();
        let err = poll_until(Duration::from_secs(1), Duration::from_secs(300), || async {
            Ok::<_, StoreError>(Check::<()>::Fail("pod failed".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::Failed(ref r) if r == "pod failed"));
        assert!(err.is_hard_failure());
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_aborts_the_poll() {
        let err = poll_until(Duration::from_secs(1), Duration::from_secs(300), || async {
            Err::<Check<()>, _>(StoreError::NotFound { kind: "Pod".into(), namespace: "ns".into(), name: "p".into() })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::Read(ref e) if e.is_not_found()));
        assert!(err.is_hard_failure());
    }
}
