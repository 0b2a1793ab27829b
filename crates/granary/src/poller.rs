//! Liveness heartbeat for claimed work.
//!
//! A poller wakes every `period` and runs its predicate (the backplane poll
//! that renews the dispatch deadline); a false return means the claim was
//! lost and the poller stops. Past the absolute expiration the caller's
//! expiration hook fires instead. At most one poll loop is active at a time.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

pub struct Poller {
    period: Duration,
    active: Mutex<Option<CancellationToken>>,
}

impl Poller {
    pub fn new(period: Duration) -> Poller {
        Poller {
            period,
            active: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the poll loop. Panics if one is already active.
    pub fn resume<P, Fut>(
        &self,
        mut poll: P,
        on_expiration: impl FnOnce() + Send + 'static,
        expiration: Instant,
    ) where
        P: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let mut active = self.active.lock().expect("poller state poisoned");
        assert!(active.is_none(), "poller resumed while active");
        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());

        let period = self.period;
        tokio::spawn(async move {
            let mut on_expiration = Some(on_expiration);
            loop {
                let now = Instant::now();
                if now >= expiration {
                    if let Some(on_expiration) = on_expiration.take() {
                        on_expiration();
                    }
                    return;
                }
                let wake = (now + period).min(expiration);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(wake.into()) => {
                        if Instant::now() >= expiration {
                            if let Some(on_expiration) = on_expiration.take() {
                                on_expiration();
                            }
                            return;
                        }
                        if !poll().await {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Stop the active poll loop, if any.
    pub fn pause(&self) {
        if let Some(cancel) = self
            .active
            .lock()
            .expect("poller state poisoned")
            .take()
        {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn polls_on_period_until_claim_lost() {
        let poller = Poller::new(Duration::from_millis(100));
        let polls = Arc::new(AtomicU32::new(0));
        let failed = Arc::new(AtomicBool::new(false));

        let poll_count = polls.clone();
        let on_failure = failed.clone();
        poller.resume(
            move || {
                let count = poll_count.fetch_add(1, Ordering::SeqCst) + 1;
                let on_failure = on_failure.clone();
                async move {
                    let live = count < 3;
                    if !live {
                        on_failure.store(true, Ordering::SeqCst);
                    }
                    live
                }
            },
            || {},
            Instant::now() + Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(failed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_fires_once() {
        let poller = Poller::new(Duration::from_millis(50));
        let expired = Arc::new(AtomicU32::new(0));

        let on_expiration = expired.clone();
        poller.resume(
            || async { true },
            move || {
                on_expiration.fetch_add(1, Ordering::SeqCst);
            },
            Instant::now() + Duration::from_millis(120),
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_stops_polling() {
        let poller = Poller::new(Duration::from_millis(50));
        let polls = Arc::new(AtomicU32::new(0));

        let poll_count = polls.clone();
        poller.resume(
            move || {
                poll_count.fetch_add(1, Ordering::SeqCst);
                async { true }
            },
            || {},
            Instant::now() + Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_millis(160)).await;
        poller.pause();
        let after_pause = polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(polls.load(Ordering::SeqCst), after_pause);
    }

    #[tokio::test]
    #[should_panic(expected = "poller resumed while active")]
    async fn resume_while_active_is_a_bug() {
        let poller = Poller::new(Duration::from_millis(50));
        poller.resume(|| async { true }, || {}, Instant::now() + Duration::from_secs(1));
        poller.resume(|| async { true }, || {}, Instant::now() + Duration::from_secs(1));
    }
}
