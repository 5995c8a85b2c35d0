use crate::cert::Validity;
use crate::manager::Manager;
use crate::time::humanize_std_duration;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(60);
const BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// When renewal of a certificate should start.
///
/// Short-lived certificates would spend their entire life inside a fixed lead time, so the lead
/// is capped at a third of the lifetime.
pub fn renewal_start(validity: &Validity, renew_before: Duration) -> OffsetDateTime {
    let lifetime = validity.lifetime();
    let third = if lifetime.is_positive() {
        lifetime / 3
    } else {
        time::Duration::ZERO
    };
    let lead = time::Duration::try_from(renew_before)
        .unwrap_or(time::Duration::MAX)
        .min(third);
    validity.not_after - lead
}

pub fn needs_renewal(validity: &Validity, renew_before: Duration, now: OffsetDateTime) -> bool {
    now >= renewal_start(validity, renew_before)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RenewalBackoff {
    failures: u32,
    retry_at: Instant,
}

impl RenewalBackoff {
    pub(crate) fn after_failure(previous: Option<RenewalBackoff>, now: Instant) -> Self {
        let failures = previous.map_or(1, |backoff| backoff.failures.saturating_add(1));
        Self {
            failures,
            retry_at: now + backoff_delay(failures),
        }
    }

    pub(crate) fn allows_attempt(&self, now: Instant) -> bool {
        now >= self.retry_at
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_INITIAL
        .saturating_mul(2u32.pow(exponent))
        .min(BACKOFF_MAX)
}

fn jittered(interval: Duration) -> Duration {
    let max_jitter = interval.as_millis() / 10;
    let max_jitter = u64::try_from(max_jitter).unwrap_or(u64::MAX);
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

impl Manager {
    pub async fn run_renewal(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(
            "Checking certificates for renewal every {}",
            humanize_std_duration(interval)
        );
        loop {
            tokio::select! {
                () = tokio::time::sleep(jittered(interval)) => {}
                () = shutdown.cancelled() => break,
            }
            tokio::select! {
                () = self.renew_due() => {}
                () = shutdown.cancelled() => break,
            }
        }
        debug!("Renewal loop stopped");
    }

    pub async fn renew_due(self: &Arc<Self>) {
        let now = OffsetDateTime::now_utc();
        let due = self
            .certificates()
            .into_iter()
            .filter(|cert| self.needs_renewal(cert, now))
            .map(|cert| cert.host().to_string())
            .collect::<Vec<_>>();
        if due.is_empty() {
            debug!("No certificate is due for renewal");
            return;
        }

        let mut renewals = due
            .into_iter()
            .filter_map(|host| self.start_renewal(&host).map(|flight| (host, flight)))
            .map(|(host, flight)| async move { (host, flight.await) })
            .collect::<FuturesUnordered<_>>();
        while let Some((host, outcome)) = renewals.next().await {
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!("Scheduled renewal for {host} failed: {err:#}"),
                Err(err) => warn!("Scheduled renewal for {host} failed: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    fn ninety_days() -> Validity {
        Validity {
            not_before: datetime!(2025-01-01 00:00 UTC),
            not_after: datetime!(2025-04-01 00:00 UTC),
        }
    }

    #[rstest]
    #[case(Duration::from_secs(30 * 86400), datetime!(2025-03-02 00:00 UTC))]
    #[case(Duration::from_secs(86400), datetime!(2025-03-31 00:00 UTC))]
    // Capped at a third of the 90 day lifetime
    #[case(Duration::from_secs(60 * 86400), datetime!(2025-03-02 00:00 UTC))]
    fn test_renewal_start(#[case] renew_before: Duration, #[case] expected: OffsetDateTime) {
        assert_eq!(renewal_start(&ninety_days(), renew_before), expected);
    }

    #[test]
    fn test_needs_renewal() {
        let thirty_days = Duration::from_secs(30 * 86400);
        assert!(!needs_renewal(
            &ninety_days(),
            thirty_days,
            datetime!(2025-02-01 00:00 UTC)
        ));
        assert!(needs_renewal(
            &ninety_days(),
            thirty_days,
            datetime!(2025-03-15 00:00 UTC)
        ));
    }

    #[rstest]
    #[case(1, Duration::from_secs(60))]
    #[case(2, Duration::from_secs(120))]
    #[case(6, Duration::from_secs(1920))]
    #[case(7, Duration::from_secs(3600))]
    #[case(u32::MAX, Duration::from_secs(3600))]
    fn test_backoff_delay(#[case] failures: u32, #[case] expected: Duration) {
        assert_eq!(backoff_delay(failures), expected);
    }

    #[test]
    fn test_backoff_accumulates() {
        let now = Instant::now();
        let first = RenewalBackoff::after_failure(None, now);
        assert_eq!(first.failures(), 1);
        assert!(!first.allows_attempt(now));
        assert!(first.allows_attempt(now + Duration::from_secs(60)));
        let second = RenewalBackoff::after_failure(Some(first), now);
        assert_eq!(second.failures(), 2);
        assert!(!second.allows_attempt(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_secs(100);
        for _ in 0..20 {
            let value = jittered(interval);
            assert!(value >= interval && value <= Duration::from_secs(110));
        }
    }
}
