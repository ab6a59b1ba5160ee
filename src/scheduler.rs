//! Daily maintenance loop, one per domain.
//!
//! Sleeps until the next local midnight, then ticks every 24 hours. Each
//! tick resets the domain's archive sequence and flushes it if it has gone
//! too long without a flush. The loop lives as long as the process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, TimeZone};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::aggregator::DomainAggregator;

/// Interval between ticks once aligned to midnight.
pub const TICK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Time left until the next local midnight after `now`.
///
/// Falls back to a full day when that midnight does not exist or is
/// ambiguous in the local time zone.
pub fn until_next_midnight(now: DateTime<Local>) -> Duration {
    let next_midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).single());

    match next_midnight {
        Some(midnight) => (midnight - now).to_std().unwrap_or(TICK_INTERVAL),
        None => TICK_INTERVAL,
    }
}

/// Run the daily loop for `aggregator` forever.
pub async fn run_daily_reset(aggregator: Arc<DomainAggregator>) {
    let first_tick = until_next_midnight(Local::now());
    debug!(
        domain = %aggregator.name(),
        first_tick_secs = first_tick.as_secs(),
        "Daily reset scheduled"
    );

    let mut ticker = interval_at(Instant::now() + first_tick, TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let agg = aggregator.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || agg.daily_tick()).await {
            error!(domain = %aggregator.name(), error = %e, "Daily reset panicked");
        } else {
            info!(domain = %aggregator.name(), "Daily reset done");
        }
    }
}

/// Spawn one daily loop per aggregator.
pub fn spawn_schedulers<'a, I>(aggregators: I) -> Vec<JoinHandle<()>>
where
    I: IntoIterator<Item = &'a Arc<DomainAggregator>>,
{
    aggregators
        .into_iter()
        .map(|agg| tokio::spawn(run_daily_reset(agg.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_next_midnight_from_noon() {
        let noon = Local.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).single();
        if let Some(noon) = noon {
            let wait = until_next_midnight(noon);
            assert!(wait > Duration::from_secs(10 * 3600));
            assert!(wait <= Duration::from_secs(13 * 3600));
        }
    }

    #[test]
    fn test_until_next_midnight_just_before() {
        let late = Local.with_ymd_and_hms(2024, 6, 1, 23, 59, 30).single();
        if let Some(late) = late {
            assert_eq!(until_next_midnight(late), Duration::from_secs(30));
        }
    }

    #[test]
    fn test_until_next_midnight_at_midnight_waits_full_day() {
        let midnight = Local.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single();
        if let Some(midnight) = midnight {
            let wait = until_next_midnight(midnight);
            assert!(wait >= Duration::from_secs(23 * 3600));
            assert!(wait <= Duration::from_secs(25 * 3600));
        }
    }

    #[test]
    fn test_until_next_midnight_never_exceeds_a_day_and_an_hour() {
        let wait = until_next_midnight(Local::now());
        assert!(wait <= Duration::from_secs(25 * 3600));
    }

    #[tokio::test]
    async fn test_spawn_schedulers_one_per_domain() {
        use crate::aggregator::SystemClock;

        let dir = tempfile::tempdir().unwrap();
        let aggregators: Vec<Arc<DomainAggregator>> = ["a.test", "b.test"]
            .iter()
            .map(|name| {
                Arc::new(
                    DomainAggregator::new(*name, dir.path(), 10, Arc::new(SystemClock)).unwrap(),
                )
            })
            .collect();

        let handles = spawn_schedulers(&aggregators);
        assert_eq!(handles.len(), 2);
        for handle in handles {
            assert!(!handle.is_finished());
            handle.abort();
        }
    }
}
