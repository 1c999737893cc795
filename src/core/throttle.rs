//! Throttling and the evaluation-window claim.
//!
//! An instigator may not be evaluated more often than its minimum interval.
//! The claim stamps the start of a window under the process-wide state lock
//! so that two workers can never both pass the gate for the same instigator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use super::clock::Clock;
use super::EngineError;
use crate::domain::{Instigator, InstigatorState, SensorData};
use crate::store::Storage;

/// The single lock guarding read-modify-write of instigator state
#[derive(Debug, Clone, Default)]
pub struct StateLock {
    inner: Arc<Mutex<()>>,
}

impl StateLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

/// A won evaluation window
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    /// State as written by the claim
    pub state: InstigatorState,
    /// Start of the window
    pub now: DateTime<Utc>,
}

/// True when the instigator ran (or started running) too recently
pub fn is_under_min_interval(
    state: &InstigatorState,
    instigator: &Instigator,
    now: DateTime<Utc>,
) -> bool {
    let Some(data) = state.data.as_ref() else {
        return false;
    };
    let interval = match instigator.min_interval_seconds {
        Some(seconds) if seconds > 0 => seconds,
        _ => return false,
    };

    let last = match (data.last_tick_timestamp, data.last_tick_start_timestamp) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return false,
    };

    let interval_ms = i64::try_from(interval)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    (now - last).num_milliseconds() < interval_ms
}

/// Stamp the start of an evaluation window unless the instigator is throttled.
///
/// The persisted state is re-read under the lock; a missing state is created
/// from the instigator's defaults. A state stopped since the loop's snapshot
/// loses the claim.
pub async fn try_claim(
    storage: &dyn Storage,
    lock: &StateLock,
    instigator: &Instigator,
    clock: &dyn Clock,
) -> Result<Option<Claim>, EngineError> {
    let _guard = lock.lock().await;

    let selector_id = instigator.selector_id();
    let stored = storage.get_instigator_state(&selector_id).await?;
    let now = clock.now();

    if let Some(state) = &stored {
        if !state.status.is_running() || is_under_min_interval(state, instigator, now) {
            return Ok(None);
        }
    }

    let state = match stored {
        Some(state) => {
            let data = SensorData {
                last_tick_start_timestamp: Some(now),
                min_interval_seconds: instigator.min_interval_seconds,
                ..state.data.clone().unwrap_or_default()
            };
            storage
                .update_instigator_state(state.with_data(data))
                .await?
        }
        None => {
            let initial = instigator.initial_state();
            let data = SensorData {
                last_tick_start_timestamp: Some(now),
                ..initial.data.clone().unwrap_or_default()
            };
            storage.add_instigator_state(initial.with_data(data)).await?
        }
    };

    Ok(Some(Claim { state, now }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::domain::{InstigatorOrigin, InstigatorStatus};
    use crate::store::{InstigatorStore, MemoryStorage};
    use chrono::Duration;

    fn sensor(interval: Option<u64>) -> Instigator {
        let sensor = Instigator::new("s", InstigatorOrigin::new("loc", "repo"));
        match interval {
            Some(seconds) => sensor.with_min_interval(seconds),
            None => sensor,
        }
    }

    fn state_with(
        last_tick: Option<DateTime<Utc>>,
        last_start: Option<DateTime<Utc>>,
    ) -> InstigatorState {
        sensor(None).initial_state().with_data(SensorData {
            last_tick_timestamp: last_tick,
            last_tick_start_timestamp: last_start,
            ..Default::default()
        })
    }

    #[test]
    fn test_no_interval_never_throttles() {
        let now = Utc::now();
        let state = state_with(Some(now), Some(now));
        assert!(!is_under_min_interval(&state, &sensor(None), now));
        assert!(!is_under_min_interval(&state, &sensor(Some(0)), now));
    }

    #[test]
    fn test_missing_timestamps_never_throttle() {
        let now = Utc::now();
        assert!(!is_under_min_interval(&state_with(None, None), &sensor(Some(30)), now));

        let mut no_data = state_with(None, None);
        no_data.data = None;
        assert!(!is_under_min_interval(&no_data, &sensor(Some(30)), now));
    }

    #[test]
    fn test_uses_latest_of_both_timestamps() {
        let now = Utc::now();
        let state = state_with(
            Some(now - Duration::seconds(100)),
            Some(now - Duration::seconds(10)),
        );

        assert!(is_under_min_interval(&state, &sensor(Some(30)), now));
        assert!(!is_under_min_interval(
            &state,
            &sensor(Some(30)),
            now + Duration::seconds(20)
        ));
    }

    #[tokio::test]
    async fn test_claim_creates_missing_state() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(Utc::now());
        let sensor = sensor(Some(30));

        let claim = try_claim(&storage, &StateLock::new(), &sensor, &clock)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.now, clock.now());

        let stored = storage
            .get_instigator_state(&sensor.selector_id())
            .await
            .unwrap()
            .unwrap();
        let data = stored.data.unwrap();
        assert_eq!(data.last_tick_start_timestamp, Some(claim.now));
        assert_eq!(data.min_interval_seconds, Some(30));
    }

    #[tokio::test]
    async fn test_second_claim_inside_window_loses() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(Utc::now());
        let lock = StateLock::new();
        let sensor = sensor(Some(30));

        assert!(try_claim(&storage, &lock, &sensor, &clock).await.unwrap().is_some());

        clock.advance(Duration::seconds(5));
        assert!(try_claim(&storage, &lock, &sensor, &clock).await.unwrap().is_none());

        clock.advance(Duration::seconds(25));
        assert!(try_claim(&storage, &lock, &sensor, &clock).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stopped_state_loses_claim() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(Utc::now());
        let sensor = sensor(None);
        storage
            .add_instigator_state(sensor.initial_state().with_status(InstigatorStatus::Stopped))
            .await
            .unwrap();

        let claim = try_claim(&storage, &StateLock::new(), &sensor, &clock)
            .await
            .unwrap();
        assert!(claim.is_none());

        let stored = storage
            .get_instigator_state(&sensor.selector_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, InstigatorStatus::Stopped);
        assert!(stored.data.unwrap().last_tick_start_timestamp.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let lock = StateLock::new();
        let sensor = Arc::new(sensor(Some(60)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (storage, clock, lock, sensor) =
                (storage.clone(), clock.clone(), lock.clone(), sensor.clone());
            handles.push(tokio::spawn(async move {
                try_claim(storage.as_ref(), &lock, &sensor, clock.as_ref())
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
