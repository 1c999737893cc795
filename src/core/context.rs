//! Bookkeeping for one tick.
//!
//! A `TickContext` wraps the tick being evaluated. Each transition consumes the
//! context and returns it, and `write` persists the outcome exactly once:
//! the tick record, then (for terminal ticks) the instigator's cursor and
//! timestamps, then retention.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error};

use super::clock::Clock;
use super::throttle::StateLock;
use super::EngineError;
use crate::config::TickRetention;
use crate::domain::{
    DynamicPartitionsRequestResult, ErrorInfo, Instigator, SensorData, Tick, TickStatus,
};
use crate::store::{StoreError, Storage};

/// Shared handles every tick needs
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<dyn Storage>,
    pub lock: StateLock,
    pub clock: Arc<dyn Clock>,
    pub retention: TickRetention,
}

impl Services {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            lock: StateLock::new(),
            clock,
            retention: TickRetention::default(),
        }
    }

    pub fn with_retention(mut self, retention: TickRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_lock(mut self, lock: StateLock) -> Self {
        self.lock = lock;
        self
    }
}

pub struct TickContext {
    tick: Tick,
    instigator_name: String,
    min_interval_seconds: Option<u64>,
    services: Services,
    /// Commit the cursor even if the tick fails
    update_cursor_on_failure: bool,
    interrupted: bool,
}

impl TickContext {
    pub fn new(tick: Tick, instigator: &Instigator, services: Services) -> Self {
        Self {
            tick,
            instigator_name: instigator.name.clone(),
            min_interval_seconds: instigator.min_interval_seconds,
            services,
            update_cursor_on_failure: false,
            interrupted: false,
        }
    }

    pub fn tick(&self) -> &Tick {
        &self.tick
    }

    pub fn status(&self) -> TickStatus {
        self.tick.status
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn update_cursor_on_failure(&self) -> bool {
        self.update_cursor_on_failure
    }

    /// Apply a value-returning tick transition
    pub fn map(mut self, f: impl FnOnce(Tick) -> Tick) -> Self {
        self.tick = f(self.tick);
        self
    }

    pub fn with_status(self, status: TickStatus) -> Self {
        self.map(|tick| tick.with_status(status))
    }

    /// Stage a cursor; `None` keeps the one the tick was created with
    pub fn with_cursor(self, cursor: Option<String>) -> Self {
        match cursor {
            Some(cursor) => self.map(|tick| tick.with_cursor(Some(cursor))),
            None => self,
        }
    }

    pub fn with_error(self, error: ErrorInfo) -> Self {
        self.map(|tick| tick.with_error(error))
    }

    pub fn with_partitions_result(self, result: DynamicPartitionsRequestResult) -> Self {
        self.map(|tick| tick.with_dynamic_partitions_request_result(result))
    }

    pub fn advance_cursor_on_failure(mut self) -> Self {
        self.update_cursor_on_failure = true;
        self
    }

    /// Record an error raised while evaluating.
    ///
    /// An interrupt leaves the tick as it is; anything else fails it.
    pub fn fail(mut self, err: anyhow::Error) -> Self {
        if matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Interrupted)) {
            self.interrupted = true;
            return self;
        }

        let info = ErrorInfo::from_error(&err);
        error!(
            sensor = %self.instigator_name,
            error = %info,
            "Sensor daemon caught an error for sensor"
        );
        self.with_status(TickStatus::Failure).with_error(info)
    }

    /// Persist the tick and, once it is terminal, the instigator state.
    ///
    /// Returns the written tick. Interrupted ticks are written as they stand
    /// and retention is skipped.
    pub async fn write(self) -> Result<Tick, EngineError> {
        let storage = &self.services.storage;
        storage.update_tick(&self.tick).await?;

        if !self.tick.is_finished() {
            return Ok(self.tick);
        }

        {
            let _guard = self.services.lock.lock().await;
            let state = storage
                .get_instigator_state(&self.tick.selector_id)
                .await?
                .ok_or_else(|| StoreError::StateNotFound(self.tick.selector_id.clone()))?;
            let previous = state.data.clone().unwrap_or_default();

            let commit = self.tick.status != TickStatus::Failure || self.update_cursor_on_failure;
            let last_run_key = match self.tick.run_keys.last() {
                Some(key) if commit => Some(key.clone()),
                _ => previous.last_run_key.clone(),
            };
            let cursor = if commit {
                self.tick.cursor.clone()
            } else {
                previous.cursor.clone()
            };
            let last_tick_start_timestamp = match previous.last_tick_start_timestamp {
                Some(start) => start.max(self.tick.timestamp),
                None => self.tick.timestamp,
            };

            let data = SensorData {
                last_tick_timestamp: Some(self.tick.timestamp),
                last_tick_start_timestamp: Some(last_tick_start_timestamp),
                last_run_key,
                cursor,
                min_interval_seconds: self.min_interval_seconds,
            };
            storage.update_instigator_state(state.with_data(data)).await?;
        }

        if !self.interrupted {
            self.purge().await?;
        }

        Ok(self.tick)
    }

    /// Drop expired ticks of every status that has a retention window
    async fn purge(&self) -> Result<(), EngineError> {
        let now = self.services.clock.now();
        for (days, statuses) in self.services.retention.statuses_by_offset() {
            let before = now - Duration::days(days);
            let purged = self
                .services
                .storage
                .purge_ticks(&self.tick.selector_id, before, &statuses)
                .await?;
            if purged > 0 {
                debug!(
                    sensor = %self.instigator_name,
                    purged,
                    statuses = ?statuses,
                    "Purged old ticks"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::domain::InstigatorOrigin;
    use crate::store::{InstigatorStore, MemoryStorage, TickStore};

    async fn setup(cursor: Option<&str>) -> (TickContext, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let sensor = Instigator::new("s", InstigatorOrigin::new("loc", "repo"));
        let state = sensor.initial_state().with_data(SensorData {
            cursor: cursor.map(str::to_string),
            last_run_key: Some("old".to_string()),
            ..Default::default()
        });
        storage.add_instigator_state(state).await.unwrap();

        let tick = Tick::started(sensor.selector_id(), &sensor.name, chrono::Utc::now())
            .with_cursor(cursor.map(str::to_string));
        let tick = storage.create_tick(tick).await.unwrap();
        let services = Services::new(storage.clone(), Arc::new(SystemClock));
        (TickContext::new(tick, &sensor, services), storage)
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_cursor() {
        let (ctx, storage) = setup(Some("c0")).await;
        let selector_id = ctx.tick().selector_id.clone();

        let tick = ctx
            .with_cursor(Some("c1".to_string()))
            .map(|t| t.with_run_info(None, Some("new".to_string())))
            .fail(anyhow::anyhow!("boom"))
            .write()
            .await
            .unwrap();
        assert_eq!(tick.status, TickStatus::Failure);

        let state = storage.get_instigator_state(&selector_id).await.unwrap().unwrap();
        assert_eq!(state.cursor(), Some("c0"));
        assert_eq!(state.last_run_key(), Some("old"));
        assert_eq!(state.data.unwrap().last_tick_timestamp, Some(tick.timestamp));
    }

    #[tokio::test]
    async fn test_failure_with_flag_advances_cursor() {
        let (ctx, storage) = setup(Some("c0")).await;
        let selector_id = ctx.tick().selector_id.clone();

        ctx.with_cursor(Some("c1".to_string()))
            .with_status(TickStatus::Failure)
            .advance_cursor_on_failure()
            .write()
            .await
            .unwrap();

        let state = storage.get_instigator_state(&selector_id).await.unwrap().unwrap();
        assert_eq!(state.cursor(), Some("c1"));
    }

    #[tokio::test]
    async fn test_interrupt_leaves_tick_started() {
        let (ctx, storage) = setup(None).await;
        let selector_id = ctx.tick().selector_id.clone();

        let ctx = ctx.fail(EngineError::Interrupted.into());
        assert!(ctx.is_interrupted());
        assert_eq!(ctx.status(), TickStatus::Started);

        let tick = ctx.write().await.unwrap();
        assert_eq!(tick.status, TickStatus::Started);

        let state = storage.get_instigator_state(&selector_id).await.unwrap().unwrap();
        assert!(state.data.unwrap().last_tick_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_missing_cursor_keeps_created_cursor() {
        let (ctx, storage) = setup(Some("c0")).await;
        let selector_id = ctx.tick().selector_id.clone();

        ctx.with_cursor(None)
            .with_status(TickStatus::Skipped)
            .write()
            .await
            .unwrap();

        let state = storage.get_instigator_state(&selector_id).await.unwrap().unwrap();
        assert_eq!(state.cursor(), Some("c0"));
    }
}
