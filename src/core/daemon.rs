//! The sensor daemon loop.
//!
//! Every loop interval the daemon takes a workspace snapshot, works out which
//! instigators are running, and hands each unthrottled one to the tick engine,
//! either inline or on a bounded worker pool. At most one evaluation per
//! instigator is ever in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::evaluator::TickEngine;
use super::heartbeat::{Heartbeat, Progress};
use super::throttle::is_under_min_interval;
use super::EngineError;
use crate::config::DaemonSettings;
use crate::domain::{Instigator, InstigatorState, InstigatorStatus};
use crate::store::{CursorStore, StoreError};
use crate::workspace::{WorkspaceSnapshot, WorkspaceSource};

/// Cursor key of the global pause flag
pub const SENSOR_DAEMON_PAUSED_KEY: &str = "SENSOR_DAEMON_PAUSED";

/// Minimum spacing of the noisy per-iteration warnings
const VERBOSE_LOGS_INTERVAL_SECONDS: i64 = 60;

/// True iff the pause flag is set to "true"
pub async fn is_paused<S: CursorStore + ?Sized>(store: &S) -> Result<bool, StoreError> {
    Ok(store
        .get_cursor_value(SENSOR_DAEMON_PAUSED_KEY)
        .await?
        .as_deref()
        == Some("true"))
}

pub async fn set_paused<S: CursorStore + ?Sized>(store: &S, paused: bool) -> Result<(), StoreError> {
    let value = if paused { "true" } else { "false" };
    store.set_cursor_value(SENSOR_DAEMON_PAUSED_KEY, value).await
}

pub struct SensorDaemon {
    engine: Arc<TickEngine>,
    workspace: Arc<dyn WorkspaceSource>,
    loop_interval: Duration,
    heartbeat: Heartbeat,
    /// Worker pool; `None` evaluates inline
    workers: Option<Arc<Semaphore>>,
    in_flight: HashMap<String, JoinHandle<()>>,
    last_verbose_log: Option<DateTime<Utc>>,
}

impl SensorDaemon {
    pub fn new(
        engine: TickEngine,
        workspace: Arc<dyn WorkspaceSource>,
        settings: &DaemonSettings,
    ) -> Self {
        let engine = if settings.num_submit_workers > 0 {
            engine.with_submit_workers(settings.num_submit_workers)
        } else {
            engine
        };
        let workers = settings
            .use_threads
            .then(|| Arc::new(Semaphore::new(settings.num_workers.max(1))));

        Self {
            engine: Arc::new(engine),
            workspace,
            loop_interval: settings.loop_interval(),
            heartbeat: Heartbeat::disabled(),
            workers,
            in_flight: HashMap::new(),
            last_verbose_log: None,
        }
    }

    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn engine(&self) -> &TickEngine {
        &self.engine
    }

    /// Run until shutdown is signalled or the clock passes `until`.
    ///
    /// At least one iteration always runs, so `until = now` means "once".
    /// In-flight evaluations are awaited before returning.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        info!(
            loop_interval_ms = self.loop_interval.as_millis() as u64,
            threaded = self.workers.is_some(),
            "sensor daemon started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            match self.run_iteration().await {
                Ok(()) => {}
                Err(EngineError::Interrupted) => {
                    info!("sensor daemon interrupted");
                    self.wait_for_in_flight().await;
                    return Err(EngineError::Interrupted);
                }
                Err(e) => error!(error = %e, "Sensor daemon iteration failed"),
            }
            self.heartbeat.beat(Progress::Iteration);

            let clock = &self.engine.services().clock;
            if until.is_some_and(|until| clock.now() >= until) {
                break;
            }

            let remaining = self.loop_interval.saturating_sub(started.elapsed());
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can stop us anymore; stop now
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sensor daemon shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(remaining) => {}
            }
            self.heartbeat.beat(Progress::Woke);
        }

        self.wait_for_in_flight().await;
        Ok(())
    }

    /// One pass over every running instigator
    pub async fn run_iteration(&mut self) -> Result<(), EngineError> {
        self.reap_finished();

        let services = self.engine.services().clone();
        let storage = &services.storage;

        if is_paused(storage.as_ref()).await? {
            debug!("Sensor daemon is paused");
            return Ok(());
        }

        let now = services.clock.now();
        let verbose = match self.last_verbose_log {
            Some(last) => (now - last).num_seconds() >= VERBOSE_LOGS_INTERVAL_SECONDS,
            None => true,
        };
        if verbose {
            self.last_verbose_log = Some(now);
        }

        let snapshot = self.workspace.snapshot().await?;
        let states: HashMap<String, InstigatorState> = storage
            .all_instigator_states()
            .await?
            .into_iter()
            .map(|state| (state.selector_id.clone(), state))
            .collect();

        let mut running: Vec<Instigator> = Vec::new();
        for location in &snapshot.locations {
            if let Some(err) = &location.load_error {
                if verbose {
                    warn!(
                        location = %location.name,
                        error = %err,
                        "Could not load location to check for sensors"
                    );
                }
                continue;
            }
            for instigator in location.repositories.iter().flat_map(|r| &r.instigators) {
                let stored = states.get(&instigator.selector_id());
                if instigator.current_status(stored).is_running() {
                    running.push(instigator.clone());
                }
            }
        }

        if verbose {
            warn_unloadable_states(&snapshot, &states, &running);
        }

        if running.is_empty() {
            if verbose {
                debug!("Not checking for any runs since no sensors have been started");
            }
            return Ok(());
        }

        for instigator in running {
            let selector_id = instigator.selector_id();
            match states.get(&selector_id) {
                None => {
                    if let Err(e) = storage.add_instigator_state(instigator.initial_state()).await {
                        error!(sensor = %instigator.name, error = %e, "Failed to create sensor state");
                        continue;
                    }
                }
                Some(state) if is_under_min_interval(state, &instigator, services.clock.now()) => {
                    continue;
                }
                Some(_) => {}
            }

            self.dispatch(selector_id, Arc::new(instigator)).await?;
        }

        Ok(())
    }

    async fn dispatch(
        &mut self,
        selector_id: String,
        instigator: Arc<Instigator>,
    ) -> Result<(), EngineError> {
        let span = info_span!("sensor", name = %instigator.name);

        let Some(pool) = &self.workers else {
            return match self.engine.process_tick(&instigator).instrument(span).await {
                Err(EngineError::Interrupted) => Err(EngineError::Interrupted),
                Err(e) => {
                    error!(sensor = %instigator.name, error = %e, "Sensor evaluation failed");
                    Ok(())
                }
                Ok(_) => Ok(()),
            };
        };

        if let Some(handle) = self.in_flight.get(&selector_id) {
            if !handle.is_finished() {
                debug!(sensor = %instigator.name, "Sensor evaluation still in flight");
                return Ok(());
            }
        }

        let engine = Arc::clone(&self.engine);
        let pool = Arc::clone(pool);
        let handle = tokio::spawn(
            async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return;
                };
                match engine.process_tick(&instigator).await {
                    Ok(_) => {}
                    Err(EngineError::Interrupted) => {
                        info!(sensor = %instigator.name, "Sensor evaluation interrupted")
                    }
                    Err(e) => {
                        error!(sensor = %instigator.name, error = %e, "Sensor evaluation failed")
                    }
                }
            }
            .instrument(span),
        );
        self.in_flight.insert(selector_id, handle);
        Ok(())
    }

    fn reap_finished(&mut self) {
        self.in_flight.retain(|_, handle| !handle.is_finished());
    }

    /// Number of evaluations currently running on the pool
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Await every in-flight evaluation
    pub async fn wait_for_in_flight(&mut self) {
        for (selector_id, handle) in self.in_flight.drain() {
            if let Err(e) = handle.await {
                error!(selector_id = %selector_id, error = %e, "Sensor evaluation task failed");
            }
        }
    }
}

/// Explain running states whose instigator is missing from the workspace
fn warn_unloadable_states(
    snapshot: &WorkspaceSnapshot,
    states: &HashMap<String, InstigatorState>,
    running: &[Instigator],
) {
    for state in states.values() {
        if state.status != InstigatorStatus::Running
            || running.iter().any(|i| i.selector_id() == state.selector_id)
        {
            continue;
        }

        let location_name = &state.origin.location_name;
        let repository_name = &state.origin.repository_name;
        match snapshot.location(location_name) {
            None => warn!(
                sensor = %state.name,
                location = %location_name,
                "Sensor was started from a location that can no longer be found in the workspace"
            ),
            Some(location) if location.load_error.is_some() => {}
            Some(location) => match location.repository(repository_name) {
                None => warn!(
                    sensor = %state.name,
                    location = %location_name,
                    repository = %repository_name,
                    "Could not find repository in location to run sensor"
                ),
                Some(repository) => {
                    if !repository.instigators.iter().any(|i| i.name == state.name) {
                        warn!(
                            sensor = %state.name,
                            repository = %repository_name,
                            "Could not find sensor in repository"
                        );
                    }
                }
            },
        }
    }
}

/// Spawn a daemon on the runtime; send `true` to stop it
pub fn spawn_daemon(
    mut daemon: SensorDaemon,
) -> (JoinHandle<Result<(), EngineError>>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { daemon.run(shutdown_rx, None).await });
    (handle, shutdown_tx)
}
