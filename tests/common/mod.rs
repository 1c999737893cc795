//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use sensord::adapters::{ExecutionBackend, QueuedRunCoordinator, SensorEvaluator};
use sensord::config::TickRetention;
use sensord::core::{EngineError, ManualClock, Services, TickEngine};
use sensord::domain::{
    DefaultSensorStatus, EvaluationContext, Instigator, InstigatorOrigin, NewRun, Run,
    SensorExecutionData,
};
use sensord::store::{MemoryStorage, RunStore, Storage};

/// One scripted evaluation result
#[derive(Debug, Clone)]
pub enum Step {
    Data(SensorExecutionData),
    Fail(String),
    Interrupt,
    Panic(String),
}

/// Evaluator that replays a script, then returns empty data forever
#[derive(Default)]
pub struct ScriptedEvaluator {
    script: Mutex<VecDeque<Step>>,
    contexts: Mutex<Vec<EvaluationContext>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<EvaluationContext> {
        self.contexts.lock().unwrap().clone()
    }

    /// Highest number of overlapping evaluations seen
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorEvaluator for ScriptedEvaluator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn evaluate(
        &self,
        _instigator: &Instigator,
        context: &EvaluationContext,
    ) -> Result<SensorExecutionData> {
        self.contexts.lock().unwrap().push(context.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Data(data)) => Ok(data),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::Interrupt) => Err(EngineError::Interrupted.into()),
            Some(Step::Panic(message)) => panic!("{}", message),
            None => Ok(SensorExecutionData::default()),
        }
    }
}

/// Backend that creates runs normally but refuses to launch them
pub struct RejectingBackend {
    storage: Arc<dyn Storage>,
    inner: QueuedRunCoordinator,
    /// Only reject the run with this key; `None` rejects every run
    run_key: Option<String>,
}

impl RejectingBackend {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            inner: QueuedRunCoordinator::new(Arc::clone(&storage)),
            storage,
            run_key: None,
        }
    }

    pub fn only_run_key(mut self, run_key: &str) -> Self {
        self.run_key = Some(run_key.to_string());
        self
    }
}

#[async_trait]
impl ExecutionBackend for RejectingBackend {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        self.inner.create_run(new_run).await
    }

    async fn submit_run(&self, run_id: Uuid) -> Result<()> {
        let rejected = match &self.run_key {
            None => true,
            Some(key) => {
                let run = self.storage.get_run(run_id).await?;
                run.as_ref().and_then(Run::run_key) == Some(key.as_str())
            }
        };
        if rejected {
            anyhow::bail!("launcher unavailable for run {}", run_id)
        }
        self.inner.submit_run(run_id).await
    }
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn origin() -> InstigatorOrigin {
    InstigatorOrigin::new("analytics", "main")
}

/// A running sensor with a default job
pub fn sensor(name: &str) -> Instigator {
    Instigator::new(name, origin())
        .with_job_name("ingest")
        .with_default_status(DefaultSensorStatus::Running)
}

/// Everything a test needs to drive ticks by hand
pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub evaluator: Arc<ScriptedEvaluator>,
}

impl Harness {
    pub fn new(evaluator: ScriptedEvaluator) -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            clock: Arc::new(ManualClock::new(start_time())),
            evaluator: Arc::new(evaluator),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(self.storage.clone(), self.clock.clone())
            .with_retention(TickRetention::keep_all())
    }

    pub fn backend(&self) -> Arc<dyn ExecutionBackend> {
        Arc::new(QueuedRunCoordinator::new(self.storage.clone()))
    }

    pub fn engine(&self) -> TickEngine {
        TickEngine::new(self.services(), self.evaluator.clone(), self.backend())
    }
}
