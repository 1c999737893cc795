//! Idempotent run creation and submission.
//!
//! Each run request resolves to exactly one of:
//! - a new run (no key, or a key never seen for this sensor)
//! - a reused NOT_STARTED run (an earlier tick crashed before submitting it)
//! - a skip (the keyed run already progressed past NOT_STARTED)
//!
//! Created and reused runs are then submitted. Submission failures stay with
//! the run they belong to and never affect sibling requests.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use super::crash::{CrashPoint, DebugCrashFlags};
use super::heartbeat::{Heartbeat, TickStep};
use super::EngineError;
use crate::adapters::ExecutionBackend;
use crate::domain::{
    hash_name, ErrorInfo, Instigator, NewRun, Run, RunRequest, RunStatus, RUN_KEY_TAG,
    SENSOR_NAME_TAG,
};
use crate::store::{RunStore, RunsFilter};

/// Telemetry action recorded for every sensor-created run
pub const SENSOR_RUN_CREATED: &str = "SENSOR_RUN_CREATED";

/// What happened to one run request
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run was created (or reused) and handed to the backend
    Submitted {
        run: Run,
        run_key: Option<String>,
        reused: bool,
        /// Set when the backend rejected the submission
        submit_error: Option<ErrorInfo>,
    },

    /// A run with this key already moved past NOT_STARTED
    Skipped { run_key: String, existing: Run },
}

impl RunOutcome {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Submitted { run, .. } => Some(run.run_id),
            Self::Skipped { .. } => None,
        }
    }

    pub fn run_key(&self) -> Option<&str> {
        match self {
            Self::Submitted { run_key, .. } => run_key.as_deref(),
            Self::Skipped { run_key, .. } => Some(run_key),
        }
    }
}

/// Runs previously created by this instigator, indexed by run key.
///
/// Runs without an origin match on sensor name alone; others must also come
/// from the instigator's repository.
pub async fn fetch_existing_runs<S: RunStore + ?Sized>(
    store: &S,
    instigator: &Instigator,
    requests: &[RunRequest],
) -> Result<HashMap<String, Run>, EngineError> {
    let run_keys: Vec<&str> = requests
        .iter()
        .filter_map(|r| r.run_key.as_deref())
        .collect();
    if run_keys.is_empty() {
        return Ok(HashMap::new());
    }

    let filter = RunsFilter::new().with_tag_values(RUN_KEY_TAG, run_keys);
    let repository_id = instigator.origin.repository_selector_id();

    let mut existing = HashMap::new();
    for run in store.get_runs(&filter).await? {
        if run.sensor_name() != Some(instigator.name.as_str()) {
            continue;
        }
        let same_repository = match &run.origin {
            Some(origin) => origin.repository_selector_id() == repository_id,
            None => true,
        };
        if !same_repository {
            continue;
        }
        if let Some(run_key) = run.run_key() {
            existing.entry(run_key.to_string()).or_insert(run);
        }
    }
    Ok(existing)
}

/// Drop repeated run keys within one evaluation, keeping the first
pub fn dedup_requests(requests: Vec<RunRequest>) -> Vec<RunRequest> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::with_capacity(requests.len());
    for request in requests {
        if let Some(run_key) = &request.run_key {
            if seen.contains(run_key) {
                info!(run_key = %run_key, "Dropping duplicate run request");
                continue;
            }
            seen.push(run_key.clone());
        }
        out.push(request);
    }
    out
}

/// Creation parameters for a request.
///
/// Tags merge in order: instigator tags, request tags, sensor tags, run key.
pub fn build_new_run(instigator: &Instigator, request: &RunRequest) -> anyhow::Result<NewRun> {
    let job_name = request
        .job_name
        .clone()
        .or_else(|| instigator.job_name.clone())
        .with_context(|| {
            format!(
                "Sensor '{}' requested a run without a job and has no default job",
                instigator.name
            )
        })?;

    let mut tags = instigator.tags.clone();
    tags.extend(request.tags.clone());
    tags.insert(SENSOR_NAME_TAG.to_string(), instigator.name.clone());
    if let Some(run_key) = &request.run_key {
        tags.insert(RUN_KEY_TAG.to_string(), run_key.clone());
    }

    Ok(NewRun {
        job_name,
        run_config: request.run_config.clone(),
        tags,
        origin: Some(instigator.origin.clone()),
        asset_selection: request.asset_selection.clone(),
    })
}

/// Creates and submits the runs of one tick
#[derive(Clone)]
pub struct RunSubmitter {
    backend: Arc<dyn ExecutionBackend>,
    crash_flags: Arc<DebugCrashFlags>,
    heartbeat: Heartbeat,
    /// Bounded pool for concurrent submission; `None` submits inline
    pool: Option<Arc<Semaphore>>,
    session_id: Uuid,
}

impl RunSubmitter {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            crash_flags: Arc::new(DebugCrashFlags::default()),
            heartbeat: Heartbeat::disabled(),
            pool: None,
            session_id: Uuid::new_v4(),
        }
    }

    pub fn with_crash_flags(mut self, flags: Arc<DebugCrashFlags>) -> Self {
        self.crash_flags = flags;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Submit on a pool of `workers` tasks (0 keeps submission inline)
    pub fn with_submit_workers(mut self, workers: usize) -> Self {
        self.pool = (workers > 0).then(|| Arc::new(Semaphore::new(workers)));
        self
    }

    /// Resolve and submit every request; results come back in request order
    pub async fn submit_all(
        &self,
        instigator: &Arc<Instigator>,
        existing: HashMap<String, Run>,
        requests: Vec<RunRequest>,
    ) -> Vec<Result<RunOutcome, EngineError>> {
        let existing = Arc::new(existing);

        let Some(pool) = &self.pool else {
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(self.submit_one(instigator, &existing, request).await);
            }
            return results;
        };

        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let submitter = self.clone();
            let instigator = Arc::clone(instigator);
            let existing = Arc::clone(&existing);
            let pool = Arc::clone(pool);
            let span = tracing::Span::current();

            handles.push(tokio::spawn(
                async move {
                    let _permit = pool
                        .acquire_owned()
                        .await
                        .map_err(|e| EngineError::Other(e.into()))?;
                    submitter.submit_one(&instigator, &existing, request).await
                }
                .instrument(span),
            ));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(EngineError::Other(
                    anyhow::Error::new(join_err).context("Run submission task failed"),
                )),
            });
        }
        results
    }

    async fn submit_one(
        &self,
        instigator: &Instigator,
        existing: &HashMap<String, Run>,
        request: RunRequest,
    ) -> Result<RunOutcome, EngineError> {
        let run_key = request.run_key.clone();
        let (run, reused) = match run_key.as_deref().and_then(|key| existing.get(key)) {
            Some(run) if run.status != RunStatus::NotStarted => {
                return Ok(RunOutcome::Skipped {
                    run_key: run_key.unwrap_or_default(),
                    existing: run.clone(),
                });
            }
            Some(run) => {
                info!(
                    sensor = %instigator.name,
                    run_id = %run.run_id,
                    run_key = ?run_key,
                    "Run already created with this run key"
                );
                (run.clone(), true)
            }
            None => {
                info!(sensor = %instigator.name, "Creating new run");
                (self.create_run(instigator, &request).await?, false)
            }
        };

        self.crash_flags
            .check(&instigator.name, CrashPoint::RunCreated)?;

        info!(sensor = %instigator.name, run_id = %run.run_id, "Launching run");
        let submit_error = match self.backend.submit_run(run.run_id).await {
            Ok(()) => {
                info!(sensor = %instigator.name, run_id = %run.run_id, "Completed launch of run");
                None
            }
            Err(e) => {
                let info = ErrorInfo::from_error(&e).with_cls_name("SubmitError");
                error!(
                    sensor = %instigator.name,
                    run_id = %run.run_id,
                    error = %info,
                    "Run created successfully but failed to launch"
                );
                Some(info)
            }
        };

        self.crash_flags
            .check(&instigator.name, CrashPoint::RunLaunched)?;
        self.heartbeat.step(&instigator.name, TickStep::RunProcessed);

        Ok(RunOutcome::Submitted {
            run,
            run_key,
            reused,
            submit_error,
        })
    }

    async fn create_run(
        &self,
        instigator: &Instigator,
        request: &RunRequest,
    ) -> Result<Run, EngineError> {
        let new_run = build_new_run(instigator, request)?;
        let job_name = new_run.job_name.clone();
        let run = self.backend.create_run(new_run).await?;

        info!(
            action = SENSOR_RUN_CREATED,
            daemon_session_id = %self.session_id,
            sensor_name_hash = %hash_name(&instigator.name),
            job_name_hash = %hash_name(&job_name),
            repo_hash = %hash_name(&instigator.origin.location_name),
            "telemetry"
        );
        Ok(run)
    }
}
