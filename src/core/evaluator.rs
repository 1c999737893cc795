//! The tick engine: one evaluation of one instigator, end to end.
//!
//! claim → create tick → evaluate → partitions → runs or reactions → write.
//!
//! Evaluation and storage errors are folded into the tick as FAILURE. Only a
//! simulated crash escapes before the write, and an interrupt escapes after it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info};

use super::context::{Services, TickContext};
use super::crash::{CrashPoint, DebugCrashFlags};
use super::heartbeat::{Heartbeat, TickStep};
use super::partitions::apply_partitions_request;
use super::runs::{dedup_requests, fetch_existing_runs, RunOutcome, RunSubmitter};
use super::throttle::try_claim;
use super::EngineError;
use crate::adapters::{ExecutionBackend, SensorEvaluator};
use crate::domain::{
    EvaluationContext, Instigator, InstigatorState, SensorExecutionData, Tick, TickStatus,
};

pub struct TickEngine {
    services: Services,
    evaluator: Arc<dyn SensorEvaluator>,
    submitter: RunSubmitter,
    crash_flags: Arc<DebugCrashFlags>,
    heartbeat: Heartbeat,
}

impl TickEngine {
    pub fn new(
        services: Services,
        evaluator: Arc<dyn SensorEvaluator>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            services,
            evaluator,
            submitter: RunSubmitter::new(backend),
            crash_flags: Arc::new(DebugCrashFlags::default()),
            heartbeat: Heartbeat::disabled(),
        }
    }

    pub fn with_crash_flags(mut self, flags: DebugCrashFlags) -> Self {
        let flags = Arc::new(flags);
        self.submitter = self.submitter.with_crash_flags(Arc::clone(&flags));
        self.crash_flags = flags;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.submitter = self.submitter.with_heartbeat(heartbeat.clone());
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_submit_workers(mut self, workers: usize) -> Self {
        self.submitter = self.submitter.with_submit_workers(workers);
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Evaluate one instigator unless it is throttled.
    ///
    /// Returns the written tick, or `None` when the instigator was stopped or
    /// another evaluation claimed the window first.
    pub async fn process_tick(
        &self,
        instigator: &Arc<Instigator>,
    ) -> Result<Option<Tick>, EngineError> {
        let storage = &self.services.storage;
        let claim = try_claim(
            storage.as_ref(),
            &self.services.lock,
            instigator,
            self.services.clock.as_ref(),
        )
        .await?;
        let Some(claim) = claim else {
            debug!(sensor = %instigator.name, "Sensor is stopped or under its minimum interval");
            return Ok(None);
        };
        self.heartbeat.step(&instigator.name, TickStep::Claimed);

        let tick = Tick::started(instigator.selector_id(), &instigator.name, claim.now)
            .with_cursor(claim.state.cursor().map(str::to_string));
        let tick = storage.create_tick(tick).await?;

        self.crash_flags
            .check(&instigator.name, CrashPoint::TickCreated)?;
        self.crash_flags
            .check(&instigator.name, CrashPoint::TickHeld)?;

        let ctx = TickContext::new(tick, instigator, self.services.clone());
        let ctx = self.evaluate(ctx, instigator, &claim.state).await?;

        let interrupted = ctx.is_interrupted();
        let tick = ctx.write().await?;
        self.heartbeat.step(&instigator.name, TickStep::Written);

        if interrupted {
            return Err(EngineError::Interrupted);
        }
        Ok(Some(tick))
    }

    async fn evaluate(
        &self,
        ctx: TickContext,
        instigator: &Arc<Instigator>,
        state: &InstigatorState,
    ) -> Result<TickContext, EngineError> {
        info!(sensor = %instigator.name, "Checking for new runs for sensor");

        let context = EvaluationContext::from_state(state);
        let evaluation = AssertUnwindSafe(self.evaluator.evaluate(instigator, &context))
            .catch_unwind()
            .await;
        let data = match evaluation {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => return Ok(ctx.fail(e)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                return Ok(ctx.fail(anyhow::anyhow!("Sensor panicked: {}", message)));
            }
        };
        self.heartbeat.step(&instigator.name, TickStep::Evaluated);

        let mut ctx = match data.captured_log_key.clone() {
            Some(log_key) => ctx.map(|tick| tick.with_log_key(log_key)),
            None => ctx,
        };

        // Partitions must exist before any run that targets them
        for request in &data.dynamic_partitions_requests {
            match apply_partitions_request(self.services.storage.as_ref(), request).await {
                Ok(result) => ctx = ctx.with_partitions_result(result),
                Err(e) => return Ok(ctx.fail(e.into())),
            }
        }
        if !data.dynamic_partitions_requests.is_empty() {
            self.heartbeat
                .step(&instigator.name, TickStep::PartitionsApplied);
        }

        if data.run_requests.is_empty() {
            return Ok(self.finish_without_runs(ctx, instigator, data).await);
        }
        self.finish_with_runs(ctx, instigator, data).await
    }

    /// Reactions, an explicit skip, or nothing at all
    async fn finish_without_runs(
        &self,
        mut ctx: TickContext,
        instigator: &Instigator,
        data: SensorExecutionData,
    ) -> TickContext {
        let storage = &self.services.storage;

        if data.run_reactions.is_empty() {
            return match data.skip_message {
                Some(message) => {
                    info!(sensor = %instigator.name, reason = %message, "Sensor skipped");
                    ctx.with_status(TickStatus::Skipped)
                        .map(|tick| tick.with_reason(message))
                        .with_cursor(data.cursor)
                }
                None => {
                    info!(sensor = %instigator.name, "No run requests returned, skipping");
                    ctx.with_status(TickStatus::Skipped).with_cursor(data.cursor)
                }
            };
        }

        for reaction in &data.run_reactions {
            let run_id = reaction.run_id;
            if let Some(err) = &reaction.error {
                error!(
                    sensor = %instigator.name,
                    run_id = %run_id,
                    error = %err,
                    "Got a reaction request for run but execution errored"
                );
                // Reactions have side effects, so the cursor moves even on failure
                ctx = ctx
                    .with_status(TickStatus::Failure)
                    .with_cursor(data.cursor.clone())
                    .with_error(err.clone())
                    .advance_cursor_on_failure();
                continue;
            }

            let status = match reaction.run_status {
                Some(status) => status.to_string(),
                None => match storage.get_run(run_id).await {
                    Ok(Some(run)) => run.status.to_string(),
                    Ok(None) => "UNKNOWN".to_string(),
                    Err(e) => return ctx.fail(EngineError::from(e).into()),
                },
            };
            let message = format!(
                "Sensor \"{}\" acted on run status {} of run {}.",
                instigator.name, status, run_id
            );
            if let Err(e) = storage.report_run_event(run_id, &message).await {
                return ctx.fail(EngineError::from(e).into());
            }
            info!(sensor = %instigator.name, run_id = %run_id, "Completed a reaction request for run");

            // A failed reaction keeps the tick failed
            if ctx.status() != TickStatus::Failure {
                ctx = ctx
                    .with_status(TickStatus::Success)
                    .with_cursor(data.cursor.clone());
            }
            ctx = ctx.map(|tick| tick.with_origin_run(run_id));
        }
        ctx
    }

    async fn finish_with_runs(
        &self,
        mut ctx: TickContext,
        instigator: &Arc<Instigator>,
        data: SensorExecutionData,
    ) -> Result<TickContext, EngineError> {
        let existing = match fetch_existing_runs(
            self.services.storage.as_ref(),
            instigator,
            &data.run_requests,
        )
        .await
        {
            Ok(existing) => existing,
            Err(e) => return Ok(ctx.fail(e.into())),
        };

        let requests = dedup_requests(data.run_requests);
        let results = self.submitter.submit_all(instigator, existing, requests).await;

        if let Some(crash) = results
            .iter()
            .find_map(|r| match r {
                Err(EngineError::SimulatedCrash(point)) => Some(*point),
                _ => None,
            })
        {
            return Err(EngineError::SimulatedCrash(crash));
        }

        let mut first_error = None;
        let mut skipped_keys = Vec::new();
        for result in results {
            match result {
                Ok(outcome) => {
                    if let RunOutcome::Skipped { run_key, .. } = &outcome {
                        skipped_keys.push(run_key.clone());
                    }
                    let run_id = outcome.run_id();
                    let run_key = outcome.run_key().map(str::to_string);
                    ctx = ctx.map(|tick| tick.with_run_info(run_id, run_key));
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if !skipped_keys.is_empty() {
            info!(
                sensor = %instigator.name,
                count = skipped_keys.len(),
                run_keys = ?skipped_keys,
                "Skipping runs for sensor already completed with run keys"
            );
        }

        if let Some(e) = first_error {
            return Ok(ctx.fail(e.into()));
        }

        let status = if ctx.tick().run_ids.is_empty() {
            TickStatus::Skipped
        } else {
            TickStatus::Success
        };
        Ok(ctx.with_status(status).with_cursor(data.cursor))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
