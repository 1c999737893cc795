//! Run coordinator that queues submitted runs in storage.
//!
//! Creation writes a NOT_STARTED run; submission moves it to QUEUED, where an
//! external launcher would pick it up.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::ExecutionBackend;
use crate::domain::{NewRun, Run, RunStatus};
use crate::store::Storage;

pub struct QueuedRunCoordinator {
    storage: Arc<dyn Storage>,
}

impl QueuedRunCoordinator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ExecutionBackend for QueuedRunCoordinator {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let run = self
            .storage
            .add_run(Run::from_new_run(new_run))
            .await
            .context("Failed to create run")?;
        debug!(run_id = %run.run_id, job = %run.job_name, "Created run");
        Ok(run)
    }

    async fn submit_run(&self, run_id: Uuid) -> Result<()> {
        let run = self
            .storage
            .get_run(run_id)
            .await?
            .with_context(|| format!("Run not found: {}", run_id))?;

        if run.status != RunStatus::NotStarted {
            anyhow::bail!(
                "Run {} cannot be submitted from status {}",
                run_id,
                run.status
            );
        }

        self.storage
            .update_run_status(run_id, RunStatus::Queued)
            .await
            .with_context(|| format!("Failed to queue run {}", run_id))?;
        self.storage
            .report_run_event(run_id, "Run queued by sensor daemon")
            .await?;
        Ok(())
    }
}
