//! Subprocess sensor evaluator.
//!
//! Runs the instigator's `command` argv, passing the evaluation context both as
//! environment variables and as JSON on stdin, and parses a
//! `SensorExecutionData` document from stdout. Empty output means "nothing to
//! do".
//!
//! Environment passed to the child:
//! - `SENSORD_SENSOR_NAME`
//! - `SENSORD_CURSOR` (when set)
//! - `SENSORD_LAST_RUN_KEY` (when set)
//! - `SENSORD_LAST_TICK_TIMESTAMP` (RFC 3339, when set)

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::SensorEvaluator;
use crate::domain::{EvaluationContext, Instigator, SensorExecutionData};

/// Evaluator that shells out to each instigator's command
pub struct CommandEvaluator {
    /// Upper bound for one evaluation
    timeout: Duration,
}

impl Default for CommandEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl CommandEvaluator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn execute_subprocess(
        &self,
        instigator: &Instigator,
        context: &EvaluationContext,
    ) -> Result<String> {
        let (program, args) = instigator
            .command
            .split_first()
            .with_context(|| format!("Sensor '{}' has no command", instigator.name))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("SENSORD_SENSOR_NAME", &instigator.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cursor) = &context.cursor {
            command.env("SENSORD_CURSOR", cursor);
        }
        if let Some(run_key) = &context.last_run_key {
            command.env("SENSORD_LAST_RUN_KEY", run_key);
        }
        if let Some(ts) = context.last_tick_timestamp {
            command.env("SENSORD_LAST_TICK_TIMESTAMP", ts.to_rfc3339());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn command for sensor '{}'", instigator.name))?;

        let input = serde_json::to_vec(context).context("Failed to serialize context")?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The child may exit without reading its input
                let _ = stdin.write_all(&input).await;
            }
        };

        let (_, output) = timeout(self.timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .with_context(|| {
            format!(
                "Sensor '{}' timed out after {:?}",
                instigator.name, self.timeout
            )
        })?;
        let output =
            output.with_context(|| format!("Failed to wait for sensor '{}'", instigator.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Sensor '{}' failed with exit code {}: {}",
                instigator.name,
                exit_code,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).context("Sensor output is not valid UTF-8")
    }
}

#[async_trait]
impl SensorEvaluator for CommandEvaluator {
    fn name(&self) -> &str {
        "command"
    }

    async fn evaluate(
        &self,
        instigator: &Instigator,
        context: &EvaluationContext,
    ) -> Result<SensorExecutionData> {
        let stdout = self.execute_subprocess(instigator, context).await?;
        if stdout.trim().is_empty() {
            return Ok(SensorExecutionData::default());
        }

        serde_json::from_str(stdout.trim())
            .with_context(|| format!("Failed to parse output of sensor '{}'", instigator.name))
    }
}
