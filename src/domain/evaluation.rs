//! Inputs to and outputs from a sensor evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instigator::InstigatorState;
use super::partitions::DynamicPartitionsRequest;
use super::run::{RunRequest, RunStatus};
use super::tick::ErrorInfo;

/// What the evaluator is told about previous ticks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub last_tick_timestamp: Option<DateTime<Utc>>,
    pub last_run_key: Option<String>,
    pub cursor: Option<String>,
}

impl EvaluationContext {
    pub fn from_state(state: &InstigatorState) -> Self {
        match &state.data {
            Some(data) => Self {
                last_tick_timestamp: data.last_tick_timestamp,
                last_run_key: data.last_run_key.clone(),
                cursor: data.cursor.clone(),
            },
            None => Self::default(),
        }
    }
}

/// A run-status sensor's acknowledgement of an existing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReaction {
    pub run_id: Uuid,

    /// Status the sensor observed (may differ from the run's status now)
    #[serde(default)]
    pub run_status: Option<RunStatus>,

    /// Set when the reaction itself failed
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// Result of one evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorExecutionData {
    #[serde(default)]
    pub run_requests: Vec<RunRequest>,

    #[serde(default)]
    pub dynamic_partitions_requests: Vec<DynamicPartitionsRequest>,

    #[serde(default)]
    pub run_reactions: Vec<RunReaction>,

    #[serde(default)]
    pub skip_message: Option<String>,

    /// Cursor to commit; `None` leaves the stored cursor untouched
    #[serde(default)]
    pub cursor: Option<String>,

    #[serde(default)]
    pub captured_log_key: Option<Vec<String>>,
}

impl SensorExecutionData {
    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            skip_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_run_requests(run_requests: Vec<RunRequest>) -> Self {
        Self {
            run_requests,
            ..Default::default()
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_partitions_request(mut self, request: DynamicPartitionsRequest) -> Self {
        self.dynamic_partitions_requests.push(request);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_evaluator_output() {
        let json = r#"{
            "run_requests": [{"run_key": "k1", "tags": {"owner": "data"}}],
            "dynamic_partitions_requests": [
                {"action": "add", "partitions_def_name": "files", "partition_keys": ["a.csv"]}
            ],
            "cursor": "42"
        }"#;

        let data: SensorExecutionData = serde_json::from_str(json).unwrap();
        assert_eq!(data.run_requests.len(), 1);
        assert_eq!(data.dynamic_partitions_requests.len(), 1);
        assert_eq!(data.cursor.as_deref(), Some("42"));
        assert!(data.skip_message.is_none());
    }
}
