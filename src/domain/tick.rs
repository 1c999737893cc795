//! Ticks: one record per evaluation attempt.
//!
//! A tick is created STARTED and moves exactly once to a terminal status.
//! Every transition returns a new value instead of mutating in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::partitions::DynamicPartitionsRequestResult;

/// Status of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    /// Evaluation in flight
    Started,

    /// Nothing to do this time
    Skipped,

    /// At least one run was created, or a reaction was recorded
    Success,

    /// Evaluation or a reaction failed
    Failure,
}

impl TickStatus {
    /// Terminal statuses never transition again
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// Serializable snapshot of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Top-level message
    pub message: String,

    /// Kind of error that was raised
    pub cls_name: Option<String>,

    /// Messages of the underlying causes, outermost first
    #[serde(default)]
    pub causes: Vec<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cls_name: None,
            causes: Vec::new(),
        }
    }

    /// Capture an error and its source chain
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            cls_name: Some("EvaluationError".to_string()),
            causes: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }

    pub fn with_cls_name(mut self, cls_name: impl Into<String>) -> Self {
        self.cls_name = Some(cls_name.into());
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// One evaluation attempt of one instigator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub tick_id: Uuid,

    /// Selector id of the instigator
    pub selector_id: String,

    pub instigator_name: String,

    pub status: TickStatus,

    /// When the attempt started
    pub timestamp: DateTime<Utc>,

    /// Cursor to commit once the tick finishes
    #[serde(default)]
    pub cursor: Option<String>,

    #[serde(default)]
    pub run_ids: Vec<Uuid>,

    #[serde(default)]
    pub run_keys: Vec<String>,

    #[serde(default)]
    pub skip_reason: Option<String>,

    #[serde(default)]
    pub error: Option<ErrorInfo>,

    /// Key of the captured evaluation logs
    #[serde(default)]
    pub log_key: Option<Vec<String>>,

    /// Runs this tick reacted to
    #[serde(default)]
    pub origin_run_ids: Vec<Uuid>,

    #[serde(default)]
    pub dynamic_partitions_request_results: Vec<DynamicPartitionsRequestResult>,
}

impl Tick {
    /// Create a STARTED tick
    pub fn started(
        selector_id: impl Into<String>,
        instigator_name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tick_id: Uuid::new_v4(),
            selector_id: selector_id.into(),
            instigator_name: instigator_name.into(),
            status: TickStatus::Started,
            timestamp,
            cursor: None,
            run_ids: Vec::new(),
            run_keys: Vec::new(),
            skip_reason: None,
            error: None,
            log_key: None,
            origin_run_ids: Vec::new(),
            dynamic_partitions_request_results: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: TickStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_reason(mut self, skip_reason: impl Into<String>) -> Self {
        self.skip_reason = Some(skip_reason.into());
        self
    }

    /// Record a run outcome; skipped runs contribute only their key
    pub fn with_run_info(mut self, run_id: Option<Uuid>, run_key: Option<String>) -> Self {
        if let Some(run_id) = run_id {
            if !self.run_ids.contains(&run_id) {
                self.run_ids.push(run_id);
            }
        }
        if let Some(run_key) = run_key {
            if !self.run_keys.contains(&run_key) {
                self.run_keys.push(run_key);
            }
        }
        self
    }

    pub fn with_log_key(mut self, log_key: Vec<String>) -> Self {
        self.log_key = Some(log_key);
        self
    }

    pub fn with_origin_run(mut self, run_id: Uuid) -> Self {
        if !self.origin_run_ids.contains(&run_id) {
            self.origin_run_ids.push(run_id);
        }
        self
    }

    pub fn with_dynamic_partitions_request_result(
        mut self,
        result: DynamicPartitionsRequestResult,
    ) -> Self {
        self.dynamic_partitions_request_results.push(result);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_tick_transitions_return_new_values() {
        let tick = Tick::started("sel", "sensor", Utc::now());
        assert!(!tick.is_finished());

        let done = tick
            .clone()
            .with_cursor(Some("c1".to_string()))
            .with_status(TickStatus::Skipped);
        assert_eq!(tick.status, TickStatus::Started);
        assert_eq!(done.status, TickStatus::Skipped);
        assert_eq!(done.cursor.as_deref(), Some("c1"));
    }

    #[test]
    fn test_run_info_keeps_order_without_duplicates() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tick = Tick::started("sel", "sensor", Utc::now())
            .with_run_info(Some(a), Some("k1".to_string()))
            .with_run_info(None, Some("k2".to_string()))
            .with_run_info(Some(b), None)
            .with_run_info(Some(a), Some("k1".to_string()));

        assert_eq!(tick.run_ids, vec![a, b]);
        assert_eq!(tick.run_keys, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn test_error_info_captures_chain() {
        let err = Err::<(), _>(std::io::Error::other("connection refused"))
            .context("failed to list bucket")
            .unwrap_err();
        let info = ErrorInfo::from_error(&err);

        assert_eq!(info.message, "failed to list bucket");
        assert_eq!(info.causes, vec!["connection refused".to_string()]);
        assert_eq!(info.to_string(), "failed to list bucket: connection refused");
    }
}
