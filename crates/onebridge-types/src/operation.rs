//! Outbound operation types and the structured result of a send.

use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The administrative side effect bundled with a send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Plain send.
    #[default]
    None,
    Mention,
    Mute,
    Recall,
    Kick,
}

/// An operation with its operation-specific payload.
///
/// Ids are optional because callers may request an operation without a
/// target; the executor decides per variant whether that skips the step or
/// fails it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UserOperation {
    #[default]
    None,
    /// Prepend a mention of the user to the message.
    Mention { user_id: Option<i64> },
    /// Mute the user in the target group before sending.
    Mute {
        user_id: Option<i64>,
        duration_secs: u64,
    },
    /// Recall an earlier message before sending.
    Recall { message_id: Option<i64> },
    /// Kick the user from the target group before sending.
    Kick { user_id: Option<i64> },
}

impl UserOperation {
    pub fn kind(&self) -> OperationType {
        match self {
            Self::None => OperationType::None,
            Self::Mention { .. } => OperationType::Mention,
            Self::Mute { .. } => OperationType::Mute,
            Self::Recall { .. } => OperationType::Recall,
            Self::Kick { .. } => OperationType::Kick,
        }
    }

    /// The user this operation targets, if any.
    pub fn target_user(&self) -> Option<i64> {
        match self {
            Self::Mention { user_id } | Self::Mute { user_id, .. } | Self::Kick { user_id } => {
                *user_id
            }
            Self::None | Self::Recall { .. } => None,
        }
    }

    /// Operation duration in seconds (mute only).
    pub fn duration_secs(&self) -> Option<u64> {
        match self {
            Self::Mute { duration_secs, .. } => Some(*duration_secs),
            _ => None,
        }
    }
}

/// Options for one outbound send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Message id to reply to.
    pub reply_to: Option<i64>,
    /// Recall the sent message after this delay.
    pub recall_after: Option<Duration>,
    /// Administrative side effect.
    pub operation: UserOperation,
}

impl SendOptions {
    pub fn with_operation(operation: UserOperation) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }
}

/// Outcome of one platform call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok { data: serde_json::Value },
    Failed { error: String },
}

/// One platform call made while executing a send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub action: String,
    pub outcome: StepOutcome,
}

impl StepRecord {
    pub fn ok(action: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            outcome: StepOutcome::Ok { data },
        }
    }

    pub fn failed(action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            outcome: StepOutcome::Failed {
                error: error.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, StepOutcome::Ok { .. })
    }
}

/// Append-only, shareable list of step records.
///
/// Cloning shares the same log, so a deferred task can keep appending after
/// the [`SendResult`] has been handed back to the caller.
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    records: Arc<Mutex<Vec<StepRecord>>>,
}

impl StepLog {
    pub fn push(&self, record: StepRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Copy of the records appended so far.
    pub fn snapshot(&self) -> Vec<StepRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for StepLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Structured result of one send operation.
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: Option<i64>,
    pub recalled_message_id: Option<i64>,
    pub target_user_id: Option<i64>,
    pub operation_type: OperationType,
    /// Operation duration in seconds.
    pub operation_duration: Option<u64>,
    pub error: Option<String>,
    pub raw_results: StepLog,
}

impl Default for SendResult {
    fn default() -> Self {
        Self {
            success: true,
            message_id: None,
            recalled_message_id: None,
            target_user_id: None,
            operation_type: OperationType::None,
            operation_duration: None,
            error: None,
            raw_results: StepLog::default(),
        }
    }
}

impl SendResult {
    /// Start a result for the given operation.
    pub fn for_operation(operation: &UserOperation) -> Self {
        Self {
            operation_type: operation.kind(),
            target_user_id: operation.target_user(),
            operation_duration: operation.duration_secs(),
            ..Self::default()
        }
    }

    /// Record a failed step. The first failure sets `success = false`.
    pub fn fail(&mut self, action: &str, error: impl Into<String>) {
        let error = error.into();
        self.raw_results.push(StepRecord::failed(action, error.clone()));
        if self.success {
            self.success = false;
            self.error = Some(error);
        }
    }

    /// Fail without a platform call having been made.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_and_payload() {
        let op = UserOperation::Mute {
            user_id: Some(7),
            duration_secs: 60,
        };
        assert_eq!(op.kind(), OperationType::Mute);
        assert_eq!(op.target_user(), Some(7));
        assert_eq!(op.duration_secs(), Some(60));

        let op = UserOperation::Recall {
            message_id: Some(1),
        };
        assert_eq!(op.kind(), OperationType::Recall);
        assert_eq!(op.target_user(), None);
    }

    #[test]
    fn test_result_defaults_to_success() {
        let result = SendResult::default();
        assert!(result.success);
        assert!(result.error.is_none());
        assert!(result.raw_results.is_empty());
    }

    #[test]
    fn test_first_failure_wins() {
        let mut result = SendResult::default();
        result.fail("set_group_ban", "first");
        result.fail("send_msg", "second");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("first"));
        assert_eq!(result.raw_results.len(), 2);
    }

    #[test]
    fn test_step_log_is_shared_between_clones() {
        let result = SendResult::default();
        let log = result.raw_results.clone();
        log.push(StepRecord::ok("delete_msg", serde_json::Value::Null));
        assert_eq!(result.raw_results.len(), 1);
        assert!(result.raw_results.snapshot()[0].is_ok());
    }

    #[test]
    fn test_result_serializes_steps() {
        let mut result = SendResult::for_operation(&UserOperation::Kick { user_id: Some(3) });
        result.fail("set_group_kick", "no permission");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["operation_type"], "kick");
        assert_eq!(json["target_user_id"], 3);
        assert_eq!(json["raw_results"][0]["action"], "set_group_kick");
        assert_eq!(json["raw_results"][0]["outcome"]["status"], "failed");
    }
}
