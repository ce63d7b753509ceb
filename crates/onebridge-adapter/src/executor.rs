//! Outbound sends with bundled administrative side effects.
//!
//! A send runs its steps in a fixed order:
//! 1. translate the message (plus reply segment)
//! 2. recall, if requested; a failed recall aborts the send
//! 3. mention, prepended to the message
//! 4. mute, if requested; a failed mute aborts the send
//! 5. kick, if requested; a failed kick aborts the send
//! 6. the send itself; failure is recorded, not raised
//! 7. delayed recall of the sent message, in the background
//!
//! Every platform call is recorded in the result's step log.

use crate::translator::{mention_segment, reply_segment, to_wire};
use onebridge_types::error::{BridgeError, BridgeResult};
use onebridge_types::message::{ChatAddress, ChatKind, UnifiedMessage};
use onebridge_types::operation::{SendOptions, SendResult, StepLog, StepRecord, UserOperation};
use onebridge_wire::api;
use onebridge_wire::event::Segment;
use onebridge_wire::tasks::TaskSet;
use onebridge_wire::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Administrative operations outside of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum AdminOperation {
    Mute {
        group_id: i64,
        user_id: i64,
        duration_secs: u64,
    },
    Unmute {
        group_id: i64,
        user_id: i64,
    },
    Kick {
        group_id: i64,
        user_id: i64,
    },
    Recall {
        message_id: i64,
        #[serde(default)]
        delay_secs: u64,
    },
}

/// Runs sends and admin operations against a transport.
#[derive(Clone)]
pub struct OperationExecutor {
    transport: Arc<dyn Transport>,
    tasks: TaskSet,
}

fn group_only(action: &str, target: ChatAddress) -> Result<i64, String> {
    match target.kind {
        ChatKind::Group => Ok(target.id),
        ChatKind::Private => Err(format!("{action} requires a group target, got {target}")),
    }
}

impl OperationExecutor {
    pub fn new(transport: Arc<dyn Transport>, tasks: TaskSet) -> Self {
        Self { transport, tasks }
    }

    /// Execute one send. Never fails; failures are reported in the result.
    pub async fn send(
        &self,
        self_id: i64,
        target: ChatAddress,
        message: &UnifiedMessage,
        options: SendOptions,
    ) -> SendResult {
        let mut result = SendResult::for_operation(&options.operation);
        let t = self.transport.as_ref();

        let mut segments = to_wire(message);
        let mut head = 0;
        if let Some(reply_to) = options.reply_to {
            segments.insert(0, reply_segment(reply_to));
            head = 1;
        }

        if let UserOperation::Recall {
            message_id: Some(message_id),
        } = options.operation
        {
            match api::delete_msg(t, self_id, message_id).await {
                Ok(data) => {
                    result.raw_results.push(StepRecord::ok(api::DELETE_MSG, data));
                    result.recalled_message_id = Some(message_id);
                }
                Err(e) => {
                    warn!(self_id, message_id, error = %e, "Recall failed, not sending");
                    result.fail(api::DELETE_MSG, e.to_string());
                    return result;
                }
            }
            if message.is_empty() {
                return result;
            }
        }

        let mut side_effect_done = false;
        match options.operation {
            UserOperation::Mention {
                user_id: Some(user_id),
            } => {
                segments.insert(head, Segment::text(" "));
                segments.insert(head, mention_segment(user_id));
            }
            UserOperation::Mute {
                user_id: Some(user_id),
                duration_secs,
            } => {
                let outcome = match group_only(api::SET_GROUP_BAN, target) {
                    Ok(group_id) => {
                        api::set_group_ban(t, self_id, group_id, user_id, duration_secs)
                            .await
                            .map_err(|e| e.to_string())
                    }
                    Err(reason) => Err(reason),
                };
                match outcome {
                    Ok(data) => {
                        result.raw_results.push(StepRecord::ok(api::SET_GROUP_BAN, data));
                        side_effect_done = true;
                    }
                    Err(reason) => {
                        warn!(self_id, user_id, error = %reason, "Mute failed, not sending");
                        result.fail(api::SET_GROUP_BAN, reason);
                        return result;
                    }
                }
            }
            UserOperation::Kick { user_id } => {
                let outcome = match (group_only(api::SET_GROUP_KICK, target), user_id) {
                    (Ok(group_id), Some(user_id)) => {
                        api::set_group_kick(t, self_id, group_id, user_id)
                            .await
                            .map_err(|e| e.to_string())
                    }
                    (Err(reason), _) => Err(reason),
                    (Ok(_), None) => Err("kick requires a target user".to_string()),
                };
                match outcome {
                    Ok(data) => {
                        result.raw_results.push(StepRecord::ok(api::SET_GROUP_KICK, data));
                        side_effect_done = true;
                    }
                    Err(reason) => {
                        warn!(self_id, user_id = ?user_id, error = %reason, "Kick failed, not sending");
                        result.fail(api::SET_GROUP_KICK, reason);
                        return result;
                    }
                }
            }
            _ => {}
        }

        let send_action = match target.kind {
            ChatKind::Private => api::SEND_PRIVATE_MSG,
            ChatKind::Group => api::SEND_GROUP_MSG,
        };
        if segments.is_empty() {
            // A mute or kick with no accompanying text has nothing left to send.
            if !side_effect_done {
                result.fail(send_action, "message has no sendable segments");
            }
            return result;
        }

        let sent = match target.kind {
            ChatKind::Private => api::send_private_msg(t, self_id, target.id, &segments).await,
            ChatKind::Group => api::send_group_msg(t, self_id, target.id, &segments).await,
        };
        match sent {
            Ok(data) => {
                result.message_id = api::message_id(&data);
                result.raw_results.push(StepRecord::ok(send_action, data));
                debug!(self_id, target = %target, message_id = ?result.message_id, "Message sent");
            }
            Err(e) => {
                warn!(self_id, target = %target, error = %e, "Send failed");
                result.fail(send_action, e.to_string());
            }
        }

        if let (Some(delay), Some(message_id)) = (options.recall_after, result.message_id) {
            self.schedule_recall(self_id, message_id, delay, result.raw_results.clone());
        }

        result
    }

    /// Recall `message_id` after `delay` in the background, appending the
    /// outcome to `log`.
    fn schedule_recall(&self, self_id: i64, message_id: i64, delay: Duration, log: StepLog) {
        let transport = Arc::clone(&self.transport);
        let spawned = self.tasks.spawn(format!("delayed-recall-{message_id}"), async move {
            tokio::time::sleep(delay).await;
            match api::delete_msg(transport.as_ref(), self_id, message_id).await {
                Ok(data) => {
                    debug!(self_id, message_id, "Delayed recall done");
                    log.push(StepRecord::ok(api::DELETE_MSG, data));
                }
                Err(e) => {
                    warn!(self_id, message_id, error = %e, "Delayed recall failed");
                    log.push(StepRecord::failed(api::DELETE_MSG, e.to_string()));
                }
            }
        });
        if !spawned {
            warn!(message_id, "Adapter is shutting down, delayed recall dropped");
        }
    }

    /// Run one administrative operation.
    pub async fn execute_admin(&self, self_id: i64, operation: AdminOperation) -> BridgeResult<()> {
        let t = self.transport.as_ref();
        let (action, outcome) = match operation {
            AdminOperation::Mute {
                group_id,
                user_id,
                duration_secs,
            } => (
                api::SET_GROUP_BAN,
                api::set_group_ban(t, self_id, group_id, user_id, duration_secs).await,
            ),
            AdminOperation::Unmute { group_id, user_id } => (
                api::SET_GROUP_BAN,
                api::set_group_ban(t, self_id, group_id, user_id, 0).await,
            ),
            AdminOperation::Kick { group_id, user_id } => (
                api::SET_GROUP_KICK,
                api::set_group_kick(t, self_id, group_id, user_id).await,
            ),
            AdminOperation::Recall {
                message_id,
                delay_secs,
            } => {
                if delay_secs > 0 {
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                }
                (
                    api::DELETE_MSG,
                    api::delete_msg(t, self_id, message_id).await,
                )
            }
        };

        match outcome {
            Ok(_) => {
                info!(self_id, action, ?operation, "Admin operation done");
                Ok(())
            }
            Err(e) => {
                warn!(self_id, action, ?operation, error = %e, "Admin operation failed");
                Err(BridgeError::Operation {
                    action: action.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use onebridge_types::message::MessageElement;
    use onebridge_types::operation::OperationType;
    use onebridge_wire::transport::EventStream;
    use onebridge_wire::WireError;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every call; actions listed in `failing` return an error.
    #[derive(Default)]
    struct ScriptedTransport {
        calls: Mutex<Vec<(String, Value)>>,
        failing: HashSet<&'static str>,
    }

    impl ScriptedTransport {
        fn failing(actions: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                failing: actions.iter().copied().collect(),
                ..Self::default()
            })
        }

        fn actions(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(a, _)| a.clone()).collect()
        }

        fn params(&self, index: usize) -> Value {
            self.calls.lock().unwrap()[index].1.clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&self, _tasks: &TaskSet) -> Result<EventStream, WireError> {
            Ok(Box::pin(futures::stream::empty::<onebridge_wire::event::WireEvent>()))
        }

        async fn call_action(
            &self,
            _self_id: i64,
            action: &str,
            params: Value,
        ) -> Result<Value, WireError> {
            self.calls
                .lock()
                .unwrap()
                .push((action.to_string(), params));
            if self.failing.contains(action) {
                return Err(WireError::ActionFailed {
                    action: action.to_string(),
                    retcode: 100,
                    message: "denied".to_string(),
                });
            }
            if action.starts_with("send_") {
                Ok(json!({"message_id": 1000}))
            } else {
                Ok(Value::Null)
            }
        }
    }

    fn executor(transport: Arc<ScriptedTransport>) -> OperationExecutor {
        OperationExecutor::new(transport, TaskSet::new())
    }

    fn hello() -> UnifiedMessage {
        UnifiedMessage::from_text(ChatAddress::group(100), "hello")
    }

    #[tokio::test]
    async fn test_plain_group_send() {
        let t = ScriptedTransport::failing(&[]);
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), SendOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(result.message_id, Some(1000));
        assert_eq!(result.operation_type, OperationType::None);
        assert_eq!(t.actions(), vec!["send_group_msg"]);
        assert_eq!(t.params(0)["group_id"], 100);
    }

    #[tokio::test]
    async fn test_private_send_with_reply() {
        let t = ScriptedTransport::failing(&[]);
        let options = SendOptions {
            reply_to: Some(77),
            ..SendOptions::default()
        };
        executor(t.clone())
            .send(1, ChatAddress::private(9), &hello(), options)
            .await;
        assert_eq!(t.actions(), vec!["send_private_msg"]);
        let params = t.params(0);
        assert_eq!(params["user_id"], 9);
        assert_eq!(params["message"][0]["type"], "reply");
        assert_eq!(params["message"][0]["data"]["id"], "77");
        assert_eq!(params["message"][1]["type"], "text");
    }

    #[tokio::test]
    async fn test_recall_only_skips_send() {
        let t = ScriptedTransport::failing(&[]);
        let empty = UnifiedMessage::new(ChatAddress::group(100), vec![]);
        let options = SendOptions::with_operation(UserOperation::Recall {
            message_id: Some(55),
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &empty, options)
            .await;
        assert!(result.success);
        assert_eq!(result.recalled_message_id, Some(55));
        assert_eq!(result.message_id, None);
        assert_eq!(t.actions(), vec!["delete_msg"]);
    }

    #[tokio::test]
    async fn test_recall_then_send() {
        let t = ScriptedTransport::failing(&[]);
        let options = SendOptions::with_operation(UserOperation::Recall {
            message_id: Some(55),
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(result.success);
        assert_eq!(t.actions(), vec!["delete_msg", "send_group_msg"]);
        assert_eq!(result.raw_results.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_recall_blocks_send() {
        let t = ScriptedTransport::failing(&["delete_msg"]);
        let options = SendOptions::with_operation(UserOperation::Recall {
            message_id: Some(55),
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("denied"));
        assert_eq!(result.recalled_message_id, None);
        assert_eq!(t.actions(), vec!["delete_msg"]);
    }

    #[tokio::test]
    async fn test_mention_is_prepended_after_reply() {
        let t = ScriptedTransport::failing(&[]);
        let options = SendOptions {
            reply_to: Some(3),
            operation: UserOperation::Mention { user_id: Some(42) },
            ..SendOptions::default()
        };
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert_eq!(result.target_user_id, Some(42));
        let message = t.params(0)["message"].clone();
        let kinds: Vec<&str> = message
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["reply", "at", "text", "text"]);
        assert_eq!(message[1]["data"]["qq"], "42");
        assert_eq!(message[2]["data"]["text"], " ");
    }

    #[tokio::test]
    async fn test_mute_then_send() {
        let t = ScriptedTransport::failing(&[]);
        let options = SendOptions::with_operation(UserOperation::Mute {
            user_id: Some(7),
            duration_secs: 600,
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(result.success);
        assert_eq!(result.operation_duration, Some(600));
        assert_eq!(t.actions(), vec!["set_group_ban", "send_group_msg"]);
        assert_eq!(t.params(0)["duration"], 600);
    }

    #[tokio::test]
    async fn test_failed_mute_blocks_send() {
        let t = ScriptedTransport::failing(&["set_group_ban"]);
        let options = SendOptions::with_operation(UserOperation::Mute {
            user_id: Some(7),
            duration_secs: 60,
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("set_group_ban"));
        assert_eq!(t.actions(), vec!["set_group_ban"]);
    }

    #[tokio::test]
    async fn test_mute_on_private_target_is_blocking() {
        let t = ScriptedTransport::failing(&[]);
        let options = SendOptions::with_operation(UserOperation::Mute {
            user_id: Some(7),
            duration_secs: 60,
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::private(7), &hello(), options)
            .await;
        assert!(!result.success);
        assert!(t.actions().is_empty());
    }

    #[tokio::test]
    async fn test_mute_without_user_is_skipped() {
        let t = ScriptedTransport::failing(&[]);
        let options = SendOptions::with_operation(UserOperation::Mute {
            user_id: None,
            duration_secs: 60,
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(result.success);
        assert_eq!(t.actions(), vec!["send_group_msg"]);
    }

    #[tokio::test]
    async fn test_failed_kick_blocks_send() {
        let t = ScriptedTransport::failing(&["set_group_kick"]);
        let options = SendOptions::with_operation(UserOperation::Kick { user_id: Some(7) });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(!result.success);
        assert_eq!(t.actions(), vec!["set_group_kick"]);
    }

    #[tokio::test]
    async fn test_kick_without_text_returns_after_kick() {
        let t = ScriptedTransport::failing(&[]);
        let empty = UnifiedMessage::new(ChatAddress::group(100), vec![]);
        let options = SendOptions::with_operation(UserOperation::Kick { user_id: Some(7) });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &empty, options)
            .await;
        assert!(result.success);
        assert_eq!(t.actions(), vec!["set_group_kick"]);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_earlier_steps() {
        let t = ScriptedTransport::failing(&["send_group_msg"]);
        let options = SendOptions::with_operation(UserOperation::Recall {
            message_id: Some(55),
        });
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("send_group_msg"));
        let steps = result.raw_results.snapshot();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].is_ok());
        assert_eq!(steps[0].action, "delete_msg");
        assert!(!steps[1].is_ok());
    }

    #[tokio::test]
    async fn test_empty_plain_send_fails() {
        let t = ScriptedTransport::failing(&[]);
        let msg = UnifiedMessage::new(
            ChatAddress::group(100),
            vec![MessageElement::mention("not-a-number")],
        );
        let result = executor(t.clone())
            .send(1, ChatAddress::group(100), &msg, SendOptions::default())
            .await;
        assert!(!result.success);
        assert!(t.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_recall_appends_to_log() {
        let t = ScriptedTransport::failing(&[]);
        let tasks = TaskSet::new();
        let exec = OperationExecutor::new(t.clone(), tasks.clone());
        let options = SendOptions {
            recall_after: Some(Duration::from_secs(30)),
            ..SendOptions::default()
        };
        let result = exec
            .send(1, ChatAddress::group(100), &hello(), options)
            .await;
        assert!(result.success);
        assert_eq!(result.raw_results.len(), 1);
        assert_eq!(tasks.active(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(t.actions(), vec!["send_group_msg", "delete_msg"]);
        assert_eq!(t.params(1)["message_id"], 1000);
        assert_eq!(result.raw_results.len(), 2);
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let t = ScriptedTransport::failing(&[]);
        let exec = executor(t.clone());
        exec.execute_admin(
            1,
            AdminOperation::Mute {
                group_id: 100,
                user_id: 7,
                duration_secs: 60,
            },
        )
        .await
        .unwrap();
        exec.execute_admin(
            1,
            AdminOperation::Unmute {
                group_id: 100,
                user_id: 7,
            },
        )
        .await
        .unwrap();
        exec.execute_admin(1, AdminOperation::Kick { group_id: 100, user_id: 7 })
            .await
            .unwrap();
        exec.execute_admin(
            1,
            AdminOperation::Recall {
                message_id: 5,
                delay_secs: 0,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            t.actions(),
            vec!["set_group_ban", "set_group_ban", "set_group_kick", "delete_msg"]
        );
        assert_eq!(t.params(1)["duration"], 0);
    }

    #[tokio::test]
    async fn test_admin_failure_is_operation_error() {
        let t = ScriptedTransport::failing(&["set_group_kick"]);
        let err = executor(t)
            .execute_admin(1, AdminOperation::Kick { group_id: 1, user_id: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Operation { ref action, .. } if action == "set_group_kick"));
    }

    #[test]
    fn test_admin_operation_deserializes() {
        let op: AdminOperation =
            serde_json::from_value(json!({"operation": "recall", "message_id": 9})).unwrap();
        assert_eq!(
            op,
            AdminOperation::Recall {
                message_id: 9,
                delay_secs: 0
            }
        );
    }
}
