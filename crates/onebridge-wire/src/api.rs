//! Typed helpers for the OneBot actions the bridge issues.

use crate::event::Segment;
use crate::transport::{Transport, WireError};
use serde::Serialize;
use serde_json::Value;

pub const SEND_PRIVATE_MSG: &str = "send_private_msg";
pub const SEND_GROUP_MSG: &str = "send_group_msg";
pub const DELETE_MSG: &str = "delete_msg";
pub const SET_GROUP_BAN: &str = "set_group_ban";
pub const SET_GROUP_KICK: &str = "set_group_kick";

#[derive(Serialize)]
struct SendPrivateMsgParams<'a> {
    user_id: i64,
    message: &'a [Segment],
}

#[derive(Serialize)]
struct SendGroupMsgParams<'a> {
    group_id: i64,
    message: &'a [Segment],
}

#[derive(Serialize)]
struct DeleteMsgParams {
    message_id: i64,
}

#[derive(Serialize)]
struct SetGroupBanParams {
    group_id: i64,
    user_id: i64,
    /// Seconds; 0 lifts the mute.
    duration: u64,
}

#[derive(Serialize)]
struct SetGroupKickParams {
    group_id: i64,
    user_id: i64,
    reject_add_request: bool,
}

async fn call<P: Serialize>(
    transport: &dyn Transport,
    self_id: i64,
    action: &str,
    params: P,
) -> Result<Value, WireError> {
    let params = serde_json::to_value(params)?;
    transport.call_action(self_id, action, params).await
}

pub async fn send_private_msg(
    transport: &dyn Transport,
    self_id: i64,
    user_id: i64,
    message: &[Segment],
) -> Result<Value, WireError> {
    call(
        transport,
        self_id,
        SEND_PRIVATE_MSG,
        SendPrivateMsgParams { user_id, message },
    )
    .await
}

pub async fn send_group_msg(
    transport: &dyn Transport,
    self_id: i64,
    group_id: i64,
    message: &[Segment],
) -> Result<Value, WireError> {
    call(
        transport,
        self_id,
        SEND_GROUP_MSG,
        SendGroupMsgParams { group_id, message },
    )
    .await
}

pub async fn delete_msg(
    transport: &dyn Transport,
    self_id: i64,
    message_id: i64,
) -> Result<Value, WireError> {
    call(transport, self_id, DELETE_MSG, DeleteMsgParams { message_id }).await
}

pub async fn set_group_ban(
    transport: &dyn Transport,
    self_id: i64,
    group_id: i64,
    user_id: i64,
    duration: u64,
) -> Result<Value, WireError> {
    call(
        transport,
        self_id,
        SET_GROUP_BAN,
        SetGroupBanParams {
            group_id,
            user_id,
            duration,
        },
    )
    .await
}

pub async fn set_group_kick(
    transport: &dyn Transport,
    self_id: i64,
    group_id: i64,
    user_id: i64,
) -> Result<Value, WireError> {
    call(
        transport,
        self_id,
        SET_GROUP_KICK,
        SetGroupKickParams {
            group_id,
            user_id,
            reject_add_request: false,
        },
    )
    .await
}

/// Extract `message_id` from a send response's `data`.
pub fn message_id(data: &Value) -> Option<i64> {
    crate::event::field_i64(data, "message_id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskSet;
    use crate::transport::EventStream;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(i64, String, Value)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn start(&self, _tasks: &TaskSet) -> Result<EventStream, WireError> {
            Ok(Box::pin(futures::stream::empty::<crate::event::WireEvent>()))
        }

        async fn call_action(
            &self,
            self_id: i64,
            action: &str,
            params: Value,
        ) -> Result<Value, WireError> {
            self.calls
                .lock()
                .unwrap()
                .push((self_id, action.to_string(), params));
            Ok(json!({"message_id": 99}))
        }
    }

    #[tokio::test]
    async fn test_send_group_msg_params() {
        let t = Recorder::default();
        let data = send_group_msg(&t, 1, 100, &[Segment::text("hi")])
            .await
            .unwrap();
        assert_eq!(message_id(&data), Some(99));

        let calls = t.calls.lock().unwrap();
        assert_eq!(calls[0].0, 1);
        assert_eq!(calls[0].1, "send_group_msg");
        assert_eq!(
            calls[0].2,
            json!({"group_id": 100, "message": [{"type": "text", "data": {"text": "hi"}}]})
        );
    }

    #[tokio::test]
    async fn test_admin_action_params() {
        let t = Recorder::default();
        set_group_ban(&t, 1, 100, 7, 60).await.unwrap();
        set_group_kick(&t, 1, 100, 7).await.unwrap();
        delete_msg(&t, 1, 55).await.unwrap();

        let calls = t.calls.lock().unwrap();
        assert_eq!(
            calls[0].2,
            json!({"group_id": 100, "user_id": 7, "duration": 60})
        );
        assert_eq!(calls[1].1, "set_group_kick");
        assert_eq!(calls[1].2["reject_add_request"], false);
        assert_eq!(calls[2].2, json!({"message_id": 55}));
    }

    #[test]
    fn test_message_id_accepts_string() {
        assert_eq!(message_id(&json!({"message_id": "123"})), Some(123));
        assert_eq!(message_id(&json!(null)), None);
    }
}
