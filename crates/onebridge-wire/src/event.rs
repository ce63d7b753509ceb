//! Inbound OneBot v11 frames.
//!
//! Every frame received from a bot implementation is either an event
//! (classified by `post_type`) or the response to an action we issued
//! (carries `echo` plus `status`/`retcode`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One platform-native message segment: `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Segment {
    /// Build a segment from a JSON object. Non-object data yields an empty map.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text", serde_json::json!({ "text": text.into() }))
    }

    /// A string field of `data`. Numbers are rendered to strings.
    pub fn data_str(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Lifecycle meta event sub type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Connect,
    Disconnect,
}

/// A message event (`post_type = "message"`).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub self_id: i64,
    /// `"private"` or `"group"`.
    pub message_type: String,
    pub message_id: Option<i64>,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub segments: Vec<Segment>,
    pub raw_message: String,
    pub raw: Value,
}

/// A notice event (`post_type = "notice"`).
#[derive(Debug, Clone, PartialEq)]
pub struct NoticeEvent {
    pub self_id: i64,
    pub notice_type: String,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub raw: Value,
}

/// A typed inbound platform event.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Lifecycle {
        self_id: i64,
        sub_type: LifecycleKind,
    },
    Heartbeat {
        self_id: i64,
        interval_ms: Option<u64>,
    },
    Message(MessageEvent),
    Notice(NoticeEvent),
    /// Friend/group join requests. Not handled by the bridge.
    Request { self_id: i64, raw: Value },
}

impl WireEvent {
    pub fn self_id(&self) -> i64 {
        match self {
            Self::Lifecycle { self_id, .. }
            | Self::Heartbeat { self_id, .. }
            | Self::Request { self_id, .. } => *self_id,
            Self::Message(m) => m.self_id,
            Self::Notice(n) => n.self_id,
        }
    }

    /// Event type tag, used in logs and filter rules.
    pub fn post_type(&self) -> &'static str {
        match self {
            Self::Lifecycle { .. } | Self::Heartbeat { .. } => "meta_event",
            Self::Message(_) => "message",
            Self::Notice(_) => "notice",
            Self::Request { .. } => "request",
        }
    }
}

/// The response to an action frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResponse {
    pub echo: String,
    pub status: String,
    pub retcode: i64,
    pub data: Value,
    pub message: Option<String>,
}

impl ActionResponse {
    pub fn is_ok(&self) -> bool {
        self.retcode == 0 && self.status != "failed"
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(WireEvent),
    Response(ActionResponse),
    /// Valid JSON we do not recognize.
    Unknown(Value),
}

/// Read an id field that may arrive as a number or a numeric string.
pub fn field_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Parse one text frame.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(classify(value))
}

/// Classify an already-decoded JSON frame.
pub fn classify(value: Value) -> Frame {
    if value.get("echo").is_some()
        && (value.get("retcode").is_some() || value.get("status").is_some())
        && value.get("post_type").is_none()
    {
        let echo = match value.get("echo") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        return Frame::Response(ActionResponse {
            echo,
            status: field_str(&value, "status").unwrap_or("ok").to_string(),
            retcode: field_i64(&value, "retcode").unwrap_or(0),
            message: field_str(&value, "message")
                .or_else(|| field_str(&value, "msg"))
                .or_else(|| field_str(&value, "wording"))
                .map(String::from),
            data: value.get("data").cloned().unwrap_or(Value::Null),
        });
    }

    let Some(self_id) = field_i64(&value, "self_id") else {
        return Frame::Unknown(value);
    };

    match field_str(&value, "post_type") {
        Some("meta_event") => match field_str(&value, "meta_event_type") {
            Some("lifecycle") => {
                let sub_type = match field_str(&value, "sub_type") {
                    Some("connect") | Some("enable") => LifecycleKind::Connect,
                    Some("disconnect") | Some("disable") => LifecycleKind::Disconnect,
                    _ => return Frame::Unknown(value),
                };
                Frame::Event(WireEvent::Lifecycle { self_id, sub_type })
            }
            Some("heartbeat") => Frame::Event(WireEvent::Heartbeat {
                self_id,
                interval_ms: value.get("interval").and_then(Value::as_u64),
            }),
            _ => Frame::Unknown(value),
        },
        Some("message") | Some("message_sent") => {
            let segments = match value.get("message") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<Segment>(item.clone()).ok())
                    .collect(),
                // String-format posts carry the message as one CQ string.
                Some(Value::String(s)) => vec![Segment::text(s.clone())],
                _ => Vec::new(),
            };
            Frame::Event(WireEvent::Message(MessageEvent {
                self_id,
                message_type: field_str(&value, "message_type")
                    .unwrap_or("private")
                    .to_string(),
                message_id: field_i64(&value, "message_id"),
                group_id: field_i64(&value, "group_id").filter(|&id| id != 0),
                user_id: field_i64(&value, "user_id"),
                segments,
                raw_message: field_str(&value, "raw_message").unwrap_or("").to_string(),
                raw: value,
            }))
        }
        Some("notice") => Frame::Event(WireEvent::Notice(NoticeEvent {
            self_id,
            notice_type: field_str(&value, "notice_type").unwrap_or("").to_string(),
            group_id: field_i64(&value, "group_id").filter(|&id| id != 0),
            user_id: field_i64(&value, "user_id"),
            raw: value,
        })),
        Some("request") => Frame::Event(WireEvent::Request {
            self_id,
            raw: value,
        }),
        _ => Frame::Unknown(value),
    }
}
