//! Message translation between OneBot segments and the unified model.
//!
//! Both directions go through a fixed table keyed by segment type. Inbound
//! segment types missing from the table are skipped. A segment or element
//! whose data is malformed is logged and skipped; the rest of the message
//! still translates.

use onebridge_types::error::BridgeError;
use onebridge_types::message::{ChatAddress, MessageElement, UnifiedMessage};
use onebridge_wire::event::{MessageEvent, Segment};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, error};

type InboundConverter = fn(&Segment) -> Result<MessageElement, BridgeError>;

/// Segment type → converter into a unified element.
static INBOUND: &[(&str, InboundConverter)] = &[
    ("text", text_from),
    ("at", mention_from),
    ("image", image_from),
    ("reply", reply_from),
    ("face", face_from),
    ("record", audio_from),
    ("video", video_from),
    ("json", json_from),
];

fn missing(segment: &Segment, key: &str) -> BridgeError {
    BridgeError::Translation {
        kind: segment.kind.clone(),
        reason: format!("missing '{key}'"),
    }
}

fn required(segment: &Segment, key: &str) -> Result<String, BridgeError> {
    segment.data_str(key).ok_or_else(|| missing(segment, key))
}

/// `url` when present, else `file`.
fn url_or_file(segment: &Segment) -> Result<String, BridgeError> {
    segment
        .data_str("url")
        .filter(|u| !u.is_empty())
        .or_else(|| segment.data_str("file"))
        .ok_or_else(|| missing(segment, "url"))
}

fn text_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    Ok(MessageElement::Text {
        body: required(segment, "text")?,
    })
}

fn mention_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    Ok(MessageElement::Mention {
        target_id: required(segment, "qq")?,
    })
}

fn image_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    Ok(MessageElement::Image {
        url: url_or_file(segment)?,
    })
}

fn reply_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    Ok(MessageElement::ReplyRef {
        target_message_id: required(segment, "id")?,
    })
}

fn face_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    let raw = required(segment, "id")?;
    let id = raw.trim().parse::<i64>().map_err(|e| BridgeError::Translation {
        kind: segment.kind.clone(),
        reason: format!("non-numeric face id '{raw}': {e}"),
    })?;
    Ok(MessageElement::Face { id })
}

fn audio_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    Ok(MessageElement::Audio {
        url: url_or_file(segment)?,
    })
}

fn video_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    let file_ref = segment
        .data_str("file")
        .or_else(|| segment.data_str("url"))
        .ok_or_else(|| missing(segment, "file"))?;
    Ok(MessageElement::Video { file_ref })
}

fn json_from(segment: &Segment) -> Result<MessageElement, BridgeError> {
    Ok(MessageElement::StructuredPayload {
        raw: required(segment, "data")?,
    })
}

fn lookup(kind: &str) -> Option<InboundConverter> {
    INBOUND
        .iter()
        .find(|(tag, _)| *tag == kind)
        .map(|(_, convert)| *convert)
}

/// Translate one inbound segment. `None` when the type is unmapped or the
/// data is malformed.
pub fn segment_to_element(segment: &Segment) -> Option<MessageElement> {
    let Some(convert) = lookup(&segment.kind) else {
        debug!(segment = %segment.kind, "Skipping unmapped segment type");
        return None;
    };
    match convert(segment) {
        Ok(element) => Some(element),
        Err(e) => {
            error!(error = %e, "Inbound segment translation failed");
            None
        }
    }
}

/// Translate a message event into a unified message.
///
/// The sender is the group when the event carries a group id, otherwise the
/// user.
pub fn to_unified(event: &MessageEvent) -> UnifiedMessage {
    let sender = match event.group_id {
        Some(group_id) => ChatAddress::group(group_id),
        None => ChatAddress::private(event.user_id.unwrap_or_default()),
    };

    let elements = event
        .segments
        .iter()
        .filter_map(segment_to_element)
        .collect();

    let mut metadata = HashMap::new();
    metadata.insert("self_id".to_string(), json!(event.self_id));
    metadata.insert("message_type".to_string(), json!(event.message_type));
    if let Some(id) = event.message_id {
        metadata.insert("message_id".to_string(), json!(id));
    }
    if let Some(id) = event.user_id {
        metadata.insert("user_id".to_string(), json!(id));
    }

    UnifiedMessage::with_metadata(sender, elements, metadata)
}

fn non_empty(kind: &str, field: &str, value: &str) -> Result<(), BridgeError> {
    if value.trim().is_empty() {
        return Err(BridgeError::Translation {
            kind: kind.to_string(),
            reason: format!("empty {field}"),
        });
    }
    Ok(())
}

/// Translate one unified element into a segment.
pub fn element_to_segment(element: &MessageElement) -> Result<Segment, BridgeError> {
    let kind = element.kind();
    let segment = match element {
        MessageElement::Text { body } => Segment::text(body.clone()),
        MessageElement::Mention { target_id } => {
            let target = target_id.trim();
            if target != "all" && target.parse::<i64>().is_err() {
                return Err(BridgeError::Translation {
                    kind: kind.to_string(),
                    reason: format!("mention target '{target_id}' is neither numeric nor 'all'"),
                });
            }
            Segment::new("at", json!({ "qq": target }))
        }
        MessageElement::Image { url } => {
            non_empty(kind, "url", url)?;
            Segment::new("image", json!({ "file": url }))
        }
        MessageElement::ReplyRef { target_message_id } => {
            non_empty(kind, "target message id", target_message_id)?;
            Segment::new("reply", json!({ "id": target_message_id }))
        }
        MessageElement::Face { id } => Segment::new("face", json!({ "id": id.to_string() })),
        MessageElement::Audio { url } => {
            non_empty(kind, "url", url)?;
            Segment::new("record", json!({ "file": url }))
        }
        MessageElement::Video { file_ref } => {
            non_empty(kind, "file", file_ref)?;
            Segment::new("video", json!({ "file": file_ref }))
        }
        MessageElement::StructuredPayload { raw } => {
            serde_json::from_str::<serde_json::Value>(raw).map_err(|e| {
                BridgeError::Translation {
                    kind: kind.to_string(),
                    reason: format!("payload is not valid JSON: {e}"),
                }
            })?;
            Segment::new("json", json!({ "data": raw }))
        }
    };
    Ok(segment)
}

/// Translate a unified message into wire segments. Never fails; malformed
/// elements are logged and omitted, the rest keep their order.
pub fn to_wire(message: &UnifiedMessage) -> Vec<Segment> {
    message
        .elements()
        .iter()
        .filter_map(|element| match element_to_segment(element) {
            Ok(segment) => Some(segment),
            Err(e) => {
                error!(error = %e, "Outbound element translation failed");
                None
            }
        })
        .collect()
}

/// Reply segment for `message_id`.
pub fn reply_segment(message_id: i64) -> Segment {
    Segment::new("reply", json!({ "id": message_id.to_string() }))
}

/// Mention segment for `user_id`.
pub fn mention_segment(user_id: i64) -> Segment {
    Segment::new("at", json!({ "qq": user_id.to_string() }))
}
