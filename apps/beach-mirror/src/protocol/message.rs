use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::payload::{Payload, PayloadType};
use super::ProtocolError;

/// Wire envelope exchanged with the app and with every client.
///
/// A nil `id` means "not yet assigned"; the protocol driver assigns one when
/// the message is first sent. Ids are preserved when a message is fanned out
/// so replies from any client can be matched back to the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Uuid::is_nil")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_estimate_ms: Option<f64>,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::nil(),
            reply_to_id: None,
            server_time_ms: None,
            latency_estimate_ms: None,
            payload,
        }
    }

    pub fn reply(reply_to_id: Uuid, payload: Payload) -> Self {
        Self {
            reply_to_id: Some(reply_to_id),
            ..Self::new(payload)
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to_id.is_some()
    }

    /// Copy of this message with a fresh identity, used when replaying cached
    /// state so client replies are never confused with replies to the app.
    pub fn replayed(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            reply_to_id: None,
            server_time_ms: None,
            latency_estimate_ms: None,
            payload: self.payload.clone(),
        }
    }
}

pub fn encode_message(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decodes a wire frame. A payload tag outside the known set surfaces as
/// [`ProtocolError::MissingRule`] so callers can log it and keep the
/// connection alive.
pub fn decode_message(text: &str) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let tag = value
        .get("payload")
        .and_then(|payload| payload.get("type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::UntypedPayload)?;
    if PayloadType::from_tag(tag).is_none() {
        return Err(ProtocolError::MissingRule {
            payload_type: tag.to_string(),
        });
    }
    Ok(serde_json::from_value(value)?)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::{ActorUpdate, Passthrough};
    use crate::protocol::patch::ActorPatch;
    use serde_json::json;

    #[test_timeout::timeout]
    fn wire_shape_uses_camel_case_and_omits_absent_fields() {
        let actor_id = Uuid::new_v4();
        let mut message = Message::new(Payload::ActorUpdate(ActorUpdate {
            actor: ActorPatch::new(actor_id).with_field("name", json!("door")),
        }));
        let encoded: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({"payload": {"type": "actor-update", "actor": {"id": actor_id, "name": "door"}}})
        );

        message.id = Uuid::new_v4();
        message.reply_to_id = Some(Uuid::new_v4());
        message.server_time_ms = Some(42);
        let encoded: Value = serde_json::to_value(&message).unwrap();
        assert!(encoded.get("replyToId").is_some());
        assert_eq!(encoded["serverTimeMs"], json!(42));
        assert!(encoded.get("latencyEstimateMs").is_none());
    }

    #[test_timeout::timeout]
    fn unknown_payload_tag_is_missing_rule() {
        let err = decode_message(r#"{"payload":{"type":"teleport-everyone"}}"#).unwrap_err();
        match err {
            ProtocolError::MissingRule { payload_type } => {
                assert_eq!(payload_type, "teleport-everyone")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn passthrough_payload_keeps_unknown_fields() {
        let text = r#"{"id":"6f1c2a52-2ad4-4b8e-8a6e-0a3e8f7bd1c1","payload":{"type":"trace","severity":"info","message":"hi"}}"#;
        let decoded = decode_message(text).unwrap();
        match &decoded.payload {
            Payload::Trace(Passthrough { fields }) => {
                assert_eq!(fields.get("severity"), Some(&json!("info")));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let reencoded: Value = serde_json::to_value(&decoded).unwrap();
        assert_eq!(reencoded["payload"]["message"], json!("hi"));
    }
}
