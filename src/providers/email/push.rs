//! Push notification payloads.
//!
//! Two wire formats arrive at the webhook endpoint:
//!
//! - the unified API posts batches of deltas, each naming a grant and a
//!   message, optionally with the full message object attached;
//! - the native Gmail-like provider posts a Pub/Sub envelope that only
//!   carries the mailbox address and a history pointer, so the actual
//!   changes have to be pulled through the history feed.

use base64::prelude::*;
use serde::Deserialize;

use super::unified::parse_message;
use super::{DeltaChange, RemoteDelta};
use crate::domain::{MessageId, ProviderKind};

/// The payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed push payload: {0}")]
pub struct MalformedPayload(pub String);

/// A decoded push notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PushNotification {
    /// Deltas addressed by unified grant id.
    Unified(Vec<UnifiedDelta>),
    /// A history pointer for a native mailbox.
    Native(NativeNotice),
}

/// One unified delta with the grant it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDelta {
    pub grant_id: String,
    pub delta: RemoteDelta,
}

/// Native notification contents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeNotice {
    pub email_address: String,
    #[serde(deserialize_with = "string_or_number")]
    pub history_id: String,
}

#[derive(Debug, Deserialize)]
struct UnifiedPayload {
    deltas: Vec<RawDelta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDelta {
    object_type: String,
    change_type: String,
    object_data: RawObjectData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObjectData {
    account_id: String,
    id: String,
    attributes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PubSubEnvelope {
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    data: String,
}

impl PushNotification {
    /// Decodes a raw payload posted by the given provider.
    pub fn decode(kind: ProviderKind, payload: &[u8]) -> Result<Self, MalformedPayload> {
        match kind {
            ProviderKind::Unified => decode_unified(payload).map(PushNotification::Unified),
            ProviderKind::GmailLike => decode_native(payload).map(PushNotification::Native),
            other => Err(MalformedPayload(format!("{other} does not deliver push payloads"))),
        }
    }
}

fn decode_unified(payload: &[u8]) -> Result<Vec<UnifiedDelta>, MalformedPayload> {
    let parsed: UnifiedPayload =
        serde_json::from_slice(payload).map_err(|e| MalformedPayload(e.to_string()))?;

    let mut deltas = Vec::with_capacity(parsed.deltas.len());
    for raw in parsed.deltas {
        if raw.object_type != "message" {
            continue;
        }
        let change = match raw.change_type.trim_start_matches("message.") {
            "created" => DeltaChange::Created,
            "updated" => DeltaChange::Updated,
            "deleted" => DeltaChange::Deleted,
            other => {
                tracing::debug!(
                    change_type = other,
                    message_id = %raw.object_data.id,
                    "skipping unsupported unified delta"
                );
                continue;
            }
        };

        let message = match (change, raw.object_data.attributes) {
            (DeltaChange::Deleted, _) | (_, None) => None,
            (_, Some(mut attributes)) => {
                if let Some(object) = attributes.as_object_mut() {
                    object
                        .entry("id")
                        .or_insert_with(|| serde_json::Value::String(raw.object_data.id.clone()));
                }
                // A partial object is not fatal; the message is re-fetched instead.
                parse_message(attributes).ok()
            }
        };

        deltas.push(UnifiedDelta {
            grant_id: raw.object_data.account_id,
            delta: RemoteDelta {
                change,
                message_id: MessageId::from(raw.object_data.id),
                message,
            },
        });
    }
    Ok(deltas)
}

fn decode_native(payload: &[u8]) -> Result<NativeNotice, MalformedPayload> {
    let envelope: PubSubEnvelope =
        serde_json::from_slice(payload).map_err(|e| MalformedPayload(e.to_string()))?;

    let data = envelope.message.data.trim();
    let bytes = BASE64_STANDARD
        .decode(data)
        .or_else(|_| BASE64_URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')))
        .map_err(|e| MalformedPayload(format!("message data: {e}")))?;

    serde_json::from_slice(&bytes).map_err(|e| MalformedPayload(format!("message data: {e}")))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}
