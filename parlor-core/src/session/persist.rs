//! Versioned on-disk format of the session collection
//!
//! The collection is stored as `{"version": N, "sessions": {...}}`. Blobs
//! written before versioning existed are a bare camelCase map of sessions and
//! are treated as version 1. Anything unreadable decodes to an empty
//! collection, which makes the store bootstrap a fresh session.

use super::store::{Message, Rating, Session, SessionMap};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Storage key holding the session collection
pub const SESSIONS_KEY: &str = "chat_sessions";

/// Version written by this build
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    sessions: &'a SessionMap,
}

#[derive(Deserialize)]
struct EnvelopeV2 {
    sessions: SessionMap,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySession {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    messages: Vec<LegacyMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_user: bool,
    #[serde(default)]
    show_feedback: bool,
    #[serde(default)]
    feedback_given: Option<Value>,
}

/// Serialize the collection in the current format
pub fn encode_collection(sessions: &SessionMap) -> crate::Result<String> {
    Ok(serde_json::to_string(&EnvelopeRef {
        version: SCHEMA_VERSION,
        sessions,
    })?)
}

/// Decode a stored blob, migrating older formats
///
/// Never fails: unreadable data is logged and yields an empty collection.
pub fn decode_collection(raw: &str) -> SessionMap {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Discarding unreadable session blob: {}", e);
            return SessionMap::new();
        }
    };

    let version = match value.get("version") {
        None => 1,
        Some(raw) => match raw.as_u64().and_then(|v| u32::try_from(v).ok()) {
            Some(version) => version,
            None => {
                warn!("Discarding session blob with unsupported version {}", raw);
                return SessionMap::new();
            }
        },
    };

    match migrate(version, value) {
        Ok(sessions) => align_ids(sessions),
        Err(e) => {
            warn!(version, "Discarding session blob: {}", e);
            SessionMap::new()
        }
    }
}

/// Make every session's `id` match the key it is stored under
fn align_ids(mut sessions: SessionMap) -> SessionMap {
    for (key, session) in sessions.iter_mut() {
        if session.id != *key {
            warn!(key = %key, id = %session.id, "Session id differs from its key, using the key");
            session.id = key.clone();
        }
    }
    sessions
}

/// Bring a blob of the given version up to the current model
fn migrate(version: u32, value: Value) -> crate::Result<SessionMap> {
    match version {
        1 => {
            let sessions = migrate_v1(value)?;
            info!(count = sessions.len(), "Migrated session blob from version 1");
            Ok(sessions)
        }
        SCHEMA_VERSION => Ok(serde_json::from_value::<EnvelopeV2>(value)?.sessions),
        other => Err(crate::Error::Serialization(format!(
            "unsupported session blob version {}",
            other
        ))),
    }
}

fn migrate_v1(value: Value) -> crate::Result<SessionMap> {
    let legacy: BTreeMap<String, LegacySession> = serde_json::from_value(value)?;

    Ok(legacy
        .into_iter()
        .map(|(key, session)| {
            let id = session.id.unwrap_or_else(|| key.clone());
            let created_at = session
                .created_at
                .as_ref()
                .and_then(parse_legacy_timestamp)
                .or_else(|| id.parse::<i64>().ok().and_then(millis_to_datetime))
                .unwrap_or_default();
            let name = session.name.unwrap_or_else(|| id.clone());
            let messages = session.messages.into_iter().map(migrate_message).collect();

            (
                key,
                Session {
                    id,
                    name,
                    created_at,
                    messages,
                },
            )
        })
        .collect())
}

fn migrate_message(legacy: LegacyMessage) -> Message {
    let feedback_given = legacy
        .feedback_given
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|score| u8::try_from(score).ok())
        .and_then(|score| Rating::new(score).ok());

    Message {
        text: legacy.text,
        is_user: legacy.is_user,
        show_feedback: legacy.show_feedback,
        feedback_given,
    }
}

/// Legacy timestamps are ISO strings or epoch milliseconds
fn parse_legacy_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(millis_to_datetime),
        _ => None,
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_writes_version() {
        let mut sessions = SessionMap::new();
        sessions.insert(
            "1700000000000".to_string(),
            Session::new("1700000000000", "Session 1", Utc::now()),
        );

        let raw = encode_collection(&sessions).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], SCHEMA_VERSION);
        assert_eq!(decode_collection(&raw), sessions);
    }

    #[test]
    fn test_decode_legacy_blob() {
        let raw = r#"{
            "1700000000000": {
                "id": "1700000000000",
                "name": "Session 1",
                "createdAt": "2023-11-14T22:13:20.000Z",
                "messages": [
                    {"text": "hi", "isUser": true, "showFeedback": false},
                    {"text": "hello!", "isUser": false, "showFeedback": true, "feedbackGiven": 5}
                ]
            }
        }"#;

        let sessions = decode_collection(raw);
        let session = &sessions["1700000000000"];
        assert_eq!(session.name, "Session 1");
        assert_eq!(session.created_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(session.messages.len(), 2);
        assert!(session.messages[0].is_user);
        assert_eq!(
            session.messages[1].feedback_given,
            Some(Rating::new(5).unwrap())
        );
    }

    #[test]
    fn test_legacy_without_timestamp_uses_id() {
        let raw = r#"{"1700000000000": {"name": "Old", "messages": []}}"#;
        let sessions = decode_collection(raw);
        assert_eq!(
            sessions["1700000000000"].created_at.timestamp_millis(),
            1_700_000_000_000
        );
    }

    #[test]
    fn test_garbage_decodes_to_empty() {
        assert!(decode_collection("{not json").is_empty());
        assert!(decode_collection("[1, 2, 3]").is_empty());
    }

    #[test]
    fn test_future_version_decodes_to_empty() {
        assert!(decode_collection(r#"{"version": 99, "sessions": {}}"#).is_empty());
    }

    #[test]
    fn test_oversized_version_decodes_to_empty() {
        // 2^32 + 2 must not wrap around to the current version
        let raw = r#"{"version": 4294967298, "sessions": {
            "1": {"id": "1", "name": "x", "created_at": "2024-01-01T00:00:00Z", "messages": []}
        }}"#;
        assert!(decode_collection(raw).is_empty());
        assert!(decode_collection(r#"{"version": "2", "sessions": {}}"#).is_empty());
    }

    #[test]
    fn test_mismatched_ids_follow_map_key() {
        let v2 = r#"{"version": 2, "sessions": {
            "a": {"id": "b", "name": "x", "created_at": "2024-01-01T00:00:00Z", "messages": []}
        }}"#;
        let sessions = decode_collection(v2);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions["a"].id, "a");

        let v1 = r#"{"k1": {"id": "other", "name": "Old", "messages": []}}"#;
        let sessions = decode_collection(v1);
        assert_eq!(sessions["k1"].id, "k1");
    }
}
