//! Nostr relay message types.
//!
//! This module implements the relay protocol messages as specified in NIP-01:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE
//!
//! Frames are JSON arrays whose first element names the message type. Any
//! frame that is not an array, names an unknown type, or has the wrong arity
//! or element types is rejected with [`MessageError`].

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }

    /// Parse a client frame, as a relay would.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let (msg_type, mut arr) = split_frame(json)?;

        match msg_type.as_str() {
            "EVENT" => {
                expect_len(&arr, 2, 2, "EVENT")?;
                Ok(ClientMessage::Event(serde_json::from_value(arr.remove(1))?))
            }
            "REQ" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("subscription_id".to_string()));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let filters = arr
                    .drain(2..)
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                expect_len(&arr, 2, 2, "CLOSE")?;
                Ok(ClientMessage::Close {
                    subscription_id: string_at(&arr, 1, "subscription_id")?,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    ///
    /// The trailing message of `OK` and `CLOSED` may be omitted; it then
    /// reads as empty.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let (msg_type, mut arr) = split_frame(json)?;

        match msg_type.as_str() {
            "EVENT" => {
                expect_len(&arr, 3, 3, "EVENT")?;
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr.remove(2))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                expect_len(&arr, 3, 4, "OK")?;
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("success not a boolean".to_string())
                })?;
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message: optional_string_at(&arr, 3, "message")?,
                })
            }
            "EOSE" => {
                expect_len(&arr, 2, 2, "EOSE")?;
                Ok(RelayMessage::Eose {
                    subscription_id: string_at(&arr, 1, "subscription_id")?,
                })
            }
            "CLOSED" => {
                expect_len(&arr, 2, 3, "CLOSED")?;
                Ok(RelayMessage::Closed {
                    subscription_id: string_at(&arr, 1, "subscription_id")?,
                    message: optional_string_at(&arr, 2, "message")?,
                })
            }
            "NOTICE" => {
                expect_len(&arr, 2, 2, "NOTICE")?;
                Ok(RelayMessage::Notice {
                    message: string_at(&arr, 1, "message")?,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Serialize to the JSON array a relay would send.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => serde_json::json!(["OK", event_id, success, message]),
            RelayMessage::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
        };
        Ok(value.to_string())
    }
}

/// Parse a frame into its type tag and the full element array.
fn split_frame(json: &str) -> Result<(String, Vec<Value>), MessageError> {
    let arr: Vec<Value> =
        serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

    let msg_type = arr
        .first()
        .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
        .as_str()
        .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?
        .to_string();

    Ok((msg_type, arr))
}

fn expect_len(arr: &[Value], min: usize, max: usize, msg_type: &str) -> Result<(), MessageError> {
    if arr.len() < min {
        return Err(MessageError::MissingField(format!(
            "{} expects at least {} elements, got {}",
            msg_type,
            min,
            arr.len()
        )));
    }
    if arr.len() > max {
        return Err(MessageError::InvalidFormat(format!(
            "{} expects at most {} elements, got {}",
            msg_type,
            max,
            arr.len()
        )));
    }
    Ok(())
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(field.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}

fn optional_string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    if index >= arr.len() {
        return Ok(String::new());
    }
    string_at(arr, index, field)
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs (exact or prefix)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys, exact or prefix)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events the relay should return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed by `#<letter>` (e.g. `#e`, `#p`)
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter. An empty filter matches every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Evaluate the filter locally against an event.
    ///
    /// Every present condition must hold. `limit` only applies to stored
    /// events on the relay and is ignored here.
    pub fn matches(&self, event: &Event) -> bool {
        fn any_prefix(values: &Option<Vec<String>>, target: &str) -> bool {
            values
                .as_ref()
                .is_none_or(|values| values.iter().any(|v| target.starts_with(v.as_str())))
        }

        if !any_prefix(&self.ids, &event.id) || !any_prefix(&self.authors, &event.pubkey) {
            return false;
        }
        if self
            .kinds
            .as_ref()
            .is_some_and(|kinds| !kinds.contains(&event.kind))
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since)
            || self.until.is_some_and(|until| event.created_at > until)
        {
            return false;
        }

        self.tags.iter().all(|(key, wanted)| {
            let Some(name) = key.strip_prefix('#') else {
                return true;
            };
            event
                .tag_values(name)
                .any(|value| wanted.iter().any(|w| w == value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, Keys};
    use pretty_assertions::assert_eq;

    fn sample_event() -> Event {
        Event {
            id: "abc123".to_string(),
            pubkey: "pubkey123".to_string(),
            created_at: 1234567890,
            kind: 1,
            tags: vec![
                vec!["e".to_string(), "root".to_string()],
                vec!["p".to_string(), "alice".to_string()],
            ],
            content: "Hello".to_string(),
            sig: "sig123".to_string(),
        }
    }

    #[test]
    fn test_client_message_event() {
        let msg = ClientMessage::Event(sample_event());
        let json = msg.to_json().unwrap();

        assert!(json.starts_with(r#"["EVENT",{"#));
        assert!(json.contains("abc123"));
    }

    #[test]
    fn test_client_message_close() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };

        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_req_round_trip() {
        let filters = vec![
            Filter::new().kinds(vec![0, 1]).authors(vec!["ab".to_string()]),
            Filter::new().event_refs(vec!["cd".to_string()]).since(10).limit(5),
        ];
        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: filters.clone(),
        };

        let json = msg.to_json().unwrap();
        assert!(json.starts_with(r#"["REQ","sub1",{"#));
        assert!(json.contains(r##""#e":["cd"]"##));

        assert_eq!(ClientMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_client_event_round_trip() {
        let keys = Keys::generate();
        let event = keys
            .sign(&EventTemplate::now(1, vec![], "round trip"))
            .unwrap();
        let msg = ClientMessage::Event(event);

        let parsed = ClientMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_relay_message_event() {
        let json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}]"#;

        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
                assert_eq!(event.content, "Hello");
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_relay_message_ok() {
        let accepted = RelayMessage::from_json(r#"["OK","event123",true,""]"#).unwrap();
        assert_eq!(
            accepted,
            RelayMessage::Ok {
                event_id: "event123".to_string(),
                success: true,
                message: String::new(),
            }
        );

        let rejected =
            RelayMessage::from_json(r#"["OK","event123",false,"blocked: not on allowlist"]"#)
                .unwrap();
        assert_eq!(
            rejected,
            RelayMessage::Ok {
                event_id: "event123".to_string(),
                success: false,
                message: "blocked: not on allowlist".to_string(),
            }
        );
    }

    #[test]
    fn test_relay_message_ok_without_message() {
        let msg = RelayMessage::from_json(r#"["OK","event123",true]"#).unwrap();
        assert!(matches!(msg, RelayMessage::Ok { message, .. } if message.is_empty()));
    }

    #[test]
    fn test_relay_message_eose_closed_notice() {
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose {
                subscription_id: "sub1".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub1","error: too many subscriptions"]"#)
                .unwrap(),
            RelayMessage::Closed {
                subscription_id: "sub1".to_string(),
                message: "error: too many subscriptions".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap(),
            RelayMessage::Notice {
                message: "rate limited".to_string()
            }
        );
    }

    #[test]
    fn test_relay_message_round_trip() {
        let msg = RelayMessage::Closed {
            subscription_id: "s".to_string(),
            message: "bye".to_string(),
        };
        assert_eq!(RelayMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_invalid_messages() {
        let cases = [
            "not valid json",
            "{}",
            "[]",
            "[1,2]",
            r#"["UNKNOWN"]"#,
            r#"["AUTH","challenge"]"#,
            r#"["EOSE"]"#,
            r#"["EOSE","sub1","extra"]"#,
            r#"["EOSE",5]"#,
            r#"["OK","id","yes",""]"#,
            r#"["EVENT","sub1"]"#,
            r#"["EVENT","sub1",{"id":1}]"#,
            r#"["NOTICE"]"#,
        ];
        for case in cases {
            assert!(RelayMessage::from_json(case).is_err(), "accepted {}", case);
        }

        assert!(matches!(
            RelayMessage::from_json(r#"["UNKNOWN"]"#),
            Err(MessageError::UnknownType(t)) if t == "UNKNOWN"
        ));
    }

    #[test]
    fn test_filter_serialization() {
        let filter = Filter::new().kinds(vec![1]).limit(10);

        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"{"kinds":[1],"limit":10}"#);
    }

    #[test]
    fn test_filter_matches_fields() {
        let event = sample_event();

        assert!(Filter::new().matches(&event));
        assert!(Filter::new().ids(vec!["abc".to_string()]).matches(&event));
        assert!(!Filter::new().ids(vec!["abd".to_string()]).matches(&event));
        assert!(Filter::new().authors(vec!["pubkey123".to_string()]).matches(&event));
        assert!(!Filter::new().authors(vec!["other".to_string()]).matches(&event));
        assert!(Filter::new().kinds(vec![0, 1]).matches(&event));
        assert!(!Filter::new().kinds(vec![7]).matches(&event));
        assert!(Filter::new().kinds(vec![1]).limit(0).matches(&event));
    }

    #[test]
    fn test_filter_matches_time_bounds_inclusive() {
        let event = sample_event();

        assert!(Filter::new().since(1234567890).matches(&event));
        assert!(Filter::new().until(1234567890).matches(&event));
        assert!(!Filter::new().since(1234567891).matches(&event));
        assert!(!Filter::new().until(1234567889).matches(&event));
    }

    #[test]
    fn test_filter_matches_tags() {
        let event = sample_event();

        assert!(Filter::new().event_refs(vec!["root".to_string()]).matches(&event));
        assert!(
            Filter::new()
                .event_refs(vec!["x".to_string(), "root".to_string()])
                .pubkey_refs(vec!["alice".to_string()])
                .matches(&event)
        );
        assert!(!Filter::new().pubkey_refs(vec!["bob".to_string()]).matches(&event));
        assert!(!Filter::new().tag("t", vec!["nostr".to_string()]).matches(&event));
    }
}
