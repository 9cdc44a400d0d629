use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};

pub const HOST_NAMESPACE: &str = "co.squaretwo.nativeapp";
pub const PEER_NAMESPACE: &str = "co.squaretwo.webclient";
pub const RESPONSE_SUFFIX: &str = "Response";

pub const CLIENT_INITIALIZED: &str = "unityClientInitialized";
pub const SURFACE_ERROR: &str = "WebviewError";
pub const TIMED_OUT: &str = "TimedOut";
pub const CANCELLED: &str = "Cancelled";

const TIMED_OUT_MESSAGE: &str = "Request Timed Out";

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub namespace: String,
    pub id: i64,
    pub kind: String,
    pub data: Value,
    pub error: Option<String>,
}

impl Envelope {
    pub fn request(kind: &str, data: Value, id: i64) -> Self {
        Self {
            namespace: HOST_NAMESPACE.to_string(),
            id,
            kind: kind.to_string(),
            data,
            error: None,
        }
    }

    /// Reply to a peer request: echoes its id, suffixes its type.
    pub fn response_to(request: &Envelope, data: Value, error: Option<String>) -> Self {
        Self {
            namespace: HOST_NAMESPACE.to_string(),
            id: request.id,
            kind: format!("{}{RESPONSE_SUFFIX}", request.kind),
            data,
            error,
        }
    }

    pub fn timed_out() -> Self {
        Self::synthetic(TIMED_OUT, TIMED_OUT_MESSAGE.to_string())
    }

    pub fn surface_error(message: impl Into<String>) -> Self {
        Self::synthetic(SURFACE_ERROR, message.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::synthetic(CANCELLED, reason.into())
    }

    fn synthetic(kind: &str, error: String) -> Self {
        Self {
            namespace: PEER_NAMESPACE.to_string(),
            id: -1,
            kind: kind.to_string(),
            data: Value::Null,
            error: Some(error),
        }
    }

    pub fn is_response(&self) -> bool {
        self.kind.ends_with(RESPONSE_SUFFIX)
    }

    pub fn to_wire(&self) -> String {
        json!({
            "namespace": self.namespace,
            "id": self.id,
            "type": self.kind,
            "data": self.data,
            "error": self.error,
        })
        .to_string()
    }

    /// Turns a reply (real or synthetic) into the caller-facing outcome.
    pub fn into_result(self) -> Result<Envelope> {
        let Some(message) = self.error.clone() else {
            return Ok(self);
        };

        Err(match self.kind.as_str() {
            TIMED_OUT => BridgeError::TimedOut,
            SURFACE_ERROR => BridgeError::Surface(message),
            CANCELLED => BridgeError::Cancelled(message),
            _ => BridgeError::Remote(message),
        })
    }
}

pub fn encode_request(kind: &str, data: Value, id: i64) -> String {
    Envelope::request(kind, data, id).to_wire()
}

/// Decodes a peer message. Returns `None` for anything that is not a JSON
/// object from the peer namespace carrying an id and a type.
pub fn decode(raw: &str) -> Option<Envelope> {
    decode_from(raw, PEER_NAMESPACE)
}

pub fn decode_from(raw: &str, expected_namespace: &str) -> Option<Envelope> {
    let parsed = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => value,
        Err(error) => {
            tracing::trace!(%error, "discarding non-json message");
            return None;
        }
    };

    let object = parsed.as_object()?;
    let namespace = object.get("namespace").and_then(Value::as_str)?;
    if namespace != expected_namespace {
        tracing::trace!(namespace, "discarding message from foreign namespace");
        return None;
    }

    let id = coerce_int(object.get("id")?)?;
    let kind = object.get("type").and_then(Value::as_str)?.to_string();
    let data = object.get("data").cloned().unwrap_or(Value::Null);
    let error = match object.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message.clone()),
        Some(other) => Some(other.to_string()),
    };

    Some(Envelope {
        namespace: namespace.to_string(),
        id,
        kind,
        data,
        error,
    })
}

/// Integer coercion for loosely typed peer values: integers, finite floats
/// (rounded) and numeric strings.
pub fn coerce_int(value: &Value) -> Option<i64> {
    if let Some(number) = value.as_i64() {
        return Some(number);
    }

    if let Some(number) = value.as_u64() {
        return i64::try_from(number).ok();
    }

    if let Some(number) = value.as_f64() {
        return finite_to_i64(number);
    }

    if let Some(raw) = value.as_str() {
        let raw = raw.trim();
        if let Ok(number) = raw.parse::<i64>() {
            return Some(number);
        }
        return raw.parse::<f64>().ok().and_then(finite_to_i64);
    }

    None
}

fn finite_to_i64(number: f64) -> Option<i64> {
    if number.is_finite() && number.abs() < i64::MAX as f64 {
        Some(number.round() as i64)
    } else {
        None
    }
}

/// Script that hands `wire` to the page's message listener.
pub fn post_message_script(wire: &str) -> String {
    format!("window.postMessage('{}');", escape_js_single_quoted(wire))
}

pub fn escape_js_single_quoted(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_int")]
    pub tickets: i64,
    #[serde(default, deserialize_with = "lenient_int")]
    pub tokens: i64,
    #[serde(default, deserialize_with = "lenient_int")]
    pub inbox_count: i64,
}

fn lenient_int<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(0);
    }
    coerce_int(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {value}")))
}

#[derive(Debug, Clone, Deserialize)]
struct StorageEntry {
    key: String,
    value: String,
}

/// Peer traffic the host reacts to, decoded once per envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ClientInitialized,
    NavigationRouteUpdated(String),
    StorageGetItem(String),
    StorageSetItem { key: String, value: String },
    UserUpdated(UserData),
    Unknown(Value),
}

impl InboundMessage {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let data = &envelope.data;
        let typed = match envelope.kind.as_str() {
            CLIENT_INITIALIZED => Some(Self::ClientInitialized),
            "navigationRouteUpdated" => data
                .as_str()
                .map(|path| Self::NavigationRouteUpdated(path.to_string())),
            "storageGetItem" => data.as_str().map(|key| Self::StorageGetItem(key.to_string())),
            "storageSetItem" => serde_json::from_value::<StorageEntry>(data.clone())
                .ok()
                .map(|entry| Self::StorageSetItem {
                    key: entry.key,
                    value: entry.value,
                }),
            "userUpdated" => serde_json::from_value::<UserData>(data.clone())
                .ok()
                .map(Self::UserUpdated),
            _ => None,
        };

        typed.unwrap_or_else(|| {
            tracing::trace!(kind = %envelope.kind, "no typed handler for message");
            Self::Unknown(data.clone())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasePayload {
    pub product_id: String,
    pub transaction_id: String,
    pub receipt_data: String,
    #[serde(rename = "type")]
    pub purchase_type: String,
}

/// Pulls the store receipt out of the `{"Payload": ...}` wrapper that
/// purchase receipts arrive in.
pub fn extract_receipt_payload(receipt_json: &str) -> Result<String> {
    let receipt = serde_json::from_str::<Value>(receipt_json)
        .map_err(|error| BridgeError::InvalidReceipt(error.to_string()))?;

    receipt
        .get("Payload")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidReceipt("missing string field Payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_carries_all_five_fields() {
        let wire = encode_request("showInbox", Value::Null, 7);
        let parsed: Value = serde_json::from_str(&wire).expect("valid json");
        assert_eq!(parsed["namespace"], HOST_NAMESPACE);
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["type"], "showInbox");
        assert!(parsed.get("data").expect("data key").is_null());
        assert!(parsed.get("error").expect("error key").is_null());
    }

    #[test]
    fn response_echoes_peer_id_and_suffixes_type() {
        let request = decode(r#"{"namespace":"co.squaretwo.webclient","id":93,"type":"storageGetItem","data":"k"}"#)
            .expect("valid peer message");
        let response = Envelope::response_to(&request, json!("v"), None);
        assert_eq!(response.id, 93);
        assert_eq!(response.kind, "storageGetItemResponse");
        assert_eq!(response.namespace, HOST_NAMESPACE);
    }

    #[test]
    fn decode_rejects_foreign_and_malformed_payloads() {
        assert!(decode("not json").is_none());
        assert!(decode("[1,2,3]").is_none());
        assert!(decode(r#"{"id":1,"type":"x"}"#).is_none());
        assert!(decode(r#"{"namespace":42,"id":1,"type":"x"}"#).is_none());
        assert!(decode(r#"{"namespace":"co.squaretwo.nativeapp","id":1,"type":"x"}"#).is_none());
        assert!(decode(r#"{"namespace":"co.squaretwo.webclient","type":"x"}"#).is_none());
        assert!(decode(r#"{"namespace":"co.squaretwo.webclient","id":1}"#).is_none());
    }

    #[test]
    fn decode_tolerates_missing_data_and_loose_ids() {
        let envelope = decode(r#"{"namespace":"co.squaretwo.webclient","id":"12","type":"hideInboxResponse"}"#)
            .expect("decodes");
        assert_eq!(envelope.id, 12);
        assert!(envelope.data.is_null());
        assert!(envelope.error.is_none());
        assert!(envelope.is_response());

        let envelope = decode(r#"{"namespace":"co.squaretwo.webclient","id":3.0,"type":"x","error":null}"#)
            .expect("decodes");
        assert_eq!(envelope.id, 3);
        assert!(envelope.error.is_none());
    }

    #[test]
    fn decode_keeps_structured_errors_as_text() {
        let envelope = decode(
            r#"{"namespace":"co.squaretwo.webclient","id":1,"type":"xResponse","error":{"code":5}}"#,
        )
        .expect("decodes");
        assert_eq!(envelope.error.as_deref(), Some(r#"{"code":5}"#));
    }

    #[test]
    fn synthetic_envelopes_map_to_error_kinds() {
        assert!(matches!(
            Envelope::timed_out().into_result(),
            Err(BridgeError::TimedOut)
        ));
        assert!(matches!(
            Envelope::surface_error("net::ERR").into_result(),
            Err(BridgeError::Surface(ref m)) if m == "net::ERR"
        ));
        let remote = decode(r#"{"namespace":"co.squaretwo.webclient","id":1,"type":"xResponse","error":"nope"}"#)
            .expect("decodes");
        assert!(matches!(remote.into_result(), Err(BridgeError::Remote(ref m)) if m == "nope"));
    }

    #[test]
    fn timed_out_envelope_shape() {
        let envelope = Envelope::timed_out();
        assert_eq!(envelope.id, -1);
        assert_eq!(envelope.kind, "TimedOut");
        assert_eq!(envelope.error.as_deref(), Some("Request Timed Out"));
    }

    #[test]
    fn post_message_script_survives_quotes() {
        let wire = Envelope::request("storageSetItemResponse", json!("it's \"quoted\"\\"), 1).to_wire();
        let script = post_message_script(&wire);
        assert!(script.starts_with("window.postMessage('"));
        assert!(script.ends_with("');"));
        assert!(script.contains(r#"it\'s \\"quoted\\"\\\\"#));
        assert!(!script.contains('\n'));
    }

    #[test]
    fn classifies_known_messages() {
        let nav = decode(r#"{"namespace":"co.squaretwo.webclient","id":1,"type":"navigationRouteUpdated","data":"/InboxScreen"}"#)
            .expect("decodes");
        assert_eq!(
            InboundMessage::from_envelope(&nav),
            InboundMessage::NavigationRouteUpdated("/InboxScreen".to_string())
        );

        let set = decode(r#"{"namespace":"co.squaretwo.webclient","id":2,"type":"storageSetItem","data":{"key":"k","value":"v"}}"#)
            .expect("decodes");
        assert_eq!(
            InboundMessage::from_envelope(&set),
            InboundMessage::StorageSetItem {
                key: "k".to_string(),
                value: "v".to_string()
            }
        );

        let user = decode(r#"{"namespace":"co.squaretwo.webclient","id":3,"type":"userUpdated","data":{"id":"u1","tickets":10,"tokens":"4","inboxCount":2.0}}"#)
            .expect("decodes");
        assert_eq!(
            InboundMessage::from_envelope(&user),
            InboundMessage::UserUpdated(UserData {
                id: "u1".to_string(),
                tickets: 10,
                tokens: 4,
                inbox_count: 2,
            })
        );
    }

    #[test]
    fn malformed_typed_payloads_fall_back_to_unknown() {
        let nav = decode(r#"{"namespace":"co.squaretwo.webclient","id":1,"type":"navigationRouteUpdated","data":5}"#)
            .expect("decodes");
        assert_eq!(InboundMessage::from_envelope(&nav), InboundMessage::Unknown(json!(5)));
    }

    #[test]
    fn receipt_payload_is_unwrapped() {
        assert_eq!(
            extract_receipt_payload(r#"{"Payload":"abc","Store":"GooglePlay"}"#).expect("payload"),
            "abc"
        );
        assert!(matches!(
            extract_receipt_payload(r#"{"Store":"x"}"#),
            Err(BridgeError::InvalidReceipt(_))
        ));
        assert!(extract_receipt_payload("garbage").is_err());
    }

    #[test]
    fn coerces_loose_integers() {
        assert_eq!(coerce_int(&json!(42)), Some(42));
        assert_eq!(coerce_int(&json!(42.0)), Some(42));
        assert_eq!(coerce_int(&json!(" 17 ")), Some(17));
        assert_eq!(coerce_int(&json!(true)), None);
        assert_eq!(coerce_int(&Value::Null), None);
    }
}
