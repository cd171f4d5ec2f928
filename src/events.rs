// Inbound issuer webhook events

use blake2::{digest::consts::U32, Blake2b, Digest};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const CARD_CREATED: &str = "card.create.success";
pub const FUNDS_RECEIVED: &str = "deposit.received";

const UNKNOWN_EVENT_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardCreated {
    pub card_code: String,
    /// Our user id, handed to the issuer when the card was ordered.
    pub customer_id: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsReceived {
    pub deposit_address: String,
    pub amount: Decimal,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IssuerEvent {
    CardCreated(CardCreated),
    FundsReceived(FundsReceived),
    Unrecognised(String),
}

impl IssuerEvent {
    /// Unknown event types parse to `Unrecognised`; a known type with the
    /// wrong fields is an error.
    pub fn parse(event_type: &str, data: &Value) -> Result<Self, String> {
        match event_type {
            CARD_CREATED => serde_json::from_value(data.clone())
                .map(IssuerEvent::CardCreated)
                .map_err(|e| format!("invalid {} payload: {}", CARD_CREATED, e)),
            FUNDS_RECEIVED => serde_json::from_value(data.clone())
                .map(IssuerEvent::FundsReceived)
                .map_err(|e| format!("invalid {} payload: {}", FUNDS_RECEIVED, e)),
            other => Ok(IssuerEvent::Unrecognised(other.to_string())),
        }
    }
}

/// A webhook body after the envelope has been read, before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_type: String,
    pub idempotency_key: String,
    pub payload: Value,
    pub data: Value,
}

impl InboundEvent {
    /// Never fails: bodies that are not JSON or lack `eventType` are still
    /// kept so they can be recorded.
    pub fn from_body(body: &str) -> Self {
        let payload = serde_json::from_str::<Value>(body)
            .unwrap_or_else(|_| Value::String(body.to_string()));

        let event_type = payload
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_EVENT_TYPE)
            .to_string();
        let data = payload.get("eventData").cloned().unwrap_or(Value::Null);

        let idempotency_key = match payload.get("eventId") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                let hashed = if data.is_null() { &payload } else { &data };
                format!("{}:{}", event_type, content_hash(hashed))
            }
        };

        Self {
            event_type,
            idempotency_key,
            payload,
            data,
        }
    }
}

/// Blake2b-256 over the canonical JSON form, so field order in the delivery
/// does not change the hash.
fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    hex::encode(Blake2b::<U32>::digest(canonical.as_bytes()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_funds_received() {
        let event = InboundEvent::from_body(
            r#"{"eventType":"deposit.received","eventData":{"depositAddress":"0xabc","amount":"6.0"}}"#,
        );
        assert_eq!(event.event_type, FUNDS_RECEIVED);
        match IssuerEvent::parse(&event.event_type, &event.data).unwrap() {
            IssuerEvent::FundsReceived(funds) => {
                assert_eq!(funds.deposit_address, "0xabc");
                assert_eq!(funds.amount, dec!(6));
                assert!(funds.tx_hash.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_known_type_with_bad_fields_is_an_error() {
        assert!(IssuerEvent::parse(CARD_CREATED, &serde_json::json!({"cardCode": 1})).is_err());
        assert_eq!(
            IssuerEvent::parse("card.shipped", &Value::Null).unwrap(),
            IssuerEvent::Unrecognised("card.shipped".into())
        );
    }

    #[test]
    fn test_key_prefers_event_id() {
        let event = InboundEvent::from_body(
            r#"{"eventId":"evt_1","eventType":"deposit.received","eventData":{}}"#,
        );
        assert_eq!(event.idempotency_key, "evt_1");
    }

    #[test]
    fn test_content_key_ignores_field_order() {
        let a = InboundEvent::from_body(
            r#"{"eventType":"deposit.received","eventData":{"depositAddress":"0xabc","amount":"6"}}"#,
        );
        let b = InboundEvent::from_body(
            r#"{"eventData":{"amount":"6","depositAddress":"0xabc"},"eventType":"deposit.received"}"#,
        );
        let c = InboundEvent::from_body(
            r#"{"eventType":"deposit.received","eventData":{"depositAddress":"0xabc","amount":"7"}}"#,
        );
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.idempotency_key, c.idempotency_key);
        assert!(a.idempotency_key.starts_with("deposit.received:"));
    }

    #[test]
    fn test_garbage_body_is_still_keyed() {
        let event = InboundEvent::from_body("not json");
        assert_eq!(event.event_type, "unknown");
        assert_eq!(event.payload, Value::String("not json".into()));
        assert!(event.idempotency_key.starts_with("unknown:"));
    }
}
