//! Wire payload codec
//!
//! Every Venus OS value topic carries a JSON object with at least a `value`
//! key. Decoding is driven by the descriptor's [`ValueType`] and fails
//! closed: malformed JSON, a missing `value` field, or an explicit null all
//! decode to `None` (or the type's documented default), never an error.
//! Encoding produces the same JSON-with-`value`-key convention for writes.

use crate::enums::EnumMember;
use crate::error::{HubError, Result};
use crate::topics::{TopicDescriptor, ValueType};
use chrono::{DateTime, Utc};
use std::fmt;

const BITMASK_SEPARATOR: &str = ", ";

/// A decoded, typed metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Enum(&'static EnumMember),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Bool(v) => write!(f, "{v}"),
            MetricValue::String(v) => f.write_str(v),
            MetricValue::Enum(m) => f.write_str(m.label),
            MetricValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl MetricValue {
    /// Numeric view of the value, used by formulas and dynamic bounds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            MetricValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

pub(crate) fn round_to(value: f64, precision: Option<u32>) -> f64 {
    match precision {
        Some(p) => {
            let factor = 10f64.powi(p as i32);
            (value * factor).round() / factor
        }
        None => value,
    }
}

fn parse_payload(payload: &str) -> Option<serde_json::Value> {
    serde_json::from_str(payload).ok()
}

/// Read a named float field (`min`/`max`) from a payload, if present.
pub fn decode_float_field(payload: &str, field: &str) -> Option<f64> {
    parse_payload(payload)?.get(field)?.as_f64()
}

fn json_as_i64(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn json_as_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Decode a raw payload according to the descriptor's value type.
pub fn decode(payload: &str, descriptor: &TopicDescriptor) -> Option<MetricValue> {
    let json = parse_payload(payload);
    let value = json.as_ref().and_then(|j| j.get("value"));

    // IntDefaultZero substitutes zero for anything unusable and never yields None.
    if descriptor.value_type == ValueType::IntDefaultZero {
        let v = value.and_then(json_as_i64).unwrap_or(0);
        return Some(MetricValue::Int(v));
    }

    let value = value?;
    if value.is_null() {
        return None;
    }

    match descriptor.value_type {
        ValueType::Int | ValueType::IntDefaultZero => json_as_i64(value).map(MetricValue::Int),
        ValueType::Float => {
            json_as_f64(value).map(|v| MetricValue::Float(round_to(v, descriptor.precision)))
        }
        ValueType::Bool => match value {
            serde_json::Value::Bool(b) => Some(MetricValue::Bool(*b)),
            _ => json_as_i64(value).map(|v| MetricValue::Bool(v != 0)),
        },
        ValueType::String => match value {
            serde_json::Value::String(s) => Some(MetricValue::String(s.clone())),
            other => Some(MetricValue::String(other.to_string())),
        },
        ValueType::Enum => {
            let def = descriptor.enum_def?;
            let code = json_as_i64(value)?;
            def.member_by_code(code).map(MetricValue::Enum)
        }
        ValueType::Bitmask => {
            let def = descriptor.enum_def?;
            let bits = json_as_i64(value)?;
            let labels: Vec<&str> = def
                .members
                .iter()
                .filter(|m| bits & m.code != 0)
                .map(|m| m.label)
                .collect();
            Some(MetricValue::String(labels.join(BITMASK_SEPARATOR)))
        }
        ValueType::Epoch => {
            let secs = json_as_i64(value)?;
            DateTime::<Utc>::from_timestamp(secs, 0).map(MetricValue::Timestamp)
        }
        ValueType::IntSecondsToHours => {
            let secs = json_as_f64(value)?;
            Some(MetricValue::Float(round_to(
                secs / 3600.0,
                descriptor.precision,
            )))
        }
        ValueType::IntSecondsToMinutes => {
            let secs = json_as_f64(value)?;
            Some(MetricValue::Float(round_to(
                secs / 60.0,
                descriptor.precision,
            )))
        }
    }
}

/// Decode only the boolean `value` of a payload, used for adjustable-flag
/// companion topics regardless of the data descriptor's own value type.
pub fn decode_bool(payload: &str) -> Option<bool> {
    let json = parse_payload(payload)?;
    let value = json.get("value")?;
    if value.is_null() {
        return None;
    }
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        _ => json_as_i64(value).map(|v| v != 0),
    }
}

/// Encode a typed value into the wire payload for a write.
pub fn encode(value: &MetricValue, descriptor: &TopicDescriptor) -> Result<String> {
    let json = match (descriptor.value_type, value) {
        (ValueType::Int | ValueType::IntDefaultZero, MetricValue::Int(v)) => {
            serde_json::json!({ "value": v })
        }
        (ValueType::Float, MetricValue::Float(v)) => serde_json::json!({ "value": v }),
        (ValueType::Float, MetricValue::Int(v)) => serde_json::json!({ "value": *v as f64 }),
        (ValueType::Bool, MetricValue::Bool(v)) => {
            serde_json::json!({ "value": i64::from(*v) })
        }
        (ValueType::String, MetricValue::String(v)) => serde_json::json!({ "value": v }),
        (ValueType::Enum, MetricValue::Enum(member)) => {
            serde_json::json!({ "value": member.code })
        }
        (ValueType::Enum, MetricValue::String(label)) => {
            let def = descriptor
                .enum_def
                .ok_or_else(|| HubError::programming("enum descriptor without enum def"))?;
            let member = def.member_by_label(label).ok_or_else(|| {
                HubError::validation("value", &format!("unknown {} label: {label}", def.name))
            })?;
            serde_json::json!({ "value": member.code })
        }
        (ValueType::Bitmask, MetricValue::Int(bits)) => serde_json::json!({ "value": bits }),
        (ValueType::Bitmask, MetricValue::String(labels)) => {
            let def = descriptor
                .enum_def
                .ok_or_else(|| HubError::programming("bitmask descriptor without enum def"))?;
            let mut bits = 0i64;
            for label in labels.split(BITMASK_SEPARATOR).filter(|s| !s.is_empty()) {
                let member = def.member_by_label(label).ok_or_else(|| {
                    HubError::validation("value", &format!("unknown {} label: {label}", def.name))
                })?;
                bits |= member.code;
            }
            serde_json::json!({ "value": bits })
        }
        (ValueType::Epoch, MetricValue::Timestamp(t)) => {
            serde_json::json!({ "value": t.timestamp() })
        }
        (ValueType::IntSecondsToHours, MetricValue::Float(hours)) => {
            serde_json::json!({ "value": (hours * 3600.0).round() as i64 })
        }
        (ValueType::IntSecondsToMinutes, MetricValue::Float(minutes)) => {
            serde_json::json!({ "value": (minutes * 60.0).round() as i64 })
        }
        (expected, got) => {
            return Err(HubError::validation(
                "value".to_string(),
                format!("cannot encode {got:?} as {expected:?}"),
            ));
        }
    };
    Ok(json.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{BATTERY_ALARM, GENERIC_ON_OFF};
    use crate::topics::MetricKind;

    fn desc(value_type: ValueType) -> TopicDescriptor {
        TopicDescriptor::new("N/{installation_id}/grid/{device_id}/X", MetricKind::Sensor, "x", value_type)
            .name("X")
    }

    #[test]
    fn test_decode_int() {
        let d = desc(ValueType::Int);
        assert_eq!(decode(r#"{"value": 42}"#, &d), Some(MetricValue::Int(42)));
        assert_eq!(decode(r#"{"value": -7}"#, &d), Some(MetricValue::Int(-7)));
        assert_eq!(decode(r#"{"value": null}"#, &d), None);
        assert_eq!(decode("not json", &d), None);
        assert_eq!(decode(r#"{"other": 1}"#, &d), None);
    }

    #[test]
    fn test_decode_int_default_zero() {
        let d = desc(ValueType::IntDefaultZero);
        assert_eq!(decode(r#"{"value": 5}"#, &d), Some(MetricValue::Int(5)));
        assert_eq!(decode(r#"{"value": null}"#, &d), Some(MetricValue::Int(0)));
        assert_eq!(decode("garbage", &d), Some(MetricValue::Int(0)));
    }

    #[test]
    fn test_decode_float_rounds_to_precision() {
        let d = desc(ValueType::Float).precision(1);
        assert_eq!(
            decode(r#"{"value": 3.14159}"#, &d),
            Some(MetricValue::Float(3.1))
        );
    }

    #[test]
    fn test_decode_enum() {
        let d = desc(ValueType::Enum).enum_def(&GENERIC_ON_OFF);
        assert_eq!(
            decode(r#"{"value": 1}"#, &d),
            Some(MetricValue::Enum(&GENERIC_ON_OFF.members[1]))
        );
        // Unknown code decodes to nothing
        assert_eq!(decode(r#"{"value": 9}"#, &d), None);
    }

    #[test]
    fn test_decode_bitmask() {
        let d = desc(ValueType::Bitmask).enum_def(&BATTERY_ALARM);
        assert_eq!(
            decode(r#"{"value": 3}"#, &d),
            Some(MetricValue::String("Low voltage, High voltage".to_string()))
        );
        assert_eq!(
            decode(r#"{"value": 0}"#, &d),
            Some(MetricValue::String(String::new()))
        );
    }

    #[test]
    fn test_decode_durations() {
        let d = desc(ValueType::IntSecondsToHours).precision(1);
        assert_eq!(
            decode(r#"{"value": 5400}"#, &d),
            Some(MetricValue::Float(1.5))
        );
        let d = desc(ValueType::IntSecondsToMinutes).precision(0);
        assert_eq!(
            decode(r#"{"value": 120}"#, &d),
            Some(MetricValue::Float(2.0))
        );
    }

    #[test]
    fn test_decode_float_field() {
        assert_eq!(
            decode_float_field(r#"{"max": 1000000, "value": 50}"#, "max"),
            Some(1_000_000.0)
        );
        assert_eq!(decode_float_field(r#"{"value": 50}"#, "max"), None);
    }

    #[test]
    fn test_encode_round_trips() {
        let d = desc(ValueType::Int);
        let encoded = encode(&MetricValue::Int(-3), &d).unwrap();
        assert_eq!(decode(&encoded, &d), Some(MetricValue::Int(-3)));

        let d = desc(ValueType::Enum).enum_def(&GENERIC_ON_OFF);
        let on = MetricValue::Enum(&GENERIC_ON_OFF.members[1]);
        let encoded = encode(&on, &d).unwrap();
        assert_eq!(decode(&encoded, &d), Some(on));

        let d = desc(ValueType::Bitmask).enum_def(&BATTERY_ALARM);
        let flags = MetricValue::String("Low voltage, Low SOC".to_string());
        let encoded = encode(&flags, &d).unwrap();
        assert_eq!(decode(&encoded, &d), Some(flags));
    }

    #[test]
    fn test_encode_type_mismatch() {
        let d = desc(ValueType::Int);
        assert!(encode(&MetricValue::String("nope".to_string()), &d).is_err());
    }
}
