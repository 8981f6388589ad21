//! Incoming topic parsing
//!
//! Turns a concrete topic string into the structured fields used for pattern
//! lookup. Parsing is deliberately forgiving: anything that does not look
//! like a Venus OS value topic yields `None` and the message is dropped
//! upstream with a debug trace.

use crate::enums::DeviceType;
use crate::topics::TopicDescriptor;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::Arc;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

/// Structured view of one incoming topic.
///
/// Example: `N/123456789012/grid/30/Ac/L1/Energy/Forward`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub installation_id: String,
    pub device_id: String,
    pub device_type: DeviceType,
    /// Normalized form with the device-type segment intact
    pub wildcards_with_device_type: String,
    /// Normalized form with the device-type segment blanked as well; some
    /// table entries (attributes) do not name a device type
    pub wildcards_without_device_type: String,
    pub full_topic: String,
}

/// Fields that only exist once a descriptor has been matched.
///
/// Produced by [`ParsedTopic::finalize`]; constructing them through that one
/// call is what guarantees the "finalize runs exactly once, after a match"
/// invariant.
#[derive(Debug, Clone)]
pub struct TopicFields {
    /// Captured placeholder values, e.g. `phase -> "L1"`, `output -> "2"`
    pub key_values: HashMap<String, String>,
    pub short_id: String,
    pub name: String,
}

impl ParsedTopic {
    /// Parse a raw topic, or `None` when it cannot belong to a known device.
    pub fn from_topic(topic: &str) -> Option<ParsedTopic> {
        let parts: Vec<&str> = topic.split('/').collect();

        // The root heartbeat is the single acceptable 3-segment topic and
        // belongs to the system device.
        if parts.len() == 3 && parts[2] == "heartbeat" {
            let normalized = format!("{}/+/{}", parts[0], parts[2]);
            return Some(ParsedTopic {
                installation_id: parts[1].to_string(),
                device_id: "0".to_string(),
                device_type: DeviceType::System,
                wildcards_with_device_type: normalized.clone(),
                wildcards_without_device_type: normalized,
                full_topic: topic.to_string(),
            });
        }

        if parts.len() < 4 {
            return None;
        }

        let installation_id = parts[1].to_string();
        let device_id = parts[3].to_string();

        // Settings topics encode the real device type deeper in the path.
        let native_device_type = if parts[2] == "settings" {
            *parts.get(5)?
        } else {
            parts[2]
        };
        let device_type = DeviceType::from_code(native_device_type);
        if device_type == DeviceType::Unknown {
            return None;
        }

        let mut wildcard_parts: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        wildcard_parts[1] = "+".to_string();
        wildcard_parts[3] = "+".to_string();
        let wildcards_with_device_type = Self::normalize_topic(&wildcard_parts.join("/"));
        wildcard_parts[2] = "+".to_string();
        let wildcards_without_device_type = Self::normalize_topic(&wildcard_parts.join("/"));

        Some(ParsedTopic {
            installation_id,
            device_id,
            device_type,
            wildcards_with_device_type,
            wildcards_without_device_type,
            full_topic: topic.to_string(),
        })
    }

    /// Collapse variable segments to stable markers so many concrete topics
    /// share one lookup key.
    pub fn normalize_topic(topic: &str) -> String {
        topic
            .split('/')
            .map(|part| {
                if !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                    "##num##"
                } else if matches!(part, "L1" | "L2" | "L3") {
                    "##phase##"
                } else {
                    part
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Resolve captured placeholders and the short-id/name templates against
    /// a matched descriptor. Runs once per message, after the match.
    pub fn finalize(&self, descriptor: &TopicDescriptor) -> TopicFields {
        let mut key_values = self.capture_key_values(descriptor);
        for (k, v) in &descriptor.key_values {
            key_values.insert(k.clone(), v.clone());
        }
        let next = key_values.get("phase").and_then(|phase| next_phase(phase));
        if let Some(next) = next {
            key_values.insert("next_phase".to_string(), next.to_string());
        }

        let short_id = replace_ids(&descriptor.short_id, &key_values);
        let name = descriptor
            .name
            .as_deref()
            .map(|n| replace_ids(n, &key_values))
            .unwrap_or_else(|| short_id.clone());

        TopicFields {
            key_values,
            short_id,
            name,
        }
    }

    /// Disambiguate a multi-candidate lookup by literal pattern match
    /// against the full topic (placeholder segments match anything).
    pub fn match_from_list(
        &self,
        candidates: &[Arc<TopicDescriptor>],
    ) -> Option<Arc<TopicDescriptor>> {
        let actual: Vec<&str> = self.full_topic.split('/').collect();
        candidates
            .iter()
            .find(|desc| {
                let pattern: Vec<&str> = desc.topic.split('/').collect();
                pattern.len() == actual.len()
                    && pattern.iter().zip(&actual).all(|(p, a)| {
                        p == a || (p.starts_with('{') && p.ends_with('}')) || *p == "+"
                    })
            })
            .cloned()
    }

    fn capture_key_values(&self, descriptor: &TopicDescriptor) -> HashMap<String, String> {
        let actual: Vec<&str> = self.full_topic.split('/').collect();
        let mut result = HashMap::new();
        for (i, part) in descriptor.topic.split('/').enumerate() {
            if part.starts_with('{')
                && part.ends_with('}')
                && let Some(value) = actual.get(i)
            {
                let key = part.trim_matches(|c| c == '{' || c == '}');
                result.insert(key.to_string(), (*value).to_string());
            }
        }
        result
    }

    /// `{device_type}_{device_id}`, unique within one installation.
    pub fn make_device_short_unique_id(device_type_code: &str, device_id: &str) -> String {
        format!("{device_type_code}_{device_id}")
    }

    /// `{device_short_id}_{short_id}`, unique within one hub.
    pub fn make_hub_unique_id(device_short_unique_id: &str, short_id: &str) -> String {
        format!("{device_short_unique_id}_{short_id}")
    }
}

/// Replace `{key}` placeholders with captured values, leaving unknown keys
/// untouched (monikers like `{key:ref}` survive for the phase-2 pass).
pub fn replace_ids(template: &str, key_values: &HashMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            key_values
                .get(key)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// The next phase in rotation (L1 -> L2 -> L3 -> L1).
fn next_phase(phase: &str) -> Option<&'static str> {
    match phase {
        "L1" => Some("L2"),
        "L2" => Some("L3"),
        "L3" => Some("L1"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_short_topic() {
        assert!(ParsedTopic::from_topic("N/123").is_none());
        assert!(ParsedTopic::from_topic("N/123/grid").is_none());
    }

    #[test]
    fn test_heartbeat_special_case() {
        let parsed = ParsedTopic::from_topic("N/123/heartbeat").unwrap();
        assert_eq!(parsed.device_type, DeviceType::System);
        assert_eq!(parsed.device_id, "0");
        assert_eq!(parsed.wildcards_with_device_type, "N/+/heartbeat");
    }

    #[test]
    fn test_unknown_device_type() {
        assert!(ParsedTopic::from_topic("N/123/frobnicator/0/Value").is_none());
    }

    #[test]
    fn test_normalization_markers() {
        let parsed = ParsedTopic::from_topic("N/123/grid/30/Ac/L1/Energy/Forward").unwrap();
        assert_eq!(
            parsed.wildcards_with_device_type,
            "N/+/grid/+/Ac/##phase##/Energy/Forward"
        );
        assert_eq!(
            parsed.wildcards_without_device_type,
            "N/+/+/+/Ac/##phase##/Energy/Forward"
        );
    }

    #[test]
    fn test_settings_device_type_from_deeper_segment() {
        let parsed =
            ParsedTopic::from_topic("N/123/settings/0/Settings/CGwacs/AcPowerSetPoint").unwrap();
        assert_eq!(parsed.device_type, DeviceType::System);
        assert_eq!(parsed.device_id, "0");
    }

    #[test]
    fn test_replace_ids_keeps_unknown_keys() {
        let mut kv = HashMap::new();
        kv.insert("phase".to_string(), "L2".to_string());
        assert_eq!(replace_ids("grid_power_{phase}", &kv), "grid_power_L2");
        assert_eq!(replace_ids("{missing}_x", &kv), "{missing}_x");
    }
}
