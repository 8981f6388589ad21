//! Topic pattern matching
//!
//! Built once at hub construction: expands range placeholders, applies
//! operation-mode and device-type filtering, then indexes the descriptor
//! table by normalized topic shape. Lookup resolves an incoming parsed topic
//! to its descriptor in a fixed precedence order, disambiguating shapes that
//! several descriptors share.

use crate::config::OperationMode;
use crate::enums::DeviceType;
use crate::topic_parser::ParsedTopic;
use crate::topics::{MetricKind, TopicDescriptor};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\((\d+)-(\d+)\)\}").unwrap());

/// Lookup structure from normalized topic shape to candidate descriptors.
pub struct TopicMap {
    /// Normalized shape -> candidates; a list because some shapes are
    /// ambiguous (e.g. daily-history "today" vs "yesterday")
    primary: HashMap<String, Vec<Arc<TopicDescriptor>>>,
    /// Same, for adjustable-flag companion topics; values are the *data*
    /// descriptors the flag correlates back to
    fallback: HashMap<String, Vec<Arc<TopicDescriptor>>>,
    /// Service-kind descriptors by short id, for `Hub::publish`
    services: HashMap<String, Arc<TopicDescriptor>>,
    /// MQTT subscription patterns, still carrying `{installation_id}`
    subscriptions: Vec<String>,
    /// Formula descriptors awaiting activation
    formulas: Vec<Arc<TopicDescriptor>>,
}

impl TopicMap {
    /// Build the lookup maps from a descriptor table.
    pub fn build(
        table: Vec<TopicDescriptor>,
        mode: OperationMode,
        exclude: &[DeviceType],
    ) -> TopicMap {
        let mut services = HashMap::new();
        let mut active: Vec<TopicDescriptor> = Vec::new();

        for desc in table {
            if desc.experimental && mode != OperationMode::Experimental {
                continue;
            }
            if desc.message_kind == MetricKind::Service {
                services.insert(desc.short_id.clone(), Arc::new(desc));
                continue;
            }
            active.push(downgrade_for_mode(desc, mode));
        }

        let expanded = expand_topic_list(active);

        let relevant: Vec<Arc<TopicDescriptor>> = expanded
            .into_iter()
            .filter(|desc| {
                if desc.message_kind == MetricKind::Attribute || exclude.is_empty() {
                    return true;
                }
                match topic_device_type(&desc.topic) {
                    Some(device_type) if exclude.contains(&device_type) => {
                        info!(topic = %desc.topic, ?device_type, "Topic filtered by device type");
                        false
                    }
                    _ => true,
                }
            })
            .map(Arc::new)
            .collect();

        let mut primary: HashMap<String, Vec<Arc<TopicDescriptor>>> = HashMap::new();
        let mut fallback: HashMap<String, Vec<Arc<TopicDescriptor>>> = HashMap::new();
        let mut subscriptions: Vec<String> = Vec::new();
        let mut formulas = Vec::new();

        for desc in &relevant {
            // Formula topics are not indexed; they are resolved against
            // devices at each barrier instead.
            if desc.is_formula() {
                info!(topic = %desc.topic, "Formula topic detected");
                formulas.push(desc.clone());
                continue;
            }

            primary
                .entry(normalize_pattern(&desc.topic))
                .or_default()
                .push(desc.clone());
            push_unique(&mut subscriptions, subscription_pattern(&desc.topic));

            if let Some(merged) = merge_adjustable_topic(desc) {
                fallback
                    .entry(normalize_pattern(&merged))
                    .or_default()
                    .push(desc.clone());
                push_unique(&mut subscriptions, subscription_pattern(&merged));
            }
        }

        TopicMap {
            primary,
            fallback,
            services,
            subscriptions,
            formulas,
        }
    }

    /// Resolve a parsed topic to a descriptor.
    ///
    /// Precedence: primary with device type, primary without, fallback with,
    /// fallback without. The boolean is true when the match came from the
    /// fallback (adjustable-flag) map.
    pub fn lookup(&self, parsed: &ParsedTopic) -> Option<(Arc<TopicDescriptor>, bool)> {
        for (map, via_fallback) in [(&self.primary, false), (&self.fallback, true)] {
            for key in [
                &parsed.wildcards_with_device_type,
                &parsed.wildcards_without_device_type,
            ] {
                if let Some(candidates) = map.get(key) {
                    let matched = if candidates.len() == 1 {
                        Some(candidates[0].clone())
                    } else if via_fallback {
                        self.match_fallback_from_list(parsed, candidates)
                    } else {
                        parsed.match_from_list(candidates)
                    };
                    return matched.map(|desc| (desc, via_fallback));
                }
            }
        }
        None
    }

    /// Service descriptor lookup for `Hub::publish`.
    pub fn service(&self, short_id: &str) -> Option<Arc<TopicDescriptor>> {
        self.services.get(short_id).cloned()
    }

    /// Subscription patterns, `{installation_id}` still unexpanded.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Formula descriptors, in table order.
    pub fn formulas(&self) -> &[Arc<TopicDescriptor>] {
        &self.formulas
    }

    /// Ambiguous fallback shapes are matched against the merged
    /// (suffix-substituted) pattern, since the incoming topic is the flag
    /// topic, not the data topic.
    fn match_fallback_from_list(
        &self,
        parsed: &ParsedTopic,
        candidates: &[Arc<TopicDescriptor>],
    ) -> Option<Arc<TopicDescriptor>> {
        let actual: Vec<&str> = parsed.full_topic.split('/').collect();
        candidates
            .iter()
            .find(|desc| {
                let Some(merged) = merge_adjustable_topic(desc) else {
                    return false;
                };
                let pattern: Vec<&str> = merged.split('/').collect();
                pattern.len() == actual.len()
                    && pattern.iter().zip(&actual).all(|(p, a)| {
                        p == a || (p.starts_with('{') && p.ends_with('}')) || *p == "+"
                    })
            })
            .cloned()
    }
}

/// Read-only mode exposes writable kinds as plain sensors.
fn downgrade_for_mode(desc: TopicDescriptor, mode: OperationMode) -> TopicDescriptor {
    if mode != OperationMode::ReadOnly {
        return desc;
    }
    let downgraded_kind = match desc.message_kind {
        MetricKind::Switch => MetricKind::BinarySensor,
        MetricKind::Number | MetricKind::Select => MetricKind::Sensor,
        other => other,
    };
    TopicDescriptor {
        message_kind: downgraded_kind,
        ..desc
    }
}

/// Expand descriptors with range placeholders like `{output(1-4)}` into one
/// concrete descriptor per integer, each carrying its value in `key_values`.
pub fn expand_topic_list(table: Vec<TopicDescriptor>) -> Vec<TopicDescriptor> {
    let mut expanded = Vec::with_capacity(table.len());
    for desc in table {
        let Some(caps) = RANGE_RE.captures(&desc.topic) else {
            expanded.push(desc);
            continue;
        };
        let key = caps[1].to_string();
        let (Ok(start), Ok(end)) = (caps[2].parse::<u32>(), caps[3].parse::<u32>()) else {
            expanded.push(desc);
            continue;
        };
        for i in start..=end {
            let mut clone = desc.clone();
            clone.topic = RANGE_RE.replace(&desc.topic, i.to_string()).into_owned();
            clone.key_values = HashMap::from([(key.clone(), i.to_string())]);
            expanded.push(clone);
        }
    }
    expanded
}

/// The device type a topic pattern belongs to, where it names one.
pub fn topic_device_type(topic: &str) -> Option<DeviceType> {
    let parts: Vec<&str> = topic.split('/').collect();
    let code = if parts.first() == Some(&"$$func") {
        parts.get(1)?
    } else if parts.get(2) == Some(&"settings") {
        parts.get(5)?
    } else {
        parts.get(2)?
    };
    if code.starts_with('{') || *code == "+" {
        return None;
    }
    match DeviceType::from_code(code) {
        DeviceType::Unknown => None,
        device_type => Some(device_type),
    }
}

/// Companion flag topic for an adjustable entry: the data topic with its
/// last segment replaced by the adjustable suffix.
pub fn merge_adjustable_topic(desc: &TopicDescriptor) -> Option<String> {
    let suffix = desc.is_adjustable_suffix?;
    let (head, _) = desc.topic.rsplit_once('/')?;
    Some(format!("{head}/{suffix}"))
}

/// Normalize a descriptor pattern to the same key form the parser produces
/// for incoming topics.
fn normalize_pattern(topic: &str) -> String {
    let parts: Vec<&str> = topic.split('/').collect();
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let is_placeholder = part.starts_with('{') && part.ends_with('}');
            if i == 1 {
                "+".to_string()
            } else if i == 3 && parts.len() >= 4 {
                "+".to_string()
            } else if *part == "{phase}" {
                "##phase##".to_string()
            } else if is_placeholder || (!part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
            {
                "##num##".to_string()
            } else {
                (*part).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// MQTT wire pattern: every placeholder except `{installation_id}` becomes a
/// single-level wildcard.
fn subscription_pattern(topic: &str) -> String {
    topic
        .split('/')
        .map(|part| {
            if part.starts_with('{') && part.ends_with('}') && part != "{installation_id}" {
                "+"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}
