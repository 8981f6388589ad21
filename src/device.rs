//! Victron devices and update routing
//!
//! A [`Device`] groups the metrics of one physical or logical unit (one
//! battery, one solar charger, the system itself). Devices are created
//! lazily on the first message that references them and live for the hub
//! session. Until the full-publish barrier commits them, incoming values
//! are buffered as placeholders.

use crate::codec::{self, MetricValue};
use crate::enums::DeviceType;
use crate::hub::HubInner;
use crate::metric::{Metric, MetricInit, lock};
use crate::topic_parser::{ParsedTopic, TopicFields};
use crate::topics::{MetricKind, RangeType, TopicDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

struct DeviceState {
    model: Option<String>,
    manufacturer: Option<String>,
    serial_number: Option<String>,
    firmware_version: Option<String>,
    custom_name: Option<String>,
    /// Keyed by the metric's fully-qualified unique id
    metrics: HashMap<String, Metric>,
}

pub(crate) struct DeviceShared {
    full_unique_id: String,
    short_unique_id: String,
    device_type: DeviceType,
    device_id: String,
    installation_id: String,
    state: Mutex<DeviceState>,
}

/// Representation of one Victron device.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(parsed: &ParsedTopic) -> Device {
        let short_unique_id = ParsedTopic::make_device_short_unique_id(
            parsed.device_type.code(),
            &parsed.device_id,
        );
        let full_unique_id = format!("{}_{}", parsed.installation_id, short_unique_id);
        debug!(unique_id = %full_unique_id, "Device initialized");
        Device {
            shared: Arc::new(DeviceShared {
                full_unique_id,
                short_unique_id,
                device_type: parsed.device_type,
                device_id: parsed.device_id.clone(),
                installation_id: parsed.installation_id.clone(),
                state: Mutex::new(DeviceState {
                    model: None,
                    manufacturer: None,
                    serial_number: None,
                    firmware_version: None,
                    custom_name: None,
                    metrics: HashMap::new(),
                }),
            }),
        }
    }

    /// Fully-qualified unique id: `{installation_id}_{device_type}_{device_id}`.
    pub fn unique_id(&self) -> &str {
        &self.shared.full_unique_id
    }

    /// Short unique id: `{device_type}_{device_id}`.
    pub fn short_unique_id(&self) -> &str {
        &self.shared.short_unique_id
    }

    pub fn device_type(&self) -> DeviceType {
        self.shared.device_type
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn installation_id(&self) -> &str {
        &self.shared.installation_id
    }

    /// Display name: custom name, else model, else the device-type label.
    pub fn name(&self) -> String {
        let st = lock(&self.shared.state);
        if let Some(custom_name) = &st.custom_name {
            return custom_name.clone();
        }
        drop(st);
        match self.model() {
            Some(model) => model,
            None => self.shared.device_type.label().to_string(),
        }
    }

    pub fn model(&self) -> Option<String> {
        let st = lock(&self.shared.state);
        if let Some(model) = &st.model {
            return Some(model.clone());
        }
        (self.shared.device_type == DeviceType::System).then(|| "Victron Venus".to_string())
    }

    pub fn manufacturer(&self) -> Option<String> {
        lock(&self.shared.state).manufacturer.clone()
    }

    pub fn serial_number(&self) -> Option<String> {
        lock(&self.shared.state).serial_number.clone()
    }

    pub fn firmware_version(&self) -> Option<String> {
        lock(&self.shared.state).firmware_version.clone()
    }

    pub fn custom_name(&self) -> Option<String> {
        lock(&self.shared.state).custom_name.clone()
    }

    /// All metrics currently committed on this device.
    pub fn metrics(&self) -> Vec<Metric> {
        lock(&self.shared.state).metrics.values().cloned().collect()
    }

    /// Look up a metric by its fully-qualified unique id.
    pub fn metric(&self, unique_id: &str) -> Option<Metric> {
        lock(&self.shared.state).metrics.get(unique_id).cloned()
    }

    /// Look up a metric by its device-local short id.
    pub fn metric_by_short_id(&self, short_id: &str) -> Option<Metric> {
        lock(&self.shared.state)
            .metrics
            .values()
            .find(|m| m.short_id() == short_id)
            .cloned()
    }

    pub(crate) fn has_metrics(&self) -> bool {
        !lock(&self.shared.state).metrics.is_empty()
    }

    /// Route one matched message for this device.
    ///
    /// Attribute messages update device properties in place. Messages for
    /// already-committed metrics update the metric directly. Everything else
    /// is buffered as a placeholder until the next full-publish barrier.
    pub(crate) fn handle_message(
        &self,
        via_fallback: bool,
        parsed: &ParsedTopic,
        descriptor: &Arc<TopicDescriptor>,
        payload: &str,
    ) -> Option<Placeholder> {
        debug!(device = %self.shared.full_unique_id, topic = %parsed.full_topic, "Handling message");

        if descriptor.message_kind == MetricKind::Attribute {
            self.set_property_from_topic(descriptor, payload);
            return None;
        }

        if via_fallback {
            let Some(value) = codec::decode_bool(payload) else {
                debug!(
                    device = %self.shared.full_unique_id,
                    metric = %descriptor.short_id,
                    "Ignoring null adjustable-flag payload"
                );
                return None;
            };
            let fields = parsed.finalize(descriptor);
            let hub_unique_id =
                ParsedTopic::make_hub_unique_id(&self.shared.short_unique_id, &fields.short_id);
            return Some(Placeholder::Fallback(FallbackPlaceholder {
                hub_unique_id,
                parsed_topic: parsed.clone(),
                value,
            }));
        }

        let Some(value) = codec::decode(payload, descriptor) else {
            debug!(
                device = %self.shared.full_unique_id,
                metric = %descriptor.short_id,
                "Ignoring undecodable payload"
            );
            return None;
        };

        let fields = parsed.finalize(descriptor);
        let hub_unique_id =
            ParsedTopic::make_hub_unique_id(&self.shared.short_unique_id, &fields.short_id);
        let full_unique_id = format!("{}_{}", self.shared.full_unique_id, fields.short_id);

        if let Some(metric) = self.metric(&full_unique_id) {
            metric.handle_value(value);
            return None;
        }

        Some(Placeholder::Metric(MetricPlaceholder {
            device: self.clone(),
            hub_unique_id,
            full_unique_id,
            parsed_topic: parsed.clone(),
            fields,
            descriptor: descriptor.clone(),
            payload: payload.to_string(),
            value,
        }))
    }

    /// Commit a buffered placeholder into a concrete metric.
    pub(crate) fn add_placeholder(
        &self,
        placeholder: &MetricPlaceholder,
        fallbacks: &[FallbackPlaceholder],
        hub: &Arc<HubInner>,
    ) -> Metric {
        info!(metric = %placeholder.full_unique_id, "Creating new metric on device");

        let descriptor = specialize_descriptor(
            &placeholder.descriptor,
            fallbacks,
            &placeholder.parsed_topic,
            &placeholder.payload,
        );

        let write_topic = (descriptor.message_kind.is_writable()
            && placeholder.parsed_topic.full_topic.starts_with('N'))
        .then(|| format!("W{}", &placeholder.parsed_topic.full_topic[1..]));

        let metric = Metric::new(
            MetricInit {
                descriptor,
                full_unique_id: placeholder.full_unique_id.clone(),
                hub_unique_id: placeholder.hub_unique_id.clone(),
                short_id: placeholder.fields.short_id.clone(),
                name: placeholder.fields.name.clone(),
                key_values: placeholder.fields.key_values.clone(),
                device_type: self.shared.device_type,
                write_topic,
            },
            hub,
        );
        metric.handle_value(placeholder.value.clone());
        lock(&self.shared.state)
            .metrics
            .insert(metric.unique_id().to_string(), metric.clone());
        metric
    }

    /// Instantiate a formula metric on this device; dependencies are wired
    /// up by the engine afterwards.
    pub(crate) fn add_formula_metric(
        &self,
        descriptor: &Arc<TopicDescriptor>,
        hub: &Arc<HubInner>,
    ) -> Metric {
        let short_id = descriptor.short_id.clone();
        let hub_unique_id =
            ParsedTopic::make_hub_unique_id(&self.shared.short_unique_id, &short_id);
        let full_unique_id = format!("{}_{}", self.shared.full_unique_id, short_id);
        let name = descriptor.name.clone().unwrap_or_else(|| short_id.clone());
        let metric = Metric::new(
            MetricInit {
                descriptor: descriptor.clone(),
                full_unique_id,
                hub_unique_id,
                short_id,
                name,
                key_values: HashMap::new(),
                device_type: self.shared.device_type,
                write_topic: None,
            },
            hub,
        );
        lock(&self.shared.state)
            .metrics
            .insert(metric.unique_id().to_string(), metric.clone());
        metric
    }

    fn set_property_from_topic(&self, descriptor: &TopicDescriptor, payload: &str) {
        let Some(value) = codec::decode(payload, descriptor) else {
            debug!(
                device = %self.shared.full_unique_id,
                property = %descriptor.short_id,
                "Ignoring empty attribute payload"
            );
            return;
        };
        let value = match value {
            MetricValue::String(s) => s,
            other => other.to_string(),
        };
        debug!(
            device = %self.shared.full_unique_id,
            property = %descriptor.short_id,
            value = %value,
            "Setting device property"
        );

        let mut st = lock(&self.shared.state);
        match descriptor.short_id.as_str() {
            "model" => st.model = Some(value),
            "serial_number" => st.serial_number = Some(value),
            "manufacturer" => st.manufacturer = Some(value),
            "firmware_version" => st.firmware_version = Some(value),
            "custom_name" => st.custom_name = Some(value),
            "victron_productid" => {} // not surfaced
            other => warn!(
                device = %self.shared.full_unique_id,
                property = other,
                "Unhandled device property"
            ),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("unique_id", &self.shared.full_unique_id)
            .field("device_type", &self.shared.device_type)
            .field("name", &self.name())
            .finish()
    }
}

/// Buffered update for a metric that does not exist yet.
#[derive(Debug)]
pub(crate) struct MetricPlaceholder {
    pub(crate) device: Device,
    pub(crate) hub_unique_id: String,
    pub(crate) full_unique_id: String,
    pub(crate) parsed_topic: ParsedTopic,
    pub(crate) fields: TopicFields,
    pub(crate) descriptor: Arc<TopicDescriptor>,
    pub(crate) payload: String,
    pub(crate) value: MetricValue,
}

/// Buffered adjustable-flag value; never creates a metric by itself.
#[derive(Debug)]
pub(crate) struct FallbackPlaceholder {
    pub(crate) hub_unique_id: String,
    pub(crate) parsed_topic: ParsedTopic,
    pub(crate) value: bool,
}

pub(crate) enum Placeholder {
    Metric(MetricPlaceholder),
    Fallback(FallbackPlaceholder),
}

/// Two topics belong to the same adjustable pair when they differ only in
/// the last segment.
fn is_same_adjustable_topic(topic: &str, other: &str) -> bool {
    match (topic.rsplit_once('/'), other.rsplit_once('/')) {
        (Some((head_a, _)), Some((head_b, _))) => head_a == head_b,
        _ => false,
    }
}

/// Specialize a shared table descriptor for one concrete metric.
///
/// Pure function: the input descriptor is never mutated, so devices sharing
/// one table entry cannot alias each other's specializations. Covers the
/// adjustable-flag downgrade and dynamic min/max bounds.
fn specialize_descriptor(
    descriptor: &Arc<TopicDescriptor>,
    fallbacks: &[FallbackPlaceholder],
    parsed: &ParsedTopic,
    payload: &str,
) -> Arc<TopicDescriptor> {
    let mut specialized: Option<TopicDescriptor> = None;

    if descriptor.is_adjustable_suffix.is_some() {
        // A false companion flag turns the writable entity into a plain sensor.
        let flag = fallbacks
            .iter()
            .find(|fp| is_same_adjustable_topic(&fp.parsed_topic.full_topic, &parsed.full_topic));
        if let Some(flag) = flag
            && !flag.value
        {
            info!(topic = %descriptor.topic, "Adjustable flag is off, exposing as read-only");
            let mut desc = descriptor.as_ref().clone();
            desc.message_kind = MetricKind::Sensor;
            specialized = Some(desc);
        }
    }

    if descriptor.min_max_range == RangeType::Dynamic {
        let max = codec::decode_float_field(payload, "max");
        let min = codec::decode_float_field(payload, "min");
        if max.is_some() || min.is_some() {
            let mut desc =
                specialized.unwrap_or_else(|| descriptor.as_ref().clone());
            if let Some(max) = max {
                info!(topic = %descriptor.topic, max, "Setting dynamic max bound");
                desc.max = Some(max);
            }
            if let Some(min) = min {
                info!(topic = %descriptor.topic, min, "Setting dynamic min bound");
                desc.min = Some(min);
            }
            specialized = Some(desc);
        }
    }

    match specialized {
        Some(desc) => Arc::new(desc),
        None => descriptor.clone(),
    }
}
