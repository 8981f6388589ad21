//! Metric resolution engine
//!
//! Routes every incoming (topic, payload) pair through parse, descriptor
//! lookup and device routing, buffers placeholder updates, and commits them
//! into live metrics when the device signals a completed full publish.
//! All mutation happens on the hub's single engine context; messages that
//! cannot be resolved are dropped with a debug trace, never an error.

use crate::device::{Device, FallbackPlaceholder, MetricPlaceholder, Placeholder};
use crate::formula;
use crate::hub::{HubInner, get_keepalive_echo};
use crate::metric::{Metric, lock};
use crate::topic_parser::{ParsedTopic, replace_ids};
use crate::topics::TopicDescriptor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Work handed from the engine to the notifier task. Application callbacks
/// only ever run there, so they cannot race engine mutation.
pub(crate) enum Notification {
    NewMetric { device: Device, metric: Metric },
    Updated { metric: Metric },
}

/// Engine-side mutable state, keyed maps of everything resolved so far.
pub(crate) struct EngineState {
    /// Devices by short unique id
    pub(crate) devices: HashMap<String, Device>,
    /// Committed metrics by hub unique id (`{device}_{id}_{short_id}`)
    pub(crate) all_metrics: HashMap<String, Metric>,
    /// Buffered metric updates awaiting the barrier, by hub unique id
    pub(crate) placeholders: HashMap<String, MetricPlaceholder>,
    /// Buffered adjustable-flag values, by hub unique id
    pub(crate) fallback_placeholders: HashMap<String, FallbackPlaceholder>,
    pub(crate) first_full_publish: bool,
}

impl EngineState {
    pub(crate) fn new() -> EngineState {
        EngineState {
            devices: HashMap::new(),
            all_metrics: HashMap::new(),
            placeholders: HashMap::new(),
            fallback_placeholders: HashMap::new(),
            first_full_publish: true,
        }
    }
}

impl HubInner {
    /// Entry point for every message delivered by the transport.
    pub(crate) fn handle_raw_message(self: &Arc<Self>, topic: &str, payload: &str) {
        let topic = self.strip_topic_prefix(topic);
        debug!(topic = %topic, payload = %payload, "Message received");

        if self.snapshot_active() {
            self.handle_snapshot_message(topic, payload);
            return;
        }

        if topic.contains("full_publish_completed") {
            self.handle_full_publish(payload);
            return;
        }

        if self.installation_id().is_none() {
            self.try_capture_installation_id(topic, payload);
        }

        self.handle_normal_message(topic, payload);
    }

    fn handle_normal_message(self: &Arc<Self>, topic: &str, payload: &str) {
        let Some(parsed) = ParsedTopic::from_topic(topic) else {
            debug!(topic = %topic, "Ignoring message - could not parse topic");
            return;
        };
        let Some((descriptor, via_fallback)) = self.topic_map.lookup(&parsed) else {
            debug!(topic = %topic, "Ignoring message - no descriptor found");
            return;
        };

        let device = self.get_or_create_device(&parsed);
        match device.handle_message(via_fallback, &parsed, &descriptor, payload) {
            Some(Placeholder::Metric(placeholder)) => {
                let mut st = lock(&self.state);
                if let Some(previous) = st
                    .placeholders
                    .insert(placeholder.hub_unique_id.clone(), placeholder)
                {
                    debug!(
                        metric = %previous.hub_unique_id,
                        "Replacing existing metric placeholder"
                    );
                }
            }
            Some(Placeholder::Fallback(placeholder)) => {
                let mut st = lock(&self.state);
                if let Some(previous) = st
                    .fallback_placeholders
                    .insert(placeholder.hub_unique_id.clone(), placeholder)
                {
                    debug!(
                        metric = %previous.hub_unique_id,
                        "Replacing existing fallback placeholder"
                    );
                }
            }
            None => {}
        }
    }

    fn get_or_create_device(&self, parsed: &ParsedTopic) -> Device {
        let short_unique_id = ParsedTopic::make_device_short_unique_id(
            parsed.device_type.code(),
            &parsed.device_id,
        );
        let mut st = lock(&self.state);
        st.devices
            .entry(short_unique_id)
            .or_insert_with(|| {
                info!(topic = %parsed.full_topic, "Creating new device");
                Device::new(parsed)
            })
            .clone()
    }

    /// Barrier handler: commit buffered placeholders, activate formulas,
    /// run the second naming pass and fire new-metric notifications.
    pub(crate) fn handle_full_publish(self: &Arc<Self>, payload: &str) {
        let first_full_publish = lock(&self.state).first_full_publish;

        let echo = get_keepalive_echo(payload);
        match &echo {
            None => {
                if first_full_publish {
                    error!(payload = %payload, "No echo in completion message; probably old Venus OS version");
                } else {
                    debug!(payload = %payload, "No echo in completion message; probably old Venus OS version");
                }
            }
            // Another client's keepalive triggered this republish.
            Some(echo) if !echo.starts_with(&self.client_id) => {
                debug!(echo = %echo, "Not our echo");
                return;
            }
            Some(echo) => debug!(echo = %echo, "Full publish completed"),
        }

        let mut new_metrics: Vec<(Device, Metric)> = Vec::new();
        {
            let mut st = lock(&self.state);

            let placeholders: Vec<MetricPlaceholder> =
                st.placeholders.drain().map(|(_, p)| p).collect();
            let fallbacks: Vec<FallbackPlaceholder> =
                st.fallback_placeholders.drain().map(|(_, p)| p).collect();
            let buffered_keys: HashSet<&str> = placeholders
                .iter()
                .map(|p| p.hub_unique_id.as_str())
                .collect();

            for placeholder in &placeholders {
                // An unmet dependency skips the commit this cycle; the device
                // republishes everything on the next keepalive, so the
                // placeholder comes back and is retried then.
                if !regular_dependency_met(placeholder, &st.all_metrics, &buffered_keys) {
                    continue;
                }
                let metric = placeholder
                    .device
                    .add_placeholder(placeholder, &fallbacks, self);
                st.all_metrics
                    .insert(metric.shared.hub_unique_id.clone(), metric.clone());
                new_metrics.push((placeholder.device.clone(), metric));
            }

            // Formula activation only makes progress when the committed set
            // grew, since dependencies can only appear through commits.
            if !new_metrics.is_empty() {
                let formula_metrics = self.activate_formulas(&mut st);
                new_metrics.extend(formula_metrics);
            }

            // Second naming pass, after every metric of this batch exists,
            // so forward references within the batch resolve.
            for (device, metric) in &new_metrics {
                metric.phase2_init(device.short_unique_id(), &st.all_metrics);
            }
        }

        for (device, metric) in &new_metrics {
            let _ = self.notify_tx.send(Notification::NewMetric {
                device: device.clone(),
                metric: metric.clone(),
            });
        }

        if first_full_publish {
            self.trace_firmware_version();
        }

        let _ = self.first_refresh.send(true);
        lock(&self.state).first_full_publish = false;
    }

    fn activate_formulas(self: &Arc<Self>, st: &mut EngineState) -> Vec<(Device, Metric)> {
        let mut activated = Vec::new();
        for descriptor in self.topic_map.formulas() {
            debug!(topic = %descriptor.topic, "Trying to resolve formula topic");
            let device_type_code = descriptor.topic.split('/').nth(1).unwrap_or_default();
            let relevant_devices: Vec<Device> = st
                .devices
                .values()
                .filter(|d| d.device_type().code() == device_type_code)
                .cloned()
                .collect();

            for device in relevant_devices {
                let metric_name = ParsedTopic::make_hub_unique_id(
                    device.short_unique_id(),
                    &descriptor.short_id,
                );
                if st.all_metrics.contains_key(&metric_name) {
                    continue;
                }
                let Some(dependencies) =
                    formula_dependencies(descriptor, &device, &st.all_metrics)
                else {
                    continue;
                };
                let func_name = descriptor.topic.rsplit('/').next().unwrap_or_default();
                let Some(func) = formula::formula_by_name(func_name) else {
                    warn!(topic = %descriptor.topic, "No formula function registered");
                    continue;
                };

                info!(topic = %descriptor.topic, device = %device.unique_id(), "Formula topic resolved");
                let metric = device.add_formula_metric(descriptor, self);
                for dependency in dependencies.values() {
                    dependency.add_dependent(&metric);
                }
                metric.init_formula(func, dependencies);
                info!(metric = %metric.unique_id(), "Formula metric created");
                st.all_metrics.insert(metric_name, metric.clone());
                activated.push((device.clone(), metric));
            }
        }
        activated
    }

    /// Periodic pass over every committed metric: flush throttled
    /// notifications and clear values that went silent.
    pub(crate) fn sweep_metrics(&self) {
        debug!("Keeping alive all metrics");
        let metrics: Vec<Metric> = lock(&self.state).all_metrics.values().cloned().collect();
        for metric in metrics {
            metric.keepalive_sweep();
        }
    }

    fn try_capture_installation_id(&self, topic: &str, payload: &str) {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() == 5 && parts[2..5] == ["system", "0", "Serial"] {
            let id = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|json| json.get("value").cloned())
                .and_then(|value| match value {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| parts[1].to_string());
            info!(installation_id = %id, topic = %topic, "Installation ID received");
            *lock(&self.installation_id) = Some(id);
            let _ = self.installation_event.send(true);
        }
    }

    /// Warn once when the device firmware predates the echo mechanism.
    fn trace_firmware_version(&self) {
        const VERSION_METRIC: &str = "system_0_platform_venus_firmware_installed_version";
        let metric = lock(&self.state).all_metrics.get(VERSION_METRIC).cloned();
        let Some(value) = metric.and_then(|m| m.value()) else {
            warn!(metric = VERSION_METRIC, "Version metric not found");
            return;
        };
        let text = value.to_string();
        let Some(version) = text.strip_prefix('v') else {
            error!(version = %text, "Firmware version format not supported");
            return;
        };
        // Accept versions like 'v3.70' and 'v3.70~15'
        let version = version.split('~').next().unwrap_or(version);
        match version.parse::<f64>() {
            Ok(parsed) if parsed < 3.5 => {
                warn!(version = %text, "Firmware version is below v3.5")
            }
            Ok(_) => info!(version = %text, "Firmware version is good enough"),
            Err(_) => error!(version = %text, "Firmware version format not float"),
        }
    }

    fn snapshot_active(&self) -> bool {
        lock(&self.snapshot).is_some()
    }

    /// Raw snapshot mode: assemble the whole topic tree instead of resolving
    /// metrics, until the barrier closes the snapshot.
    fn handle_snapshot_message(&self, topic: &str, payload: &str) {
        if topic.contains("full_publish_completed") {
            info!("Full publish completed, snapshot ready");
            let _ = self.first_refresh.send(true);
            return;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            debug!(topic = %topic, "Ignoring non-JSON snapshot payload");
            return;
        };
        let mut guard = lock(&self.snapshot);
        if let Some(tree) = guard.as_mut() {
            set_nested_value(tree, &topic.split('/').collect::<Vec<_>>(), value);
        }
    }
}

/// Whether every dependency of a buffered placeholder is satisfied by a
/// committed metric or another placeholder in the same batch. Dependencies
/// resolve within the owning device.
fn regular_dependency_met(
    placeholder: &MetricPlaceholder,
    all_metrics: &HashMap<String, Metric>,
    buffered_keys: &HashSet<&str>,
) -> bool {
    for dependency in &placeholder.descriptor.depends_on {
        let resolved = replace_ids(dependency, &placeholder.fields.key_values);
        let key = ParsedTopic::make_hub_unique_id(
            placeholder.device.short_unique_id(),
            &resolved,
        );
        if !all_metrics.contains_key(&key) && !buffered_keys.contains(key.as_str()) {
            debug!(
                topic = %placeholder.parsed_topic.full_topic,
                dependency = %key,
                "Topic is missing dependency metric"
            );
            return false;
        }
    }
    true
}

/// Resolve a formula's dependencies on one device, or `None` when any of
/// them has not been committed yet.
fn formula_dependencies(
    descriptor: &Arc<TopicDescriptor>,
    device: &Device,
    all_metrics: &HashMap<String, Metric>,
) -> Option<HashMap<String, Metric>> {
    let mut dependencies = HashMap::new();
    for dependency in &descriptor.depends_on {
        let key = ParsedTopic::make_hub_unique_id(device.short_unique_id(), dependency);
        match all_metrics.get(&key) {
            Some(metric) => {
                dependencies.insert(key, metric.clone());
            }
            None => {
                debug!(
                    topic = %descriptor.topic,
                    dependency = %key,
                    "Formula topic is missing dependency metric"
                );
                return None;
            }
        }
    }
    Some(dependencies)
}

fn set_nested_value(tree: &mut serde_json::Value, path: &[&str], value: serde_json::Value) {
    let Some((last, intermediate)) = path.split_last() else {
        return;
    };
    let mut node = tree;
    for key in intermediate {
        node = match node {
            serde_json::Value::Object(map) => map
                .entry((*key).to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new())),
            _ => return,
        };
    }
    if let Some(map) = node.as_object_mut() {
        map.insert((*last).to_string(), value);
    }
}
