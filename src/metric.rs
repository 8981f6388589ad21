//! Metric runtime objects
//!
//! A [`Metric`] is a cheap-clone handle onto shared state owned by the hub's
//! resolution engine. The engine is the only writer; application code reads
//! values and registers update callbacks, which are always dispatched from
//! the hub's notifier task, never inline from the message path.

use crate::codec::{self, MetricValue};
use crate::engine::Notification;
use crate::enums::DeviceType;
use crate::error::{HubError, Result};
use crate::formula::{FormulaFn, FormulaState};
use crate::hub::HubInner;
use crate::topic_parser::{ParsedTopic, replace_ids};
use crate::topics::{MetricKind, MetricNature, MetricType, TopicDescriptor};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Update-notification callback, invoked with the metric that changed.
pub type OnUpdate = dyn Fn(Metric) + Send + Sync;

// Matches `{key:reference}` monikers, where the reference may still contain
// one level of nested `{placeholder}`.
static MONIKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^:{}]+):((?:[^{}]|\{[^{}]*\})+)\}").unwrap());

/// Lock a mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Silence threshold before a metric's value is considered stale.
///
/// The device republishes its full state on every 30 s keepalive, so more
/// than a minute of silence means the source is gone. Scaled with the
/// configured update frequency, bounded to [65 s, 600 s].
pub(crate) fn silence_threshold(update_frequency: Option<u64>) -> Duration {
    Duration::from_secs((update_frequency.unwrap_or(0) * 4).clamp(65, 600))
}

pub(crate) struct FormulaRuntime {
    pub(crate) func: FormulaFn,
    pub(crate) depends_on: HashMap<String, Metric>,
    pub(crate) state: FormulaState,
}

pub(crate) struct MetricState {
    pub(crate) value: Option<MetricValue>,
    pub(crate) name: String,
    pub(crate) on_update: Option<Arc<OnUpdate>>,
    /// Formula metrics observing this one; cycle-guarded
    pub(crate) dependents: Vec<Metric>,
    pub(crate) formula: Option<FormulaRuntime>,
    pub(crate) last_seen: Instant,
    pub(crate) last_notified: Option<Instant>,
    /// A changed value was suppressed by the throttle window
    pub(crate) notify_pending: bool,
}

pub(crate) struct MetricShared {
    pub(crate) descriptor: Arc<TopicDescriptor>,
    /// `{installation_id}_{device}_{id}_{short_id}`
    pub(crate) full_unique_id: String,
    /// `{device}_{id}_{short_id}`, the engine-wide key
    pub(crate) hub_unique_id: String,
    pub(crate) short_id: String,
    pub(crate) key_values: HashMap<String, String>,
    pub(crate) device_type: DeviceType,
    pub(crate) write_topic: Option<String>,
    pub(crate) update_frequency: Option<u64>,
    pub(crate) notify_tx: mpsc::UnboundedSender<Notification>,
    pub(crate) hub: Weak<HubInner>,
    pub(crate) state: Mutex<MetricState>,
}

/// Construction arguments assembled by the device at commit time.
pub(crate) struct MetricInit {
    pub(crate) descriptor: Arc<TopicDescriptor>,
    pub(crate) full_unique_id: String,
    pub(crate) hub_unique_id: String,
    pub(crate) short_id: String,
    pub(crate) name: String,
    pub(crate) key_values: HashMap<String, String>,
    pub(crate) device_type: DeviceType,
    pub(crate) write_topic: Option<String>,
}

/// Representation of one Venus OS data point.
#[derive(Clone)]
pub struct Metric {
    pub(crate) shared: Arc<MetricShared>,
}

impl Metric {
    pub(crate) fn new(init: MetricInit, hub: &Arc<HubInner>) -> Metric {
        debug!(
            unique_id = %init.full_unique_id,
            metric_type = ?init.descriptor.metric_type,
            nature = ?init.descriptor.metric_nature,
            "Creating new metric"
        );
        Metric {
            shared: Arc::new(MetricShared {
                descriptor: init.descriptor,
                full_unique_id: init.full_unique_id,
                hub_unique_id: init.hub_unique_id,
                short_id: init.short_id,
                key_values: init.key_values,
                device_type: init.device_type,
                write_topic: init.write_topic,
                update_frequency: hub.options.update_frequency_seconds,
                notify_tx: hub.notify_tx.clone(),
                hub: Arc::downgrade(hub),
                state: Mutex::new(MetricState {
                    value: None,
                    name: init.name,
                    on_update: None,
                    dependents: Vec::new(),
                    formula: None,
                    last_seen: Instant::now(),
                    last_notified: None,
                    notify_pending: false,
                }),
            }),
        }
    }

    /// Fully-qualified unique id, including the installation id.
    pub fn unique_id(&self) -> &str {
        &self.shared.full_unique_id
    }

    /// Short id, unique within the owning device (e.g. `grid_energy_forward_L1`).
    pub fn short_id(&self) -> &str {
        &self.shared.short_id
    }

    /// The descriptor's short-id template (e.g. `grid_energy_forward_{phase}`).
    pub fn generic_short_id(&self) -> &str {
        &self.shared.descriptor.short_id
    }

    /// Human-readable name, resolved from the descriptor's template.
    pub fn name(&self) -> String {
        lock(&self.shared.state).name.clone()
    }

    /// Current typed value, `None` until first decode or after a silence reset.
    pub fn value(&self) -> Option<MetricValue> {
        lock(&self.shared.state).value.clone()
    }

    /// Value with unit, e.g. `"42 kWh"`; empty when there is no value.
    pub fn formatted_value(&self) -> String {
        match self.value() {
            None => String::new(),
            Some(value) => match self.shared.descriptor.unit_of_measurement {
                None => value.to_string(),
                Some(unit) => format!("{value} {unit}"),
            },
        }
    }

    pub fn unit_of_measurement(&self) -> Option<&'static str> {
        self.shared.descriptor.unit_of_measurement
    }

    pub fn metric_type(&self) -> MetricType {
        self.shared.descriptor.metric_type
    }

    pub fn metric_nature(&self) -> MetricNature {
        self.shared.descriptor.metric_nature
    }

    pub fn metric_kind(&self) -> MetricKind {
        self.shared.descriptor.message_kind
    }

    pub fn precision(&self) -> Option<u32> {
        self.shared.descriptor.precision
    }

    pub fn min_value(&self) -> Option<f64> {
        self.shared.descriptor.min
    }

    pub fn max_value(&self) -> Option<f64> {
        self.shared.descriptor.max
    }

    /// Increment for writable numeric kinds.
    pub fn step(&self) -> Option<f64> {
        self.shared.descriptor.step
    }

    /// Display labels of the associated enum, for select-kind metrics.
    pub fn enum_values(&self) -> Option<Vec<&'static str>> {
        self.shared.descriptor.enum_def.map(|def| def.labels())
    }

    /// Captured placeholder values (which phase, which output, ...).
    pub fn key_values(&self) -> HashMap<String, String> {
        self.shared.key_values.clone()
    }

    pub fn device_type(&self) -> DeviceType {
        self.shared.device_type
    }

    /// Register the update-notification callback for this metric.
    pub fn set_on_update<F>(&self, callback: F)
    where
        F: Fn(Metric) + Send + Sync + 'static,
    {
        lock(&self.shared.state).on_update = Some(Arc::new(callback));
    }

    /// Remove the update-notification callback.
    pub fn clear_on_update(&self) {
        lock(&self.shared.state).on_update = None;
    }

    pub fn is_writable(&self) -> bool {
        self.shared.descriptor.message_kind.is_writable() && self.shared.write_topic.is_some()
    }

    /// Writable view of this metric, when its kind supports write-back.
    pub fn as_writable(&self) -> Option<WritableMetric> {
        self.is_writable().then(|| WritableMetric {
            metric: self.clone(),
        })
    }

    pub(crate) fn on_update_callback(&self) -> Option<Arc<OnUpdate>> {
        lock(&self.shared.state).on_update.clone()
    }

    /// Apply a decoded value coming from the engine or a formula result.
    pub(crate) fn handle_value(&self, value: MetricValue) {
        let mut notify = false;
        {
            let mut st = lock(&self.shared.state);
            st.last_seen = Instant::now();
            let changed = st.value.as_ref() != Some(&value);
            if changed {
                debug!(
                    metric = %self.shared.hub_unique_id,
                    old = ?st.value,
                    new = %value,
                    "Metric value changed"
                );
            } else {
                debug!(metric = %self.shared.hub_unique_id, value = %value, "Metric value unchanged");
            }
            st.value = Some(value);

            match self.shared.update_frequency {
                None => notify = changed,
                Some(0) => notify = true,
                Some(secs) => {
                    let window_elapsed = st
                        .last_notified
                        .is_none_or(|t| t.elapsed().as_secs() >= secs);
                    if window_elapsed {
                        notify = true;
                    } else if changed {
                        st.notify_pending = true;
                    }
                }
            }
            if notify {
                st.last_notified = Some(Instant::now());
                st.notify_pending = false;
            }
        }
        if notify {
            self.send_updated();
        }
        self.cascade();
    }

    /// Recompute a formula metric from its dependencies.
    ///
    /// A formula returning no value leaves the current value and the
    /// notification state untouched.
    pub(crate) fn recompute_formula(&self) {
        let computed = {
            let mut st = lock(&self.shared.state);
            let Some(runtime) = st.formula.as_mut() else {
                return;
            };
            (runtime.func)(&runtime.depends_on, &mut runtime.state, Instant::now())
        };
        match computed {
            None => debug!(metric = %self.shared.hub_unique_id, "Formula produced no value"),
            Some(value) => {
                let rounded = codec::round_to(value, self.shared.descriptor.precision);
                self.handle_value(MetricValue::Float(rounded));
            }
        }
    }

    /// Attach the formula runtime and seed the initial value.
    pub(crate) fn init_formula(&self, func: FormulaFn, depends_on: HashMap<String, Metric>) {
        lock(&self.shared.state).formula = Some(FormulaRuntime {
            func,
            depends_on,
            state: FormulaState::default(),
        });
        self.recompute_formula();
    }

    /// Register a formula metric as an observer of this one.
    ///
    /// Returns false (and registers nothing) when doing so would create a
    /// dependency cycle.
    pub(crate) fn add_dependent(&self, dependent: &Metric) -> bool {
        if reaches(dependent, self) {
            error!(
                metric = %self.shared.hub_unique_id,
                dependent = %dependent.shared.hub_unique_id,
                "Refusing dependent registration: dependency cycle"
            );
            return false;
        }
        lock(&self.shared.state).dependents.push(dependent.clone());
        true
    }

    /// Periodic silence/throttle pass; formula metrics recompute reactively
    /// and are exempt.
    pub(crate) fn keepalive_sweep(&self) {
        let mut notify = false;
        {
            let mut st = lock(&self.shared.state);
            if st.formula.is_some() {
                return;
            }

            if st.notify_pending {
                let due = match self.shared.update_frequency {
                    Some(secs) if secs > 0 => st
                        .last_notified
                        .is_none_or(|t| t.elapsed().as_secs() >= secs),
                    _ => true,
                };
                if due {
                    notify = true;
                    st.notify_pending = false;
                    st.last_notified = Some(Instant::now());
                }
            }

            if st.value.is_some()
                && st.last_seen.elapsed() > silence_threshold(self.shared.update_frequency)
            {
                debug!(
                    metric = %self.shared.hub_unique_id,
                    "No update within silence threshold, clearing value"
                );
                st.value = None;
                st.notify_pending = false;
                st.last_notified = Some(Instant::now());
                notify = true;
            }
        }
        if notify {
            self.send_updated();
        }
    }

    /// Second-phase naming: resolve `{key:other_short_id}` monikers against
    /// the now-complete metric batch, falling back to the simple key value
    /// when the referenced metric is absent or empty.
    pub(crate) fn phase2_init(
        &self,
        device_short_unique_id: &str,
        all_metrics: &HashMap<String, Metric>,
    ) {
        let name = lock(&self.shared.state).name.clone();
        if !name.contains(':') {
            return;
        }
        let key_values = &self.shared.key_values;
        let resolved = MONIKER_RE.replace_all(&name, |caps: &Captures<'_>| {
            let key = &caps[1];
            let reference = replace_ids(&caps[2], key_values);
            let target = ParsedTopic::make_hub_unique_id(device_short_unique_id, &reference);
            if let Some(metric) = all_metrics.get(&target)
                && let Some(value) = metric.value()
            {
                return value.to_string();
            }
            key_values
                .get(key)
                .cloned()
                .unwrap_or_else(|| format!("{{{key}}}"))
        });
        lock(&self.shared.state).name = resolved.into_owned();
    }

    fn send_updated(&self) {
        let _ = self.shared.notify_tx.send(Notification::Updated {
            metric: self.clone(),
        });
    }

    fn cascade(&self) {
        let dependents = lock(&self.shared.state).dependents.clone();
        for dependent in dependents {
            dependent.recompute_formula();
        }
    }
}

/// Whether `target` is reachable from `from` along dependent edges.
fn reaches(from: &Metric, target: &Metric) -> bool {
    if Arc::ptr_eq(&from.shared, &target.shared) {
        return true;
    }
    let dependents = lock(&from.shared.state).dependents.clone();
    dependents.iter().any(|d| reaches(d, target))
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("unique_id", &self.shared.full_unique_id)
            .field("short_id", &self.shared.short_id)
            .field("value", &self.value())
            .field("kind", &self.shared.descriptor.message_kind)
            .finish()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted_value())
    }
}

/// A metric that supports write-back to the device.
///
/// Obtained via [`Metric::as_writable`]; derefs to [`Metric`] for the read
/// surface. The write topic is the read topic with its leading `N` replaced
/// by `W`.
#[derive(Clone)]
pub struct WritableMetric {
    metric: Metric,
}

impl std::ops::Deref for WritableMetric {
    type Target = Metric;

    fn deref(&self) -> &Metric {
        &self.metric
    }
}

impl WritableMetric {
    /// The `W/`-namespace topic writes are published to.
    pub fn write_topic(&self) -> &str {
        self.metric.shared.write_topic.as_deref().unwrap_or_default()
    }

    /// Encode and publish a value to the device.
    pub fn set(&self, value: MetricValue) -> Result<()> {
        let shared = &self.metric.shared;
        let topic = shared
            .write_topic
            .as_ref()
            .ok_or_else(|| HubError::programming("writable metric without write topic"))?;
        let payload = codec::encode(&value, &shared.descriptor)?;
        let hub = shared
            .hub
            .upgrade()
            .ok_or_else(|| HubError::not_connected("hub no longer exists"))?;
        debug!(topic = %topic, payload = %payload, "Writing metric value");
        hub.publish_raw(topic, &payload)
    }
}

impl fmt::Debug for WritableMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableMetric")
            .field("unique_id", &self.metric.shared.full_unique_id)
            .field("write_topic", &self.metric.shared.write_topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_threshold_bounds() {
        assert_eq!(silence_threshold(None), Duration::from_secs(65));
        assert_eq!(silence_threshold(Some(0)), Duration::from_secs(65));
        assert_eq!(silence_threshold(Some(30)), Duration::from_secs(120));
        assert_eq!(silence_threshold(Some(1000)), Duration::from_secs(600));
    }
}
