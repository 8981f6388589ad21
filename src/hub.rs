//! Hub: the composition root
//!
//! Owns the MQTT transport lifecycle, the keepalive loop and the notifier
//! task, and wires transport events into the metric resolution engine. A
//! [`Hub`] is a cheap-clone handle; all background tasks hold only weak
//! references, so dropping the last handle tears the instance down.

use crate::codec::{self, MetricValue};
use crate::config::HubOptions;
use crate::device::Device;
use crate::engine::{EngineState, Notification};
use crate::error::{HubError, Result};
use crate::metric::{Metric, lock};
use crate::topic_map::TopicMap;
use crate::topics::topic_table;
use crate::transport::{self, ConnPhase};
use rumqttc::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Installation-id discovery topic; its payload's `value` field carries the
/// installation identifier.
pub const TOPIC_INSTALLATION_ID: &str = "N/+/system/0/Serial";

pub(crate) const CONNECT_MAX_FAILED_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(25);
const INSTALLATION_ID_TIMEOUT: Duration = Duration::from_secs(60);
const FIRST_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// New-metric notification callback: `(hub, device, metric)`.
pub type OnNewMetric = dyn Fn(Hub, Device, Metric) + Send + Sync;

pub(crate) struct HubInner {
    pub(crate) options: HubOptions,
    pub(crate) client_id: String,
    pub(crate) topic_map: TopicMap,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) installation_id: Mutex<Option<String>>,
    pub(crate) client: Mutex<Option<AsyncClient>>,
    pub(crate) notify_tx: mpsc::UnboundedSender<Notification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    on_new_metric: Mutex<Option<Arc<OnNewMetric>>>,
    keepalive_counter: AtomicU64,
    pub(crate) conn_phase: watch::Sender<ConnPhase>,
    pub(crate) first_refresh: watch::Sender<bool>,
    pub(crate) installation_event: watch::Sender<bool>,
    pub(crate) connect_failures: AtomicU32,
    pub(crate) ever_connected: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) snapshot: Mutex<Option<serde_json::Value>>,
    /// Subscription topics with the installation id substituted in
    pub(crate) resolved_subscriptions: Mutex<Vec<String>>,
}

impl HubInner {
    pub(crate) fn installation_id(&self) -> Option<String> {
        lock(&self.installation_id).clone()
    }

    pub(crate) fn add_topic_prefix(&self, topic: &str) -> String {
        match &self.options.topic_prefix {
            None => topic.to_string(),
            Some(prefix) => format!("{prefix}/{topic}"),
        }
    }

    pub(crate) fn strip_topic_prefix<'a>(&self, topic: &'a str) -> &'a str {
        match &self.options.topic_prefix {
            None => topic,
            Some(prefix) => topic
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(topic),
        }
    }

    /// Non-blocking publish with prefix handling; used from the engine path
    /// and from writable metrics.
    pub(crate) fn publish_raw(&self, topic: &str, payload: &str) -> Result<()> {
        let client = lock(&self.client)
            .clone()
            .ok_or_else(|| HubError::not_connected("no MQTT client"))?;
        let prefixed = self.add_topic_prefix(topic);
        debug!(topic = %prefixed, payload = %payload, "Publishing message");
        client
            .try_publish(prefixed, rumqttc::QoS::AtMostOnce, false, payload)
            .map_err(Into::into)
    }

    pub(crate) async fn subscribe(&self, topic: &str) -> Result<()> {
        let client = lock(&self.client)
            .clone()
            .ok_or_else(|| HubError::not_connected("no MQTT client"))?;
        let prefixed = self.add_topic_prefix(topic);
        debug!(topic = %prefixed, "Subscribing");
        client
            .subscribe(prefixed, rumqttc::QoS::AtMostOnce)
            .await
            .map_err(Into::into)
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let client = lock(&self.client)
            .clone()
            .ok_or_else(|| HubError::not_connected("no MQTT client"))?;
        let prefixed = self.add_topic_prefix(topic);
        client.unsubscribe(prefixed.as_str()).await?;
        debug!(topic = %prefixed, "Unsubscribed");
        Ok(())
    }

    /// Send one keepalive request carrying this instance's echo token.
    pub(crate) fn send_keepalive(&self) -> Result<()> {
        let Some(installation_id) = self.installation_id() else {
            return Err(HubError::programming("keepalive without installation id"));
        };
        let topic = format!("R/{installation_id}/keepalive");
        let counter = self.keepalive_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let echo = format!("{}-{}", self.client_id, counter);
        debug!(topic = %topic, echo = %echo, "Sending keepalive message");
        self.publish_raw(&topic, &generate_keepalive_options(&echo))
    }

    pub(crate) fn on_new_metric_callback(&self) -> Option<Arc<OnNewMetric>> {
        lock(&self.on_new_metric).clone()
    }
}

/// Client for the MQTT broker of one Venus OS installation.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
}

impl Hub {
    /// Build a hub from options. No network activity happens here; call
    /// [`Hub::connect`] to establish the MQTT connection.
    pub fn new(options: HubOptions) -> Result<Hub> {
        options.validate()?;
        info!(
            host = %options.host,
            port = options.port,
            use_ssl = options.use_ssl,
            installation_id = ?options.installation_id,
            operation_mode = ?options.operation_mode,
            update_frequency = ?options.update_frequency_seconds,
            "Initializing hub"
        );

        let topic_map = TopicMap::build(
            topic_table(),
            options.operation_mode,
            &options.device_type_exclude_filter,
        );

        // Client ids must be unique per broker; two clients sharing one id
        // silently evict each other's connection.
        let uuid = Uuid::new_v4().simple().to_string();
        let mut client_id = format!("hesperus-{}", &uuid[..8]);
        if let Some(suffix) = &options.client_suffix {
            client_id.push('-');
            client_id.push_str(suffix);
        }

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (conn_phase, _) = watch::channel(ConnPhase::Connecting);
        let (first_refresh, _) = watch::channel(false);
        let (installation_event, _) = watch::channel(false);
        let installation_id = options.installation_id.clone();

        info!(client_id = %client_id, "Hub initialized");
        Ok(Hub {
            inner: Arc::new(HubInner {
                options,
                client_id,
                topic_map,
                state: Mutex::new(EngineState::new()),
                installation_id: Mutex::new(installation_id),
                client: Mutex::new(None),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
                on_new_metric: Mutex::new(None),
                keepalive_counter: AtomicU64::new(0),
                conn_phase,
                first_refresh,
                installation_event,
                connect_failures: AtomicU32::new(0),
                ever_connected: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                snapshot: Mutex::new(None),
                resolved_subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Connect to the broker, discover the installation id when it was not
    /// supplied, set up subscriptions and start the keepalive loop.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        info!(
            host = %inner.options.host,
            port = inner.options.port,
            "Connecting to MQTT broker"
        );

        let (client, event_loop) = transport::build_client(&inner.options, &inner.client_id);
        *lock(&inner.client) = Some(client);
        inner.connect_failures.store(0, Ordering::SeqCst);
        let _ = inner.conn_phase.send(ConnPhase::Connecting);

        self.spawn_notifier();
        self.spawn_pump(event_loop);

        let mut phase_rx = inner.conn_phase.subscribe();
        let phase = tokio::time::timeout(
            CONNECT_TIMEOUT,
            phase_rx.wait_for(|phase| *phase != ConnPhase::Connecting),
        )
        .await
        .map_err(|_| HubError::cannot_connect("Timeout waiting for first connection"))?
        .map_err(|_| HubError::cannot_connect("Connection state channel closed"))?;
        if *phase == ConnPhase::Failed {
            return Err(HubError::cannot_connect(format!(
                "Failed to connect to MQTT broker: {}:{}",
                inner.options.host, inner.options.port
            )));
        }
        drop(phase);
        info!("Successfully connected to MQTT broker");

        let installation_id = match inner.installation_id() {
            Some(id) => id,
            None => {
                info!("No installation ID provided, attempting to read from device");
                self.read_installation_id().await?
            }
        };

        let resolved: Vec<String> = inner
            .topic_map
            .subscriptions()
            .iter()
            .map(|topic| topic.replace("{installation_id}", &installation_id))
            .chain([format!("N/{installation_id}/full_publish_completed")])
            .collect();
        *lock(&inner.resolved_subscriptions) = resolved.clone();
        for topic in &resolved {
            inner.subscribe(topic).await?;
        }
        info!("Subscriptions established, including full_publish_completed notification");

        self.spawn_keepalive();
        info!(installation_id = %installation_id, "Connected");
        Ok(())
    }

    /// Disconnect from the broker and stop all background tasks. Idempotent.
    pub async fn disconnect(&self) {
        info!("Disconnecting from MQTT broker");
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let client = lock(&self.inner.client).take();
        match client {
            None => debug!("No client to disconnect"),
            Some(client) => {
                let _ = client.disconnect().await;
                info!("Disconnected from MQTT broker");
            }
        }
    }

    /// Whether the MQTT connection is currently established.
    pub fn connected(&self) -> bool {
        lock(&self.inner.client).is_some()
            && *self.inner.conn_phase.borrow() == ConnPhase::Connected
    }

    /// The installation id, once supplied or discovered.
    pub fn installation_id(&self) -> Option<String> {
        self.inner.installation_id()
    }

    /// The generated MQTT client id for this instance.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn model_name(&self) -> Option<&str> {
        self.inner.options.model_name.as_deref()
    }

    pub fn serial(&self) -> Option<&str> {
        self.inner.options.serial.as_deref()
    }

    pub fn topic_prefix(&self) -> Option<&str> {
        self.inner.options.topic_prefix.as_deref()
    }

    /// Devices seen so far; a device is exposed only once it owns at least
    /// one committed metric.
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.inner.state)
            .devices
            .values()
            .filter(|device| device.has_metrics())
            .cloned()
            .collect()
    }

    /// Look up a device by its short unique id (`{device_type}_{device_id}`).
    pub fn device(&self, short_unique_id: &str) -> Option<Device> {
        lock(&self.inner.state)
            .devices
            .get(short_unique_id)
            .filter(|device| device.has_metrics())
            .cloned()
    }

    /// Look up a metric by its fully-qualified unique id.
    pub fn metric(&self, unique_id: &str) -> Option<Metric> {
        // The hub-wide map is keyed without the installation id prefix.
        let without_installation = unique_id.split_once('_').map(|(_, rest)| rest)?;
        lock(&self.inner.state)
            .all_metrics
            .get(without_installation)
            .cloned()
    }

    /// Register the new-metric notification callback.
    pub fn set_on_new_metric<F>(&self, callback: F)
    where
        F: Fn(Hub, Device, Metric) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_new_metric) = Some(Arc::new(callback));
    }

    /// Remove the new-metric notification callback.
    pub fn clear_on_new_metric(&self) {
        *lock(&self.inner.on_new_metric) = None;
    }

    /// Publish a value to a service-kind topic addressed by short id.
    ///
    /// Returns [`HubError::TopicNotFound`] when the short id is not in the
    /// active topic table (e.g. filtered out by operation mode).
    pub fn publish(
        &self,
        topic_short_id: &str,
        device_id: &str,
        value: Option<&MetricValue>,
    ) -> Result<()> {
        info!(
            short_id = %topic_short_id,
            device_id = %device_id,
            "Publishing service message"
        );
        let Some(descriptor) = self.inner.topic_map.service(topic_short_id) else {
            error!(short_id = %topic_short_id, "No active topic found");
            return Err(HubError::topic_not_found(format!(
                "No active topic found for short id: {topic_short_id}"
            )));
        };
        let installation_id = self.inner.installation_id().ok_or_else(|| {
            HubError::programming("Installation ID must be set before publishing")
        })?;
        let topic = descriptor
            .topic
            .replace("{installation_id}", &installation_id)
            .replace("{device_id}", device_id);
        let payload = match value {
            Some(value) => codec::encode(value, &descriptor)?,
            None => String::new(),
        };
        self.inner.publish_raw(&topic, &payload)
    }

    /// Wait until the device has republished its full state at least once.
    pub async fn wait_for_first_refresh(&self) -> Result<()> {
        info!("Waiting for first refresh");
        let mut rx = self.inner.first_refresh.subscribe();
        tokio::time::timeout(FIRST_REFRESH_TIMEOUT, rx.wait_for(|done| *done))
            .await
            .map_err(|_| HubError::cannot_connect("Timeout waiting for first full refresh"))?
            .map_err(|_| HubError::cannot_connect("Refresh channel closed"))?;
        info!(
            devices = lock(&self.inner.state).devices.len(),
            "Devices and metrics initialized"
        );
        Ok(())
    }

    /// Collect the complete raw topic tree of the device as nested JSON.
    ///
    /// Subscribes to everything until the next full-publish barrier; not
    /// meant to be combined with regular metric resolution on the same hub.
    pub async fn create_full_raw_snapshot(&self) -> Result<serde_json::Value> {
        info!("Creating full raw snapshot of device state");
        if self.inner.installation_id().is_none() {
            self.read_installation_id().await?;
        }
        *lock(&self.inner.snapshot) = Some(serde_json::Value::Object(serde_json::Map::new()));
        let _ = self.inner.first_refresh.send(false);
        self.inner.subscribe("#").await?;
        info!("Subscribed to all topics for snapshot");
        self.inner.send_keepalive()?;
        self.wait_for_first_refresh().await?;
        let _ = self.inner.unsubscribe("#").await;
        let snapshot = lock(&self.inner.snapshot)
            .take()
            .unwrap_or(serde_json::Value::Null);
        info!("Snapshot complete");
        Ok(snapshot)
    }

    async fn read_installation_id(&self) -> Result<String> {
        info!("Reading installation ID");
        if lock(&self.inner.client).is_none() {
            return Err(HubError::programming(
                "Cannot read installation ID - no MQTT client",
            ));
        }
        self.inner.subscribe(TOPIC_INSTALLATION_ID).await?;
        let mut rx = self.inner.installation_event.subscribe();
        tokio::time::timeout(INSTALLATION_ID_TIMEOUT, rx.wait_for(|set| *set))
            .await
            .map_err(|_| HubError::cannot_connect("Timeout waiting for installation ID"))?
            .map_err(|_| HubError::cannot_connect("Installation ID channel closed"))?;
        let _ = self.inner.unsubscribe(TOPIC_INSTALLATION_ID).await;
        let id = self
            .inner
            .installation_id()
            .ok_or_else(|| HubError::programming("installation id event without value"))?;
        info!(installation_id = %id, "Installation ID read successfully");
        Ok(id)
    }

    /// Start the notifier task delivering callbacks outside the engine path.
    pub(crate) fn spawn_notifier(&self) {
        let Some(mut rx) = lock(&self.inner.notify_rx).take() else {
            return; // already running
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match notification {
                    Notification::NewMetric { device, metric } => {
                        let Some(inner) = weak.upgrade() else { break };
                        if let Some(callback) = inner.on_new_metric_callback() {
                            let hub = Hub {
                                inner: Arc::clone(&inner),
                            };
                            dispatch("on_new_metric", move || callback(hub, device, metric));
                        }
                    }
                    Notification::Updated { metric } => {
                        if let Some(callback) = metric.on_update_callback() {
                            let metric = metric.clone();
                            dispatch("on_update", move || callback(metric));
                        }
                    }
                }
            }
        });
        lock(&self.inner.tasks).push(handle);
    }

    fn spawn_pump(&self, event_loop: EventLoop) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(transport::run_event_pump(weak, event_loop));
        lock(&self.inner.tasks).push(handle);
    }

    fn spawn_keepalive(&self) {
        info!("Creating keepalive task");
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            info!("Starting keepalive loop");
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.send_keepalive() {
                    warn!(error = %e, "Cannot send keepalive");
                }
                ticks += 1;
                // The silence sweep runs on every second tick
                if ticks % 2 == 0 {
                    inner.sweep_metrics();
                }
            }
        });
        lock(&self.inner.tasks).push(handle);
    }
}

/// Invoke an application callback, containing any panic so it can never
/// propagate into the engine or the transport dispatch path.
fn dispatch<F: FnOnce()>(which: &'static str, callback: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
        error!(callback = which, "Error in notification callback");
    }
}

/// Keepalive payload carrying the full-publish echo token.
pub fn generate_keepalive_options(echo_value: &str) -> String {
    serde_json::json!({
        "keepalive-options": [
            { "full-publish-completed-echo": echo_value }
        ]
    })
    .to_string()
}

/// Extract the echoed keepalive token from a completion message, if present.
pub fn get_keepalive_echo(payload: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(payload).ok()?;
    json.get("full-publish-completed-echo")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubOptions;

    #[test]
    fn test_keepalive_options_shape() {
        let payload = generate_keepalive_options("client-7");
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            json["keepalive-options"][0]["full-publish-completed-echo"],
            "client-7"
        );
    }

    #[test]
    fn test_echo_extraction() {
        assert_eq!(
            get_keepalive_echo(r#"{"full-publish-completed-echo": "abc-3"}"#),
            Some("abc-3".to_string())
        );
        assert_eq!(get_keepalive_echo(r#"{"other": 1}"#), None);
        assert_eq!(get_keepalive_echo("1"), None);
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = Hub::new(HubOptions::for_host("localhost")).unwrap();
        let b = Hub::new(HubOptions::for_host("localhost")).unwrap();
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with("hesperus-"));
    }

    #[test]
    fn test_client_id_suffix() {
        let mut options = HubOptions::for_host("localhost");
        options.client_suffix = Some("ha".to_string());
        let hub = Hub::new(options).unwrap();
        assert!(hub.client_id().ends_with("-ha"));
    }

    #[test]
    fn test_topic_prefix_handling() {
        let mut options = HubOptions::for_host("localhost");
        options.topic_prefix = Some("bridge".to_string());
        let hub = Hub::new(options).unwrap();
        assert_eq!(hub.inner.add_topic_prefix("N/123/heartbeat"), "bridge/N/123/heartbeat");
        assert_eq!(
            hub.inner.strip_topic_prefix("bridge/N/123/heartbeat"),
            "N/123/heartbeat"
        );
        assert_eq!(
            hub.inner.strip_topic_prefix("N/123/heartbeat"),
            "N/123/heartbeat"
        );
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = HubOptions::for_host("");
        assert!(Hub::new(options).is_err());
    }
}
