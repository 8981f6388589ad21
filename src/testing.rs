//! Testing utilities
//!
//! Helpers for exercising a hub without a broker: build a hub with a fixed
//! installation id, inject raw MQTT messages straight into the resolution
//! engine, and synthesize the full-publish barrier. Downstream projects can
//! use these to test their own integration code.
//!
//! ```no_run
//! use hesperus::testing::{finalize_injection, inject_message, mocked_hub};
//!
//! # async fn example() -> hesperus::Result<()> {
//! let hub = mocked_hub(None)?;
//! inject_message(&hub, "N/123/battery/0/Soc", r#"{"value": 85}"#);
//! finalize_injection(&hub).await;
//! assert_eq!(hub.devices().len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::config::HubOptions;
use crate::error::Result;
use crate::hub::Hub;
use std::time::Duration;

/// Default installation id used by [`mocked_hub`].
pub const MOCK_INSTALLATION_ID: &str = "123";

/// Build a hub wired for injection: no network client, notifier running,
/// installation id preset (to [`MOCK_INSTALLATION_ID`] unless the options
/// carry one).
pub fn mocked_hub(options: Option<HubOptions>) -> Result<Hub> {
    let mut options = options.unwrap_or_else(|| HubOptions::for_host("localhost"));
    if options.installation_id.is_none() {
        options.installation_id = Some(MOCK_INSTALLATION_ID.to_string());
    }
    let hub = Hub::new(options)?;
    hub.spawn_notifier();
    Ok(hub)
}

/// Feed one raw (topic, payload) pair into the hub's resolution engine, as
/// if it had arrived from the broker.
pub fn inject_message(hub: &Hub, topic: &str, payload: &str) {
    hub.inner.handle_raw_message(topic, payload);
}

/// Synthesize the full-publish barrier with this hub's own echo token, then
/// yield briefly so queued notifications get delivered.
pub async fn finalize_injection(hub: &Hub) {
    let installation_id = hub
        .installation_id()
        .unwrap_or_else(|| MOCK_INSTALLATION_ID.to_string());
    let payload = serde_json::json!({
        "full-publish-completed-echo": format!("{}-1", hub.client_id()),
    })
    .to_string();
    inject_message(
        hub,
        &format!("N/{installation_id}/full_publish_completed"),
        &payload,
    );
    sleep_short().await;
}

/// Give background tasks a moment to drain their queues.
pub async fn sleep_short() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Disconnect a hub created by [`mocked_hub`].
pub async fn hub_disconnect(hub: &Hub) {
    hub.disconnect().await;
}
