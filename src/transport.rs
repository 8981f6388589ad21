//! MQTT transport plumbing
//!
//! Wraps rumqttc: client construction from hub options and the event pump
//! task that feeds incoming publishes into the resolution engine. The pump
//! never lets a handler error tear down the connection; rumqttc reconnects
//! on the next poll after a transport error.

use crate::config::HubOptions;
use crate::hub::{CONNECT_MAX_FAILED_ATTEMPTS, HubInner};
use crate::metric::lock;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Transport};
use std::sync::Weak;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection lifecycle, published through the hub's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    Connecting,
    Connected,
    /// Gave up before ever connecting; `connect()` surfaces CannotConnect
    Failed,
}

/// Build the MQTT client and its event loop from hub options.
pub(crate) fn build_client(options: &HubOptions, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut mqtt_options = MqttOptions::new(client_id, &options.host, options.port);
    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_clean_session(true);

    // Venus OS brokers only let you configure a password; the username is
    // free-form but must be present for authentication to engage.
    if let Some(password) = &options.password {
        let username = options
            .username
            .clone()
            .unwrap_or_else(|| "hesperus".to_string());
        info!(username = %username, "Setting auth credentials");
        mqtt_options.set_credentials(username, password.clone());
    }

    if options.use_ssl {
        info!("Enabling TLS transport");
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    AsyncClient::new(mqtt_options, 64)
}

/// Drive the rumqttc event loop until the hub goes away.
///
/// Incoming publishes are handed to the engine synchronously on this task;
/// connection errors are counted so that a never-successful connect can be
/// reported, then retried with a short backoff.
pub(crate) async fn run_event_pump(hub: Weak<HubInner>, mut event_loop: EventLoop) {
    loop {
        let event = event_loop.poll().await;
        let Some(inner) = hub.upgrade() else { break };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker successfully");
                inner.ever_connected.store(true, Ordering::SeqCst);
                // Re-establish subscriptions after a reconnect; the first
                // connect has none resolved yet and sets them up itself.
                let topics = lock(&inner.resolved_subscriptions).clone();
                let client = lock(&inner.client).clone();
                if let Some(client) = client {
                    for topic in topics {
                        let prefixed = inner.add_topic_prefix(&topic);
                        if let Err(e) = client
                            .subscribe(prefixed.as_str(), rumqttc::QoS::AtMostOnce)
                            .await
                        {
                            warn!(topic = %prefixed, error = %e, "Failed to resubscribe");
                        }
                    }
                }
                let _ = inner.conn_phase.send(ConnPhase::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                inner.handle_raw_message(&publish.topic, &payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Unexpected disconnection from MQTT broker, reconnecting");
            }
            Ok(other) => debug!(event = ?other, "MQTT event"),
            Err(e) => {
                let failures = inner.connect_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if !inner.ever_connected.load(Ordering::SeqCst)
                    && failures >= CONNECT_MAX_FAILED_ATTEMPTS
                {
                    warn!(error = %e, "Connection to MQTT broker failed");
                    let _ = inner.conn_phase.send(ConnPhase::Failed);
                    break;
                }
                warn!(error = %e, "MQTT connection error, retrying");
                drop(inner);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!("Event pump stopped");
}
