use hesperus::testing::{finalize_injection, inject_message, mocked_hub, sleep_short};
use hesperus::{DeviceType, HubError, HubOptions, MetricValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn phase_message_resolves_to_metric() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    finalize_injection(&hub).await;

    let devices = hub.devices();
    assert_eq!(devices.len(), 1, "expected exactly one device");
    let device = &devices[0];
    assert_eq!(device.unique_id(), "123_grid_30");
    assert_eq!(device.device_type(), DeviceType::Grid);

    let metric = device
        .metric("123_grid_30_grid_energy_forward_L1")
        .expect("metric should exist on the device");
    assert_eq!(metric.value(), Some(MetricValue::Float(42.0)));
    assert_eq!(metric.short_id(), "grid_energy_forward_L1");
    assert_eq!(metric.generic_short_id(), "grid_energy_forward_{phase}");
    assert_eq!(metric.unique_id(), "123_grid_30_grid_energy_forward_L1");
    assert_eq!(metric.name(), "Grid consumption on L1");
    assert_eq!(metric.unit_of_measurement(), Some("kWh"));
    assert_eq!(metric.device_type(), DeviceType::Grid);
    assert_eq!(metric.formatted_value(), "42 kWh");

    // The hub-wide lookup accepts the fully-qualified id
    assert!(hub.metric("123_grid_30_grid_energy_forward_L1").is_some());
}

#[tokio::test]
async fn no_metric_before_barrier() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);

    // Unseen -> Placeholder only; nothing is exposed until the barrier.
    assert!(hub.devices().is_empty());
    assert!(hub.metric("123_grid_30_grid_energy_forward_L1").is_none());
}

#[tokio::test]
async fn relay_state_decodes_to_enum() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/system/170/Relay/0/State", r#"{"value": 1}"#);
    finalize_injection(&hub).await;

    let metric = hub.metric("123_system_170_system_relay_0").unwrap();
    match metric.value() {
        Some(MetricValue::Enum(member)) => assert_eq!(member.label, "On"),
        other => panic!("expected enum value, got {other:?}"),
    }
    assert_eq!(metric.name(), "Relay 0 state");
}

#[tokio::test]
async fn unknown_topics_are_dropped() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/grid/30/Totally/Unknown", r#"{"value": 1}"#);
    inject_message(&hub, "garbage", r#"{"value": 1}"#);
    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", "not json");
    finalize_injection(&hub).await;

    assert!(hub.devices().is_empty());
}

#[tokio::test]
async fn dynamic_min_max_overrides_bounds() {
    let hub = mocked_hub(None).unwrap();

    inject_message(
        &hub,
        "N/123/settings/0/Settings/CGwacs/AcPowerSetPoint",
        r#"{"max": 1000000, "min": -1000000, "value": 50}"#,
    );
    finalize_injection(&hub).await;

    let metric = hub.metric("123_system_0_cgwacs_ac_power_set_point").unwrap();
    assert_eq!(metric.value(), Some(MetricValue::Float(50.0)));
    assert_eq!(metric.min_value(), Some(-1_000_000.0));
    assert_eq!(metric.max_value(), Some(1_000_000.0));
    assert!(metric.as_writable().is_some(), "setpoint should be writable");
}

#[tokio::test]
async fn adjustable_flag_on_keeps_metric_writable() {
    for reverse_order in [false, true] {
        let hub = mocked_hub(None).unwrap();
        let messages = [
            ("N/123/vebus/170/Ac/ActiveIn/CurrentLimit", r#"{"value": 100}"#),
            (
                "N/123/vebus/170/Ac/ActiveIn/CurrentLimitIsAdjustable",
                r#"{"value": 1}"#,
            ),
        ];
        if reverse_order {
            inject_message(&hub, messages[1].0, messages[1].1);
            inject_message(&hub, messages[0].0, messages[0].1);
        } else {
            inject_message(&hub, messages[0].0, messages[0].1);
            inject_message(&hub, messages[1].0, messages[1].1);
        }
        finalize_injection(&hub).await;

        let devices = hub.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].metrics().len(), 1, "flag must not create a metric");

        let metric = hub.metric("123_vebus_170_inverter_current_limit").unwrap();
        assert_eq!(metric.value(), Some(MetricValue::Float(100.0)));
        let writable = metric
            .as_writable()
            .expect("adjustable=1 must keep the metric writable");
        assert_eq!(writable.write_topic(), "W/123/vebus/170/Ac/ActiveIn/CurrentLimit");
    }
}

#[tokio::test]
async fn adjustable_flag_off_downgrades_to_sensor() {
    for reverse_order in [false, true] {
        let hub = mocked_hub(None).unwrap();
        if reverse_order {
            inject_message(
                &hub,
                "N/123/vebus/170/Ac/ActiveIn/CurrentLimitIsAdjustable",
                r#"{"value": 0}"#,
            );
            inject_message(&hub, "N/123/vebus/170/Ac/ActiveIn/CurrentLimit", r#"{"value": 100}"#);
        } else {
            inject_message(&hub, "N/123/vebus/170/Ac/ActiveIn/CurrentLimit", r#"{"value": 100}"#);
            inject_message(
                &hub,
                "N/123/vebus/170/Ac/ActiveIn/CurrentLimitIsAdjustable",
                r#"{"value": 0}"#,
            );
        }
        finalize_injection(&hub).await;

        let metric = hub.metric("123_vebus_170_inverter_current_limit").unwrap();
        assert_eq!(metric.value(), Some(MetricValue::Float(100.0)));
        assert!(
            metric.as_writable().is_none(),
            "adjustable=0 must expose a read-only metric"
        );
    }
}

#[tokio::test]
async fn daily_history_shapes_disambiguate() {
    let hub = mocked_hub(None).unwrap();

    inject_message(
        &hub,
        "N/123/solarcharger/290/History/Daily/0/MaxPower",
        r#"{"value": 1}"#,
    );
    inject_message(
        &hub,
        "N/123/solarcharger/290/History/Daily/1/MaxPower",
        r#"{"value": 2}"#,
    );
    finalize_injection(&hub).await;

    let devices = hub.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].metrics().len(), 2);

    let today = hub
        .metric("123_solarcharger_290_solarcharger_max_power_today")
        .unwrap();
    assert_eq!(today.value(), Some(MetricValue::Float(1.0)));

    let yesterday = hub
        .metric("123_solarcharger_290_solarcharger_max_power_yesterday")
        .unwrap();
    assert_eq!(yesterday.value(), Some(MetricValue::Float(2.0)));
}

#[tokio::test]
async fn range_expanded_switch_message() {
    let hub = mocked_hub(None).unwrap();

    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_2/State",
        r#"{"value": 1}"#,
    );
    finalize_injection(&hub).await;

    let metric = hub.metric("123_switch_170_switch_2_state").unwrap();
    assert_eq!(metric.generic_short_id(), "switch_{output}_state");
    assert_eq!(metric.key_values().get("output").map(String::as_str), Some("2"));
    match metric.value() {
        Some(MetricValue::Enum(member)) => assert_eq!(member.label, "On"),
        other => panic!("expected enum value, got {other:?}"),
    }
}

#[tokio::test]
async fn moniker_name_resolves_from_custom_name_metric() {
    let hub = mocked_hub(None).unwrap();

    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_2/Settings/CustomName",
        r#"{"value": "Pool pump"}"#,
    );
    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_2/Dimming",
        r#"{"value": 75}"#,
    );
    finalize_injection(&hub).await;

    let dimming = hub.metric("123_switch_170_switch_2_dimming").unwrap();
    assert_eq!(dimming.name(), "Switch Pool pump Dimming");
    assert_eq!(dimming.value(), Some(MetricValue::Float(75.0)));
}

#[tokio::test]
async fn unmet_dependency_retries_on_next_barrier() {
    let hub = mocked_hub(None).unwrap();

    // Dimming depends on the custom-name metric; alone it stays pending
    // through the first barrier and commits on the second, once the
    // dependency has been committed too.
    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_3/Dimming",
        r#"{"value": 10}"#,
    );
    finalize_injection(&hub).await;
    assert!(hub.metric("123_switch_170_switch_3_dimming").is_none());

    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_3/Settings/CustomName",
        r#"{"value": null}"#,
    );
    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_3/Dimming",
        r#"{"value": 10}"#,
    );
    inject_message(
        &hub,
        "N/123/switch/170/SwitchableOutput/output_3/Settings/CustomName",
        r#"{"value": "Deck light"}"#,
    );
    finalize_injection(&hub).await;

    let dimming = hub.metric("123_switch_170_switch_3_dimming").unwrap();
    assert_eq!(dimming.name(), "Switch Deck light Dimming");
}

#[tokio::test]
async fn unchanged_value_does_not_notify_by_default() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    finalize_injection(&hub).await;

    let metric = hub.metric("123_grid_30_grid_energy_forward_L1").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    metric.set_on_update(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    sleep_short().await;
    assert_eq!(counter.load(Ordering::SeqCst), 0, "unchanged values must not notify");

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 43}"#);
    sleep_short().await;
    assert_eq!(counter.load(Ordering::SeqCst), 1, "changed value must notify once");
}

#[tokio::test]
async fn zero_update_frequency_notifies_every_message() {
    let mut options = HubOptions::for_host("localhost");
    options.update_frequency_seconds = Some(0);
    let hub = mocked_hub(Some(options)).unwrap();

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    finalize_injection(&hub).await;

    let metric = hub.metric("123_grid_30_grid_energy_forward_L1").unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    metric.set_on_update(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    sleep_short().await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        2,
        "zero frequency must notify on every message"
    );
}

#[tokio::test]
async fn formula_waits_for_dependency_then_recomputes() {
    let hub = mocked_hub(None).unwrap();

    // No dependency committed: the formula must not activate.
    inject_message(&hub, "N/123/battery/5/Soc", r#"{"value": 85}"#);
    finalize_injection(&hub).await;
    assert!(hub.metric("123_system_0_system_battery_charged_energy").is_none());

    // Dependency arrives; next barrier activates and seeds the formula.
    inject_message(&hub, "N/123/system/0/Dc/Battery/Power", r#"{"value": 3600}"#);
    finalize_injection(&hub).await;

    let formula = hub
        .metric("123_system_0_system_battery_charged_energy")
        .expect("formula should activate once its dependency exists");
    assert_eq!(formula.value(), Some(MetricValue::Float(0.0)));
    assert_eq!(formula.unit_of_measurement(), Some("Wh"));

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    formula.set_on_update(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    // A dependency update after a real interval accumulates energy and
    // cascades into the formula.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    inject_message(&hub, "N/123/system/0/Dc/Battery/Power", r#"{"value": 3600}"#);
    sleep_short().await;

    let value = formula.value().and_then(|v| v.as_f64()).unwrap();
    assert!(value > 0.0, "formula should have accumulated energy, got {value}");
    assert!(counter.load(Ordering::SeqCst) >= 1, "formula change must notify");

    // Discharge counterpart stays at zero for positive power
    let discharged = hub
        .metric("123_system_0_system_battery_discharged_energy")
        .unwrap();
    assert_eq!(discharged.value(), Some(MetricValue::Float(0.0)));
}

#[tokio::test]
async fn device_attributes_and_name_precedence() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/battery/5/ProductName", r#"{"value": "BMV-712"}"#);
    inject_message(&hub, "N/123/battery/5/Serial", r#"{"value": "HQ2133"}"#);
    inject_message(&hub, "N/123/battery/5/FirmwareVersion", r#"{"value": "4.08"}"#);

    // Attribute-only devices are not exposed
    assert!(hub.devices().is_empty());

    inject_message(&hub, "N/123/battery/5/Soc", r#"{"value": 85.5}"#);
    finalize_injection(&hub).await;

    let device = hub.device("battery_5").unwrap();
    assert_eq!(device.model().as_deref(), Some("BMV-712"));
    assert_eq!(device.serial_number().as_deref(), Some("HQ2133"));
    assert_eq!(device.firmware_version().as_deref(), Some("4.08"));
    assert_eq!(device.name(), "BMV-712");

    inject_message(&hub, "N/123/battery/5/CustomName", r#"{"value": "House bank"}"#);
    assert_eq!(device.name(), "House bank");
}

#[tokio::test]
async fn bitmask_and_duration_values() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/battery/5/Alarms/Flags", r#"{"value": 3}"#);
    inject_message(&hub, "N/123/battery/5/TimeToGo", r#"{"value": 5400}"#);
    finalize_injection(&hub).await;

    let alarms = hub.metric("123_battery_5_battery_alarm_flags").unwrap();
    assert_eq!(
        alarms.value(),
        Some(MetricValue::String("Low voltage, High voltage".to_string()))
    );

    let time_to_go = hub.metric("123_battery_5_battery_time_to_go").unwrap();
    assert_eq!(time_to_go.value(), Some(MetricValue::Float(1.5)));
    assert_eq!(time_to_go.formatted_value(), "1.5 h");
}

#[tokio::test]
async fn heartbeat_maps_to_system_device() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/heartbeat", r#"{"value": 1700000000}"#);
    finalize_injection(&hub).await;

    let metric = hub.metric("123_system_0_venus_heartbeat").unwrap();
    assert!(matches!(metric.value(), Some(MetricValue::Timestamp(_))));
}

#[tokio::test]
async fn service_publish_resolves_short_id() {
    let hub = mocked_hub(None).unwrap();

    // Unknown short id is a distinct error
    let err = hub.publish("no_such_service", "170", Some(&MetricValue::Int(1)));
    assert!(matches!(err, Err(HubError::TopicNotFound { .. })));

    // A known short id resolves and fails only on the missing transport
    let err = hub.publish("evcharger_start_stop", "170", Some(&MetricValue::Int(1)));
    assert!(matches!(err, Err(HubError::NotConnected { .. })));
}

#[tokio::test]
async fn write_without_connection_is_not_connected() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/evcharger/170/SetCurrent", r#"{"value": 16}"#);
    finalize_injection(&hub).await;

    let metric = hub.metric("123_evcharger_170_evcharger_set_current").unwrap();
    assert_eq!(metric.min_value(), Some(0.0));
    assert_eq!(metric.max_value(), Some(32.0));
    assert_eq!(metric.step(), Some(1.0));
    let writable = metric.as_writable().unwrap();
    assert_eq!(writable.write_topic(), "W/123/evcharger/170/SetCurrent");
    assert!(matches!(
        writable.set(MetricValue::Float(10.0)),
        Err(HubError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn two_hubs_do_not_cross_contaminate() {
    let hub_a = mocked_hub(None).unwrap();
    let hub_b = mocked_hub(None).unwrap();
    assert_ne!(hub_a.client_id(), hub_b.client_id());

    inject_message(&hub_a, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    inject_message(&hub_b, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);

    // A completion echoing hub A's keepalive must not commit hub B's state.
    let foreign_echo = format!(
        r#"{{"full-publish-completed-echo": "{}-1"}}"#,
        hub_a.client_id()
    );
    inject_message(&hub_b, "N/123/full_publish_completed", &foreign_echo);
    assert!(hub_b.devices().is_empty(), "foreign echo must be ignored");

    finalize_injection(&hub_a).await;
    finalize_injection(&hub_b).await;

    let metric_a = hub_a.metric("123_grid_30_grid_energy_forward_L1").unwrap();
    let metric_b = hub_b.metric("123_grid_30_grid_energy_forward_L1").unwrap();

    inject_message(&hub_a, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 50}"#);
    assert_eq!(metric_a.value(), Some(MetricValue::Float(50.0)));
    assert_eq!(metric_b.value(), Some(MetricValue::Float(42.0)));
}

#[tokio::test]
async fn legacy_completion_without_echo_commits() {
    let hub = mocked_hub(None).unwrap();

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    // Old Venus OS versions publish a bare payload with no echo field.
    inject_message(&hub, "N/123/full_publish_completed", "1");
    sleep_short().await;

    assert!(hub.metric("123_grid_30_grid_energy_forward_L1").is_some());
}

#[tokio::test]
async fn new_metric_notification_fires_once_per_metric() {
    let hub = mocked_hub(None).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    hub.set_on_new_metric(move |_hub, device, metric| {
        assert!(!device.unique_id().is_empty());
        assert!(!metric.unique_id().is_empty());
        seen.fetch_add(1, Ordering::SeqCst);
    });

    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 42}"#);
    finalize_injection(&hub).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Updates and repeated barriers must not re-announce the metric.
    inject_message(&hub, "N/123/grid/30/Ac/L1/Energy/Forward", r#"{"value": 43}"#);
    finalize_injection(&hub).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
