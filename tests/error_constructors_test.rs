use hesperus::error::HubError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        HubError::cannot_connect("x"),
        HubError::CannotConnect { .. }
    ));
    assert!(matches!(
        HubError::not_connected("x"),
        HubError::NotConnected { .. }
    ));
    assert!(matches!(
        HubError::programming("x"),
        HubError::Programming { .. }
    ));
    assert!(matches!(
        HubError::topic_not_found("x"),
        HubError::TopicNotFound { .. }
    ));
}

#[test]
fn error_constructors_group_2() {
    let ser = HubError::Serialization { message: "s".into() };
    assert!(matches!(ser, HubError::Serialization { .. }));
    assert!(matches!(HubError::config("x"), HubError::Config { .. }));
    assert!(matches!(HubError::mqtt("x"), HubError::Mqtt { .. }));
    assert!(matches!(HubError::io("x"), HubError::Io { .. }));
    assert!(matches!(
        HubError::validation("f", "m"),
        HubError::Validation { .. }
    ));
}

#[test]
fn display_messages() {
    let e = HubError::cannot_connect("timeout waiting for first connection");
    assert!(format!("{}", e).contains("Cannot connect"));

    let e = HubError::validation("port", "bad");
    assert!(format!("{}", e).contains("Validation error"));
}

#[test]
fn timeout_converts_to_cannot_connect() {
    async fn never() {
        std::future::pending::<()>().await
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let err = rt.block_on(async {
        tokio::time::timeout(std::time::Duration::from_millis(1), never())
            .await
            .map_err(HubError::from)
            .unwrap_err()
    });
    assert!(matches!(err, HubError::CannotConnect { .. }));
}
