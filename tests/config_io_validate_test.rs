use hesperus::config::HubOptions;
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("hesperus.yaml");

    let mut options = HubOptions::for_host("10.0.0.5");
    options.port = 8883;
    options.use_ssl = true;
    options.installation_id = Some("ce3f0ae5476a".to_string());
    options.topic_prefix = Some("bridge".to_string());

    options.save_to_file(&path).unwrap();
    let loaded = HubOptions::from_file(&path).unwrap();

    assert_eq!(loaded.host, "10.0.0.5");
    assert_eq!(loaded.port, 8883);
    assert!(loaded.use_ssl);
    assert_eq!(loaded.installation_id.as_deref(), Some("ce3f0ae5476a"));
    assert_eq!(loaded.topic_prefix.as_deref(), Some("bridge"));
}

#[test]
fn minimal_yaml_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"host: venus.local\n").unwrap();
    let options = HubOptions::from_file(tmp.path()).unwrap();
    assert_eq!(options.host, "venus.local");
    assert_eq!(options.port, 1883);
    assert!(options.installation_id.is_none());
    assert!(options.update_frequency_seconds.is_none());
}

#[test]
fn options_validation_errors() {
    let mut options = HubOptions::for_host("venus.local");
    assert!(options.validate().is_ok());

    options.host.clear();
    assert!(options.validate().is_err());

    options = HubOptions::for_host("venus.local");
    options.port = 0;
    assert!(options.validate().is_err());

    options = HubOptions::for_host("venus.local");
    options.installation_id = Some(String::new());
    assert!(options.validate().is_err());

    options = HubOptions::for_host("venus.local");
    options.topic_prefix = Some("trailing/".to_string());
    assert!(options.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = HubOptions::from_file(tmp.path()).unwrap_err();
    assert!(format!("{}", err).contains("Serialization error"));
}
