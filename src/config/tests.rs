//! Config module tests

use std::time::Duration;

use super::*;
use crate::bridge::OverflowPolicy;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("FL_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${FL_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("FL_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("FL_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${FL_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("FL_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${FL_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("FL_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("FL_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${FL_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.health.bind.port(), 8086);
    assert_eq!(config.health.max_workers, 100);
    assert_eq!(config.lifecycle.drain_window, Duration::from_secs(240));
    assert_eq!(config.postgres.host, "db");
    assert_eq!(config.postgres.port, 5432);
    assert_eq!(config.ingest.transaction_timeout, Duration::from_secs(5));
    assert_eq!(config.ingest.max_putback_attempts, 0);
    assert!(!config.ingest.dry_run);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.bridge.topic_prefix, "ia");
    assert_eq!(config.kafka.bootstrap_servers, "localhost:9092");
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[health]
bind = "127.0.0.1:9000"
max_workers = 50

[lifecycle]
drain_window = "30s"

[mqtt]
address = "mosquitto:8883"
protocol = "mqtts"
client_id = "line-7"
username = "bridge"
password = "secret"
qos = 2

[kafka]
bootstrap_servers = "kafka-0:9092,kafka-1:9092"
security_protocol = "SASL_SSL"
sasl_mechanism = "SCRAM-SHA-512"
topic_partitions = 6
topic_replication = 3

[postgres]
host = "pg.internal"
port = 6432
user = "writer"
password = "pw"
database = "factory"

[bridge]
topic_prefix = "ia"
max_in_flight = 40
kafka_listen_topic = "^ia\\..*\\.processValue$"
retry_backoff = "250ms"
topic_create_alert_threshold = 3

[bridge.queue]
capacity = 0

[ingest]
dry_run = true
transaction_timeout = "2s"
max_putback_attempts = 20
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.health.bind.to_string(), "127.0.0.1:9000");
    assert_eq!(config.lifecycle.drain_window, Duration::from_secs(30));
    assert_eq!(config.mqtt.protocol, MqttProtocol::Mqtts);
    assert_eq!(config.mqtt.parse_address(), ("mosquitto".to_string(), 8883));
    assert_eq!(config.mqtt.qos, 2);
    assert_eq!(config.kafka.topic_partitions, 6);
    assert_eq!(config.kafka.sasl_mechanism.as_deref(), Some("SCRAM-SHA-512"));
    assert_eq!(config.postgres.port, 6432);
    assert_eq!(config.postgres.password.as_deref(), Some("pw"));
    assert_eq!(
        config.bridge.kafka_listen_topic.as_deref(),
        Some(r"^ia\..*\.processValue$")
    );
    assert_eq!(config.bridge.max_in_flight, 40);
    assert_eq!(config.bridge.retry_backoff, Duration::from_millis(250));
    assert_eq!(config.bridge.queue.capacity, 0);
    assert_eq!(config.bridge.queue.overflow, OverflowPolicy::DropOldest);
    assert!(config.ingest.dry_run);
    assert_eq!(config.ingest.transaction_timeout, Duration::from_secs(2));
    assert_eq!(config.ingest.max_putback_attempts, 20);
}

#[test]
fn test_invalid_qos() {
    let toml = r#"
[mqtt]
qos = 3
"#;

    let result = Config::parse(toml);
    assert!(result.is_err());
}

#[test]
fn test_invalid_topic_prefix() {
    let toml = r#"
[bridge]
topic_prefix = "ia/factory"
"#;

    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("topic_prefix"));
}

#[test]
fn test_ingest_topic_follows_prefix() {
    // Renaming the prefix without the ingest topic would consume nothing
    let toml = r#"
[bridge]
topic_prefix = "plant"
mqtt_listen_topic = "plant/#"
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("ingest.topic"), "{}", err);

    let toml = r#"
[bridge]
topic_prefix = "plant"
mqtt_listen_topic = "plant/#"

[ingest]
topic = "^plant\\..*\\.count$"
"#;
    let config = Config::parse(toml).unwrap();
    assert_eq!(config.ingest.topic, r"^plant\..*\.count$");

    let toml = r#"
[bridge]
topic_prefix = "plant"
mqtt_listen_topic = "plant/#"

[ingest]
topic = "plant.acme.site.press.state"
"#;
    assert!(Config::parse(toml).is_ok());
}

#[test]
fn test_default_topic_is_built_from_prefix() {
    let mut config = Config::default();
    config.bridge.topic_prefix = "line-7".to_string();
    config.ingest.topic = IngestConfig::default_topic("line-7");
    assert!(config.validate().is_ok());

    let re = regex::Regex::new(&config.ingest.topic).unwrap();
    assert!(re.is_match("line-7.acme.plant1.press.count"));
    assert!(!re.is_match("ia.acme.plant1.press.count"));
    assert!(!re.is_match("line-7.acme.plant1.press.processValue"));
}

#[test]
fn test_in_flight_window_fits_worker_limit() {
    let toml = r#"
[bridge]
max_in_flight = 96
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("max_workers"), "{}", err);

    let toml = r#"
[bridge]
max_in_flight = 95
"#;
    assert!(Config::parse(toml).is_ok());

    // Without the health server nothing enforces the limit
    let toml = r#"
[health]
enabled = false

[bridge]
max_in_flight = 500
"#;
    assert!(Config::parse(toml).is_ok());
}

#[test]
fn test_empty_kafka_listen_topic() {
    let toml = r#"
[bridge]
kafka_listen_topic = ""
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_zero_transaction_timeout() {
    let toml = r#"
[ingest]
transaction_timeout = "0s"
"#;

    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("transaction_timeout"));
}

#[test]
fn test_putback_backoff_above_max() {
    let toml = r#"
[ingest]
putback_backoff = "2m"
max_putback_backoff = "1m"
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("floorlink.toml");

    std::env::set_var("FL_TEST_KAFKA_HOST", "kafka.local");

    let config_content = r#"
[kafka]
bootstrap_servers = "${FL_TEST_KAFKA_HOST}:9092"

[ingest]
group_id = "${FL_TEST_GROUP:-ingest-a}"
"#;

    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.kafka.bootstrap_servers, "kafka.local:9092");
    assert_eq!(config.ingest.group_id, "ingest-a"); // Uses default

    std::env::remove_var("FL_TEST_KAFKA_HOST");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.bridge.mqtt_listen_topic, "ia/#");
}

#[test]
fn test_env_override_nested_key() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("floorlink.toml");
    std::fs::write(
        &config_path,
        r#"
[postgres]
database = "from_file"
"#,
    )
    .unwrap();

    std::env::set_var("FLOORLINK__POSTGRES__DATABASE", "from_env");
    let config = Config::load(&config_path).unwrap();
    std::env::remove_var("FLOORLINK__POSTGRES__DATABASE");

    assert_eq!(config.postgres.database, "from_env");
}
