//! Integration tests for backstop-config

use backstop_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = BackstopConfig::default();
    assert!(config.validate_all().is_ok());
    assert_eq!(config.recovery.max_queue_size, 1000);
    assert_eq!(config.logging.level, LogLevel::Info);
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("BACKSTOP_BASE_DELAY_MS", Some("250")),
        ("BACKSTOP_MAX_DELAY_MS", Some("30000")),
        ("BACKSTOP_MAX_RETRIES", Some("3")),
        ("BACKSTOP_JITTER", Some("0.1")),
        ("BACKSTOP_CIRCUIT_THRESHOLD", Some("4")),
        ("BACKSTOP_CIRCUIT_TIMEOUT_MS", Some("15000")),
        ("BACKSTOP_DEFAULT_STRATEGY", Some("reduce-batch")),
        ("BACKSTOP_QUEUE_PROCESSING", Some("false")),
        ("BACKSTOP_MAX_QUEUE_SIZE", Some("50")),
        ("BACKSTOP_QUEUE_INTERVAL_MS", Some("500")),
        ("BACKSTOP_LOG_LEVEL", Some("debug")),
        ("BACKSTOP_LOG_FORMAT", Some("json")),
    ];

    with_vars(vars, || {
        let config = ConfigLoader::new().from_env().unwrap();
        let recovery = &config.recovery;

        assert_eq!(recovery.base_delay, Duration::from_millis(250));
        assert_eq!(recovery.max_delay, Duration::from_secs(30));
        assert_eq!(recovery.max_retries, 3);
        assert_eq!(recovery.jitter_fraction, 0.1);
        assert_eq!(recovery.circuit_breaker_threshold, 4);
        assert_eq!(recovery.circuit_breaker_timeout, Duration::from_secs(15));
        assert_eq!(recovery.default_strategy, RecoveryStrategy::ReduceBatch);
        assert!(!recovery.enable_queue_processing);
        assert_eq!(recovery.max_queue_size, 50);
        assert_eq!(recovery.queue_interval, Duration::from_millis(500));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    });
}

#[test]
fn test_invalid_env_values_are_reported() {
    with_vars(vec![("BACKSTOP_MAX_RETRIES", Some("many"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
        assert!(err.to_string().contains("MAX_RETRIES"));
    });

    with_vars(vec![("BACKSTOP_DEFAULT_STRATEGY", Some("panic"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(err.to_string().contains("DEFAULT_STRATEGY"));
    });
}

#[test]
fn test_env_overrides_are_validated() {
    with_vars(vec![("BACKSTOP_CIRCUIT_THRESHOLD", Some("0"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert_eq!(err.domain(), Some("recovery"));
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = BackstopConfig::generate_sample();
    assert!(yaml.contains("circuit_breaker_threshold"));

    let parsed: BackstopConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
    assert_eq!(parsed.recovery.base_delay, Duration::from_secs(1));
}

#[test]
fn test_load_from_file() {
    let yaml = r#"
recovery:
  base_delay: 500ms
  max_delay: 2m
  max_retries: 8
  circuit_breaker_timeout: 30s
  default_strategy: use_cache

logging:
  level: warn
  format: compact
  directives:
    - backstop_resilience::queue=debug
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    // A prefix no other test sets, so ambient variables cannot leak in
    let loader = ConfigLoader::with_prefix("BACKSTOP_FILE_TEST");
    let config = loader.load(Some(file.path())).unwrap();

    assert_eq!(config.recovery.base_delay, Duration::from_millis(500));
    assert_eq!(config.recovery.max_delay, Duration::from_secs(120));
    assert_eq!(config.recovery.max_retries, 8);
    assert_eq!(config.recovery.circuit_breaker_timeout, Duration::from_secs(30));
    assert_eq!(config.recovery.default_strategy, RecoveryStrategy::UseCache);
    // Unset fields keep their defaults
    assert_eq!(config.recovery.circuit_breaker_threshold, 5);
    assert_eq!(config.logging.level, LogLevel::Warn);
    assert_eq!(config.logging.format, LogFormat::Compact);
    assert_eq!(config.logging.directives.len(), 1);
}

#[test]
fn test_file_with_invalid_values_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"recovery:\n  base_delay: 10s\n  max_delay: 1s\n")
        .unwrap();

    let loader = ConfigLoader::with_prefix("BACKSTOP_FILE_TEST");
    let err = loader.from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::DomainError { .. }));
    assert!(err.to_string().contains("max_delay"));
}

#[test]
fn test_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let loader = ConfigLoader::with_prefix("BACKSTOP_FILE_TEST");
    let err = loader.from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::FileReadError(_)));
}

#[tokio::test(start_paused = true)]
async fn test_loaded_config_drives_recovery_system() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"recovery:\n  base_delay: 10ms\n  max_delay: 50ms\n  max_retries: 1\n  circuit_breaker_threshold: 2\n")
        .unwrap();

    let config = ConfigLoader::with_prefix("BACKSTOP_FILE_TEST")
        .from_file(file.path())
        .unwrap();
    let system = backstop_resilience::RecoverySystem::new(config.recovery);

    let result: Result<(), _> = system
        .execute("linear", || async {
            Err(backstop_resilience::ProviderError::rate_limited(None))
        })
        .await;

    assert!(result.unwrap_err().is_max_retries_exceeded());
    assert_eq!(
        system.circuit_state("linear"),
        backstop_resilience::CircuitState::Open
    );
}
