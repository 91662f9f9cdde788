use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let invalid = |message: &str| -> Result<(), ConfigError> {
        Err(ConfigError::Validation {
            message: message.to_string(),
        })
    };

    if config.scheduler.max_concurrent_jobs == 0 {
        return invalid("scheduler.max_concurrent_jobs must be at least 1");
    }
    if config.scheduler.poll_interval_secs == 0 {
        return invalid("scheduler.poll_interval_secs must be at least 1");
    }
    if config.retry.max_retries == 0 {
        return invalid("retry.max_retries must be at least 1");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
    }
    if !(0.0..=1.0).contains(&config.retry.jitter_ratio) {
        return invalid("retry.jitter_ratio must be between 0 and 1");
    }
    if config.accounts.rate_limit_cooldown_mins > config.accounts.max_rate_limit_cooldown_mins {
        return invalid(
            "accounts.rate_limit_cooldown_mins must not exceed accounts.max_rate_limit_cooldown_mins",
        );
    }
    if config.accounts.default_daily_limit == 0 {
        return invalid("accounts.default_daily_limit must be at least 1");
    }
    if config.dispatch.failure_rate_window == 0 {
        return invalid("dispatch.failure_rate_window must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.scheduler.max_concurrent_jobs, 3);
        assert_eq!(config.dispatch.request_delay_ms, 3_000);
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database": { "path": "/var/lib/harvester/db.sqlite" },
            "scheduler": {
                "max_concurrent_jobs": 2,
                "poll_interval_secs": 10,
                "failed_restart_window_mins": 30,
                "failed_restart_limit": 2,
                "max_auto_restarts": 3
            },
            "retry": {
                "max_retries": 5,
                "base_delay_ms": 500,
                "max_delay_ms": 10000,
                "account_backoff_ms": 60000,
                "jitter_ratio": 0.0
            },
            "accounts": {
                "rate_limit_cooldown_mins": 5,
                "max_rate_limit_cooldown_mins": 30,
                "blocked_hours": 12,
                "max_consecutive_failures": 3,
                "soft_cooldown_mins": 2,
                "default_daily_limit": 80
            },
            "dispatch": {
                "request_delay_ms": 1000,
                "max_consecutive_failures": 4,
                "max_eligibility_wait_secs": 60,
                "max_eligibility_waits": 3,
                "failure_rate_window": 10
            },
            "logging": { "level": "debug", "json": true },
            "secrets": { "cookie_key_env_var": "MY_COOKIE_KEY" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.accounts.blocked_hours, 12);
        assert_eq!(config.dispatch.max_eligibility_waits, 3);
        assert!(config.logging.json);
        assert_eq!(
            config.secrets.cookie_key_env_var.as_deref(),
            Some("MY_COOKIE_KEY")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvester.json");
        std::fs::write(&path, r#"{ "version": "1.0", "logging": { "level": "warn" } }"#)
            .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.logging.level, "warn");

        let missing = load_config(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn test_invalid_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_rejects_unknown_and_mistyped_fields() {
        let result = load_config_from_str(r#"{ "version": "1.0", "workers": 4 }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));

        let result =
            load_config_from_str(r#"{ "version": "1.0", "retry": { "max_retries": "three" } }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_semantic_validation() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "retry": { "base_delay_ms": 9000, "max_delay_ms": 1000 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));

        let result = load_config_from_str(
            r#"{ "version": "1.0", "scheduler": { "max_concurrent_jobs": 0 } }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_json() {
        let result = load_config_from_str("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }
}
