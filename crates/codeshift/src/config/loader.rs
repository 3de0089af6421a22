use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use jsonschema::Validator;

use crate::config::schema::Settings;
use crate::db::resolve_path;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/settings-v1.json");

/// Compiled once per process; the schema is embedded at build time.
fn schema_validator() -> Result<&'static Validator, ConfigError> {
    static VALIDATOR: OnceLock<Result<Validator, String>> = OnceLock::new();

    let compiled = VALIDATOR.get_or_init(|| {
        let schema: serde_json::Value = serde_json::from_str(SCHEMA_JSON)
            .map_err(|e| format!("Invalid embedded schema JSON: {}", e))?;
        jsonschema::validator_for(&schema).map_err(|e| format!("Failed to compile JSON schema: {}", e))
    });
    compiled.as_ref().map_err(|message| ConfigError::Validation {
        message: message.clone(),
    })
}

/// Reads a settings file. Storage paths starting with `~/` are expanded.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let settings = load_settings_from_str(&content)?;
    log::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let value: serde_json::Value = serde_json::from_str(content)?;

    let errors: Vec<String> = schema_validator()?
        .iter_errors(&value)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: errors.join("; "),
        });
    }

    let mut settings: Settings = serde_json::from_value(value)?;
    settings.storage.database_path = settings
        .storage
        .database_path
        .as_deref()
        .map(resolve_path);
    settings.storage.output_directory = resolve_path(&settings.storage.output_directory);

    validate_settings(&settings)?;
    Ok(settings)
}

/// Semantic checks on settings, whether loaded from disk or built in code.
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported settings version: {}", settings.version),
        });
    }

    if settings.scheduler.max_concurrent_jobs == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.max_concurrent_jobs must be at least 1".to_string(),
        });
    }
    if settings.retry.infra_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.infra_attempts must be at least 1".to_string(),
        });
    }

    let timeouts = &settings.timeouts;
    for (name, secs) in [
        ("analyze", timeouts.analyze),
        ("convert", timeouts.convert),
        ("compile", timeouts.compile),
        ("test", timeouts.test),
        ("review", timeouts.review),
    ] {
        if secs == 0 {
            return Err(ConfigError::Validation {
                message: format!("timeouts.{} must be positive", name),
            });
        }
    }

    if settings.submission.max_files == 0 || settings.submission.max_total_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "submission limits must be positive".to_string(),
        });
    }
    if settings.logging.event_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "logging.event_capacity must be positive".to_string(),
        });
    }

    let mut profile_ids = HashSet::new();
    for profile in &settings.profiles {
        if profile.id.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "profile id must not be blank".to_string(),
            });
        }
        if !profile_ids.insert(profile.id.as_str()) {
            return Err(ConfigError::DuplicateProfile(profile.id.clone()));
        }
    }

    Ok(())
}
