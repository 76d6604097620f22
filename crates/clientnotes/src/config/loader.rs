use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const MAX_WORKER_COUNT: usize = 10;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if !(1..=MAX_WORKER_COUNT).contains(&config.worker_count) {
        return Err(ConfigError::Validation {
            message: format!(
                "worker_count must be between 1 and {}, got {}",
                MAX_WORKER_COUNT, config.worker_count
            ),
        });
    }

    if config.output_directory.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "output_directory must not be empty".to_string(),
        });
    }

    for (name, source) in [
        ("agency_id", &config.credentials.agency_id),
        ("email", &config.credentials.email),
        ("password", &config.credentials.password),
    ] {
        if !source.is_configured() {
            return Err(ConfigError::Validation {
                message: format!(
                    "credentials.{} needs one of: value, file, or env_var",
                    name
                ),
            });
        }
    }

    for (name, policy) in [
        ("login", &config.retry.login),
        ("export", &config.retry.export),
        ("lookup", &config.retry.lookup),
    ] {
        validate_retry(name, policy)?;
    }

    if config.session.max_relogin_attempts == 0 {
        return Err(ConfigError::InvalidRetry {
            name: "session.max_relogin_attempts".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    if let Some(weekly) = &config.schedule.weekly {
        if weekly.weekday > 6 {
            return Err(ConfigError::InvalidSchedule {
                name: "weekly".to_string(),
                reason: format!("weekday must be 0 (Monday) to 6, got {}", weekly.weekday),
            });
        }
        validate_time_of_day("weekly", weekly.hour, weekly.minute)?;
    }

    if let Some(monthly) = &config.schedule.monthly {
        if !(1..=28).contains(&monthly.day) {
            return Err(ConfigError::InvalidSchedule {
                name: "monthly".to_string(),
                reason: format!("day must be 1 to 28, got {}", monthly.day),
            });
        }
        validate_time_of_day("monthly", monthly.hour, monthly.minute)?;
    }

    Ok(())
}

fn validate_retry(name: &str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(ConfigError::InvalidRetry {
            name: name.to_string(),
            reason: "max_attempts must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn validate_time_of_day(name: &str, hour: u32, minute: u32) -> Result<(), ConfigError> {
    if hour > 23 || minute > 59 {
        return Err(ConfigError::InvalidSchedule {
            name: name.to_string(),
            reason: format!("invalid time {:02}:{:02}", hour, minute),
        });
    }
    Ok(())
}
