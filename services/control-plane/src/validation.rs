//! Field-level validation of build, config and scale input.
//!
//! Everything here runs before any scheduler call or store write, so a
//! rejected request leaves no trace.

use std::collections::BTreeMap;

use stevedore_id::IdError;

use crate::models::MemoryLimit;

/// Highest accepted CPU share value.
pub const MAX_CPU_SHARES: u32 = 1024;

/// A request failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid app id: {0}")]
    InvalidAppId(#[from] IdError),

    #[error("build image is required")]
    MissingImage,

    #[error("invalid process type '{0}': must start with a lowercase letter and contain only [a-z0-9_-]")]
    InvalidProcessType(String),

    #[error("procfile command for '{0}' is empty")]
    EmptyCommand(String),

    #[error("config keys cannot be empty")]
    EmptyConfigKey,

    #[error("invalid memory limit '{value}' for '{process_type}': limit format is <number><unit>, where unit = B, K, M or G")]
    InvalidMemoryLimit { process_type: String, value: String },

    #[error("invalid CPU shares '{value}' for '{process_type}': must be an integer between 0 and 1024")]
    InvalidCpuShares { process_type: String, value: String },

    #[error("invalid tag key '{0}': tag keys can only contain [a-z]")]
    InvalidTagKey(String),

    #[error("invalid tag value '{value}' for '{key}': tag values can only contain word characters")]
    InvalidTagValue { key: String, value: String },

    #[error("config patch changes nothing")]
    EmptyConfigChange,

    #[error("invalid scale for '{process_type}': {reason}")]
    InvalidScale { process_type: String, reason: String },

    #[error("container type '{0}' is not defined by the current release")]
    UnknownProcessType(String),

    #[error("no build associated with this release")]
    NoBuild,

    #[error("cannot roll back: {0}")]
    InvalidRollback(String),
}

/// Process types start with a lowercase letter, followed by `[a-z0-9_-]`.
pub fn validate_process_type(process_type: &str) -> Result<(), ValidationError> {
    let mut chars = process_type.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidProcessType(
            process_type.to_string(),
        ))
    }
}

pub fn validate_image(image: &str) -> Result<(), ValidationError> {
    if image.trim().is_empty() {
        return Err(ValidationError::MissingImage);
    }
    Ok(())
}

pub fn validate_procfile(procfile: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for (process_type, command) in procfile {
        validate_process_type(process_type)?;
        if command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand(process_type.clone()));
        }
    }
    Ok(())
}

pub fn validate_config_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::EmptyConfigKey);
    }
    Ok(())
}

/// Parses a per-type memory limit such as `512M`.
pub fn parse_memory_limit(process_type: &str, value: &str) -> Result<MemoryLimit, ValidationError> {
    validate_process_type(process_type)?;
    MemoryLimit::parse(value).ok_or_else(|| ValidationError::InvalidMemoryLimit {
        process_type: process_type.to_string(),
        value: value.to_string(),
    })
}

/// Parses per-type CPU shares, an integer in `0..=1024`.
pub fn parse_cpu_shares(process_type: &str, value: &str) -> Result<u32, ValidationError> {
    validate_process_type(process_type)?;
    let invalid = || ValidationError::InvalidCpuShares {
        process_type: process_type.to_string(),
        value: value.to_string(),
    };

    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    match value.parse::<u32>() {
        Ok(shares) if shares <= MAX_CPU_SHARES => Ok(shares),
        _ => Err(invalid()),
    }
}

/// Tag keys are lowercase letters; values are word characters.
pub fn validate_tag(key: &str, value: &str) -> Result<(), ValidationError> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::InvalidTagKey(key.to_string()));
    }
    if value.is_empty() || !value.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidTagValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
