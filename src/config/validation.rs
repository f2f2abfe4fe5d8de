//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate buffer sizes (power of two, arena large enough)
//! - Check route references (reserved source_ref, empty names)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let tls = &config.tls;
    if !tls.transfer_capacity.is_power_of_two() {
        errors.push(ValidationError::new(
            "tls.transfer_capacity",
            format!("{} is not a power of two", tls.transfer_capacity),
        ));
    }
    if tls.arena_capacity < tls.transfer_capacity {
        errors.push(ValidationError::new(
            "tls.arena_capacity",
            format!(
                "{} is smaller than transfer_capacity {}",
                tls.arena_capacity, tls.transfer_capacity
            ),
        ));
    }
    if tls.ca_path.as_deref() == Some("") {
        errors.push(ValidationError::new("tls.ca_path", "must not be empty"));
    }

    for (i, route) in config.routes.iter().enumerate() {
        let field = |name: &str| format!("routes[{}].{}", i, name);

        if route.source.is_empty() {
            errors.push(ValidationError::new(field("source"), "must not be empty"));
        }
        if route.target.is_empty() {
            errors.push(ValidationError::new(field("target"), "must not be empty"));
        }
        if route.source_ref == 0 {
            errors.push(ValidationError::new(
                field("source_ref"),
                "0 is reserved for reply streams",
            ));
        }
        if route.hostname.as_deref() == Some("") {
            errors.push(ValidationError::new(field("hostname"), "must not be empty"));
        }
        if route.application_protocol.as_deref() == Some("") {
            errors.push(ValidationError::new(
                field("application_protocol"),
                "must not be empty",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
