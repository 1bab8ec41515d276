//! Configuration validation for the Helix inference pool

use crate::config::HelixConfig;
use helix_pool::PoolConfig;
use helix_telemetry::{LogConfig, LogOutput};
use std::collections::HashSet;
use std::fmt;

/// Result of configuration validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Problems that prevent the configuration from being used
    pub errors: Vec<ValidationError>,
    /// Non-blocking findings
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if there are no validation errors
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Merges another validation result into this one
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts accumulated errors into a single `ConfigError::Validation`
    pub fn into_result(self) -> crate::Result<Vec<ValidationWarning>> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(crate::ConfigError::Validation(joined))
    }
}

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The configuration field that failed validation
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.field, self.message)
    }
}

/// Validation warning details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    /// Optional suggestion for resolving the warning
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(
        field: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WARNING] {}: {}", self.field, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (Suggestion: {s})")?;
        }
        Ok(())
    }
}

/// Error code classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required field is missing or empty
    Required,
    /// A value is outside the acceptable range
    OutOfRange,
    /// A value has an invalid format
    InvalidFormat,
    /// A specified path does not exist
    PathNotFound,
    /// Configuration values are in conflict with each other
    Conflict,
}

/// Main configuration validator
#[derive(Debug, Default)]
pub struct Validator {
    /// Whether to emit additional sizing warnings
    strict_mode: bool,
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self { strict_mode: false }
    }

    #[must_use]
    pub const fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Validates a complete `HelixConfig`
    #[must_use]
    pub fn validate(&self, config: &HelixConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.merge(self.validate_pool(&config.pool));
        result.merge(self.validate_devices(&config.pool));
        result.merge(self.validate_models(&config.pool));
        result.merge(self.validate_log(&config.log));
        result
    }

    /// Queue, worker, timer and threshold settings
    #[must_use]
    pub fn validate_pool(&self, config: &PoolConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        for (field, value) in [
            ("pool.queue_capacity", config.queue_capacity as u64),
            ("pool.worker_count", config.worker_count as u64),
            ("pool.job_timeout_ms", config.job_timeout_ms),
            ("pool.max_input_len", config.max_input_len as u64),
            ("pool.reclaim_interval_secs", config.reclaim_interval_secs),
            ("pool.preload_timeout_ms", config.preload_timeout_ms),
            ("pool.default_footprint", config.default_footprint),
        ] {
            if value == 0 {
                result.add_error(ValidationError::new(
                    field,
                    "Must be greater than 0",
                    ErrorCode::OutOfRange,
                ));
            }
        }

        if !(0.0..=1.0).contains(&config.defrag_threshold) {
            result.add_error(ValidationError::new(
                "pool.defrag_threshold",
                format!("Threshold {} is outside [0, 1]", config.defrag_threshold),
                ErrorCode::OutOfRange,
            ));
        }
        if !(0.0..1.0).contains(&config.preload_headroom) {
            result.add_error(ValidationError::new(
                "pool.preload_headroom",
                format!("Headroom {} is outside [0, 1)", config.preload_headroom),
                ErrorCode::OutOfRange,
            ));
        }

        if config.fallback_strategy == Some(config.primary_strategy) {
            result.add_warning(ValidationWarning::with_suggestion(
                "pool.fallback_strategy",
                format!("Fallback repeats the primary strategy {}", config.primary_strategy),
                "Remove the fallback or pick a different strategy",
            ));
        }

        if config.worker_count > config.queue_capacity && config.queue_capacity > 0 {
            result.add_warning(ValidationWarning::with_suggestion(
                "pool.worker_count",
                format!(
                    "{} workers exceed the queue capacity of {}",
                    config.worker_count, config.queue_capacity
                ),
                "Raise queue_capacity so idle workers are not starved",
            ));
        }

        if config.idle_threshold_secs < config.reclaim_interval_secs {
            result.add_warning(ValidationWarning::with_suggestion(
                "pool.idle_threshold_secs",
                "Idle threshold is shorter than the reclaim interval",
                "Models may stay resident up to one full interval past the threshold",
            ));
        }

        if config.preload_enabled && config.preload_limit == 0 {
            result.add_warning(ValidationWarning::with_suggestion(
                "pool.preload_limit",
                "Preloading is enabled with a limit of 0",
                "Set preload_enabled = false or raise preload_limit",
            ));
        }

        if self.strict_mode && config.worker_count > 64 {
            result.add_warning(ValidationWarning::with_suggestion(
                "pool.worker_count",
                format!("High worker count: {}", config.worker_count),
                "Workers beyond the device count mostly wait on the cache",
            ));
        }
        result
    }

    /// Device inventory checks
    #[must_use]
    pub fn validate_devices(&self, config: &PoolConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.devices.is_empty() {
            result.add_error(ValidationError::new(
                "pool.devices",
                "At least one device is required",
                ErrorCode::Required,
            ));
            return result;
        }

        let mut seen = HashSet::new();
        for (index, device) in config.devices.iter().enumerate() {
            let field = format!("pool.devices[{index}]");
            if device.id.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{field}.id"),
                    "Device id must not be empty",
                    ErrorCode::Required,
                ));
            }
            if device.total_memory == 0 {
                result.add_error(ValidationError::new(
                    format!("{field}.total_memory"),
                    format!("Device {} has no memory", device.id),
                    ErrorCode::OutOfRange,
                ));
            }
            if !seen.insert(device.id.as_str()) {
                result.add_error(ValidationError::new(
                    format!("{field}.id"),
                    format!("Duplicate device id {}", device.id),
                    ErrorCode::Conflict,
                ));
            }
        }
        result
    }

    /// Footprint and quantization checks
    #[must_use]
    pub fn validate_models(&self, config: &PoolConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let largest = config.devices.iter().map(|d| d.total_memory).max().unwrap_or(0);

        for (model, bits) in &config.quantization_bits {
            if !(1..=32).contains(bits) {
                result.add_error(ValidationError::new(
                    format!("pool.quantization_bits.{model}"),
                    format!("{bits} bits is outside 1..=32"),
                    ErrorCode::InvalidFormat,
                ));
            }
        }

        for model in config.model_footprints.keys() {
            let footprint = config.footprint(model);
            if footprint == 0 {
                result.add_error(ValidationError::new(
                    format!("pool.model_footprints.{model}"),
                    "Footprint must be greater than 0",
                    ErrorCode::OutOfRange,
                ));
            } else if largest > 0 && footprint > largest {
                result.add_warning(ValidationWarning::with_suggestion(
                    format!("pool.model_footprints.{model}"),
                    format!("{model} needs {footprint} bytes, more than any device holds"),
                    "Quantize the model or add a larger device",
                ));
            }
        }
        result
    }

    /// Validates logging configuration settings
    #[must_use]
    pub fn validate_log(&self, config: &LogConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let file = match &config.output {
            LogOutput::File(path) => Some(path),
            LogOutput::Both { file, .. } => Some(file),
            LogOutput::Stdout | LogOutput::Stderr => None,
        };

        if let Some(parent) = file.and_then(|path| path.parent()) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(ValidationWarning::with_suggestion(
                    "log.output",
                    format!("Parent directory does not exist: {}", parent.display()),
                    "It will be created when logging starts",
                ));
            }
        }
        result
    }
}
