//! Compose-style variable interpolation: `$VAR`, `${VAR}`, `${VAR:-default}`,
//! `${VAR-default}`, `${VAR:?message}`, `${VAR?message}` and `$$`

use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
    )
    .unwrap()
});

/// Variables available for interpolation
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    /// Explicit variables, checked before the process environment
    pub vars: HashMap<String, String>,
    /// Whether to fall back to the process environment
    pub use_process_env: bool,
}

impl Interpolator {
    /// Interpolator backed by the process environment
    pub fn from_env() -> Self {
        Self {
            vars: HashMap::new(),
            use_process_env: true,
        }
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.vars.get(name) {
            return Some(value.clone());
        }
        if self.use_process_env {
            return std::env::var(name).ok();
        }
        None
    }

    /// Substitute every variable reference in `input`
    pub fn interpolate(&self, input: &str) -> Result<String, InterpolationError> {
        let mut error: Option<InterpolationError> = None;

        let result = VARIABLE_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve_capture(caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(result.into_owned())
    }

    /// Substitute variables in every string scalar of a parsed document.
    /// Mapping keys and comments are left alone.
    pub fn interpolate_value(&self, value: &mut Value) -> Result<(), InterpolationError> {
        match value {
            Value::String(s) => {
                if s.contains('$') {
                    *s = self.interpolate(s)?;
                }
            }
            Value::Sequence(items) => {
                for item in items {
                    self.interpolate_value(item)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate_value(item)?;
                }
            }
            Value::Tagged(tagged) => self.interpolate_value(&mut tagged.value)?,
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }

    fn resolve_capture(&self, caps: &Captures) -> Result<String, InterpolationError> {
        // $$
        if caps.get(1).is_some() {
            return Ok("$".to_string());
        }

        // $VAR
        if let Some(name) = caps.get(5) {
            return Ok(self.lookup_or_blank(name.as_str()));
        }

        // ${VAR...}
        let Some(name) = caps.get(2).map(|m| m.as_str()) else {
            return Ok(caps
                .get(0)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default());
        };
        let value = self.lookup(name);
        let operand = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

        match caps.get(3).map(|m| m.as_str()) {
            None => Ok(self.lookup_or_blank(name)),
            Some(":-") => Ok(value
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| operand.to_string())),
            Some("-") => Ok(value.unwrap_or_else(|| operand.to_string())),
            Some(":?") => value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| required(name, operand)),
            Some("?") => value.ok_or_else(|| required(name, operand)),
            Some(other) => Err(InterpolationError::InvalidOperator(other.to_string())),
        }
    }

    fn lookup_or_blank(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_else(|| {
            log::warn!(
                "The \"{}\" variable is not set. Defaulting to a blank string.",
                name
            );
            String::new()
        })
    }
}

fn required(name: &str, message: &str) -> InterpolationError {
    InterpolationError::Required {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Errors that can occur during interpolation
#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("Required variable '{name}' is missing a value: {message}")]
    Required { name: String, message: String },

    #[error("Invalid interpolation operator: {0}")]
    InvalidOperator(String),
}
