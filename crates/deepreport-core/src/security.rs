use std::env;
use std::fmt;

use crate::ReportError;

const REDACTED: &str = "***redacted***";

/// API key held in memory only. `Debug` and `Display` never print it.
#[derive(Clone)]
pub struct SecretValue(Box<str>);

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value for bearer-token APIs.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value.trim().into())
    }
}

/// Read a secret from the environment; unset or blank variables are errors.
pub fn require_env(var: &str) -> Result<SecretValue, ReportError> {
    env::var(var)
        .ok()
        .map(SecretValue::from)
        .filter(|secret| !secret.expose().is_empty())
        .ok_or_else(|| ReportError::MissingSecret(var.to_string()))
}
