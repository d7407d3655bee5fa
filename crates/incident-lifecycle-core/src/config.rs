use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LifecycleError;

/// Engine configuration for notification addressing and rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub config_version: u32,
    pub fallback_contact: String,
    pub sender_address: String,
    pub subject_prefix: String,
    pub signature: String,
}

impl LifecycleConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            fallback_contact: "soporte@municipalidad.local".to_string(),
            sender_address: "no-reply@municipalidad.local".to_string(),
            subject_prefix: "[Incidents]".to_string(),
            signature: "Municipal Incident Management".to_string(),
        }
    }

    /// Validates addresses and required text fields.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] when a field is empty or an
    /// address lacks `@`.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.config_version == 0 {
            return Err(LifecycleError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("fallback_contact", &self.fallback_contact),
            ("sender_address", &self.sender_address),
        ] {
            if !crate::model::looks_like_email(value) {
                return Err(LifecycleError::Configuration(format!(
                    "{name} MUST be an address containing '@'"
                )));
            }
        }

        for (name, value) in [
            ("subject_prefix", &self.subject_prefix),
            ("signature", &self.signature),
        ] {
            if value.trim().is_empty() {
                return Err(LifecycleError::Configuration(format!(
                    "{name} MUST be non-empty"
                )));
            }
        }

        Ok(())
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] for malformed or invalid payloads.
    pub fn from_json(value: &Value) -> Result<Self, LifecycleError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LifecycleError::Configuration(format!("invalid config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::v1()
    }
}
