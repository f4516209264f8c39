//! ODM-wide configuration.
//!
//! `OdmConfig` supplies the defaults every model inherits. Models override
//! them through [`ModelOptions`](crate::ModelOptions) and single validation
//! calls through [`ValidateOptions`](crate::ValidateOptions).
//!
//! # Example
//!
//! ```ignore
//! let config = OdmConfig::from_json_str(r#"{"validate": "oncreate", "enforce_extra": "strict"}"#)?;
//! assert_eq!(config.primary_key, "id");
//! ```

use serde::{Deserialize, Serialize};

/// When documents are validated automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatePolicy {
    /// Validate the whole graph before `save_all` and the root before `save`.
    #[default]
    OnSave,
    /// Validate when a document is constructed; saves skip validation.
    OnCreate,
}

/// How to handle fields that are not declared in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtraFieldsBehavior {
    /// Undeclared fields are a validation error
    Strict,
    /// Undeclared fields are dropped silently
    Remove,
    /// Undeclared fields pass through
    #[default]
    None,
}

/// How strictly field types (and nulls) are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeEnforcement {
    /// Wrong types fail; null fails unless the rule allows it
    Strict,
    /// Wrong types fail; null passes unless the rule forbids it
    #[default]
    Loose,
    /// Types are not checked
    None,
}

/// ODM-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdmConfig {
    /// When automatic validation runs
    pub validate: ValidatePolicy,
    /// Default primary key field name
    pub primary_key: String,
    /// Treat every non-optional field as required
    pub enforce_missing: bool,
    /// Policy for undeclared fields
    pub enforce_extra: ExtraFieldsBehavior,
    /// Type checking strictness
    pub enforce_type: TypeEnforcement,
}

impl Default for OdmConfig {
    fn default() -> Self {
        Self {
            validate: ValidatePolicy::OnSave,
            primary_key: "id".to_string(),
            enforce_missing: false,
            enforce_extra: ExtraFieldsBehavior::None,
            enforce_type: TypeEnforcement::Loose,
        }
    }
}

impl OdmConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.primary_key.is_empty() {
            return Err(crate::Error::config(None, "primary_key must not be empty"));
        }
        Ok(config)
    }

    /// Set the validation policy.
    #[must_use]
    pub fn validate(mut self, policy: ValidatePolicy) -> Self {
        self.validate = policy;
        self
    }

    /// Set the default primary key name.
    #[must_use]
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = name.into();
        self
    }

    /// Require every non-optional field.
    #[must_use]
    pub fn enforce_missing(mut self, enforce: bool) -> Self {
        self.enforce_missing = enforce;
        self
    }

    /// Set the undeclared-field policy.
    #[must_use]
    pub fn enforce_extra(mut self, behavior: ExtraFieldsBehavior) -> Self {
        self.enforce_extra = behavior;
        self
    }

    /// Set type checking strictness.
    #[must_use]
    pub fn enforce_type(mut self, enforcement: TypeEnforcement) -> Self {
        self.enforce_type = enforcement;
        self
    }
}
