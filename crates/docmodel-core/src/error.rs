//! Error types for document operations.

use crate::value::Value;
use regex::{Captures, Regex};
use std::fmt;
use std::sync::OnceLock;

/// The primary error type for all document operations.
#[derive(Debug)]
pub enum Error {
    /// A lookup by primary key found nothing
    DocumentNotFound(NotFoundError),
    /// A write was rejected before reaching storage (unsaved document, missing key)
    InvalidWrite(InvalidWriteError),
    /// Field or model validation failed
    Validation(ValidationError),
    /// Insert collided with an existing primary key
    DuplicatePrimaryKey(DuplicateKeyError),
    /// Bad model or relation declaration
    Config(ConfigError),
    /// No relation with that field name on the model
    UnknownRelation(UnknownRelationError),
    /// Write-order dependencies form a cycle
    CyclicRelation(CycleError),
    /// A planned write failed
    Persistence(PersistenceError),
    /// Planning or executing a joined read failed
    Join(JoinError),
    /// Raw storage driver failure
    Driver(DriverError),
    /// Type conversion errors
    Type(TypeError),
    /// Operation timed out
    Timeout,
    /// Custom error with message (user hooks)
    Custom(String),
}

#[derive(Debug)]
pub struct NotFoundError {
    pub table: String,
    pub key: Value,
}

#[derive(Debug)]
pub struct InvalidWriteError {
    pub table: String,
    pub message: String,
}

#[derive(Debug)]
pub struct DuplicateKeyError {
    pub table: String,
    pub key: Value,
}

#[derive(Debug)]
pub struct ConfigError {
    /// Model the declaration was made on, when known
    pub model: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct UnknownRelationError {
    pub model: String,
    pub field: String,
}

/// A write-order cycle, listed as document descriptions in dependency order.
#[derive(Debug)]
pub struct CycleError {
    pub path: Vec<String>,
}

#[derive(Debug)]
pub struct PersistenceError {
    /// Zero-based position of the failed write in the plan
    pub step: usize,
    /// Number of writes in the plan
    pub total: usize,
    /// `insert`, `replace`, `update`, `delete`, `link` or `unlink`
    pub operation: &'static str,
    pub table: String,
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct JoinError {
    pub model: String,
    pub field: Option<String>,
    /// Fetch step that failed, for execution errors
    pub step: Option<usize>,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug)]
pub struct DriverError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
}

/// Validation error for field-level and model-level validation.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Every failure, in the order it was found
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// Dotted path of the field (`comments[0].text`)
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field is missing
    Required,
    /// Field is null but nulls are not allowed
    Null,
    /// Value has the wrong type
    Type,
    /// Value is below minimum
    Min,
    /// Value is above maximum
    Max,
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// String does not have the exact length
    Length,
    /// Value doesn't match regex pattern
    Pattern,
    /// String contains non-alphanumeric characters
    Alphanum,
    /// String is not an email address
    Email,
    /// String has uppercase characters
    Lowercase,
    /// String has lowercase characters
    Uppercase,
    /// Value is not one of the allowed values
    Enum,
    /// Number has a fractional part
    Integer,
    /// Collection has fewer items than minimum
    MinItems,
    /// Collection has more items than maximum
    MaxItems,
    /// Field is not declared in the schema
    Extra,
    /// Custom validation failed
    Custom,
    /// Model-level validation failed
    Model,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Required, "is required");
    }

    /// Add a null value error.
    pub fn add_null(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Null, "cannot be null");
    }

    /// Add a type mismatch error.
    pub fn add_type(&mut self, field: impl Into<String>, expected: &str, actual: &Value) {
        self.add(
            field,
            ValidationErrorKind::Type,
            format!("must be a {expected}, got {}", actual.type_name()),
        );
    }

    /// Add a min value error.
    pub fn add_min(
        &mut self,
        field: impl Into<String>,
        min: impl fmt::Display,
        actual: impl fmt::Display,
    ) {
        self.add(
            field,
            ValidationErrorKind::Min,
            format!("must be at least {min}, got {actual}"),
        );
    }

    /// Add a max value error.
    pub fn add_max(
        &mut self,
        field: impl Into<String>,
        max: impl fmt::Display,
        actual: impl fmt::Display,
    ) {
        self.add(
            field,
            ValidationErrorKind::Max,
            format!("must be at most {max}, got {actual}"),
        );
    }

    /// Add a min length error.
    pub fn add_min_length(&mut self, field: impl Into<String>, min: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MinLength,
            format!("must be at least {min} characters, got {actual}"),
        );
    }

    /// Add a max length error.
    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxLength,
            format!("must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a min_items error for arrays.
    pub fn add_min_items(&mut self, field: impl Into<String>, min: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MinItems,
            format!("must have at least {min} items, got {actual}"),
        );
    }

    /// Add a max_items error for arrays.
    pub fn add_max_items(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxItems,
            format!("must have at most {max} items, got {actual}"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        self.add(
            field,
            ValidationErrorKind::Pattern,
            format!("must match pattern '{pattern}'"),
        );
    }

    /// Add an extra field error.
    pub fn add_extra(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Extra, "is not declared in the schema");
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Add a model-level validation error.
    ///
    /// The error is recorded under the document's path, or `__model__` at the
    /// root.
    pub fn add_model_error(&mut self, path: &str, message: impl Into<String>) {
        let field = if path.is_empty() { "__model__" } else { path };
        self.add(field, ValidationErrorKind::Model, message);
    }

    /// Move every failure from `other` into `self`.
    pub fn merge(&mut self, other: ValidationError) {
        self.errors.extend(other.errors);
    }

    /// Find the first failure for a field path.
    pub fn for_field(&self, field: &str) -> Option<&FieldValidationError> {
        self.errors.iter().find(|e| e.field == field)
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Build a persistence error wrapping a failed planned write.
    pub fn persistence(
        step: usize,
        total: usize,
        operation: &'static str,
        table: impl Into<String>,
        source: Error,
    ) -> Self {
        Error::Persistence(PersistenceError {
            step,
            total,
            operation,
            table: table.into(),
            source: Box::new(source),
        })
    }

    /// Build a configuration error.
    pub fn config(model: Option<&str>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            model: model.map(str::to_string),
            message: message.into(),
        })
    }

    /// Build an invalid write error.
    pub fn invalid_write(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidWrite(InvalidWriteError {
            table: table.into(),
            message: message.into(),
        })
    }

    /// Build a driver error from a message.
    pub fn driver(message: impl Into<String>) -> Self {
        Error::Driver(DriverError {
            message: message.into(),
            source: None,
        })
    }

    /// Storage messages reporting a missing document. An optional
    /// `key <value>` names the key.
    pub const DOCUMENT_NOT_FOUND_PATTERN: &'static str =
        r"^(?:The query did not find a document|Document not found)(?:.*?\bkey (?P<key>\S+))?";

    /// Storage messages reporting a primary key collision, optionally
    /// followed by the key.
    pub const DUPLICATE_PRIMARY_KEY_PATTERN: &'static str = r"^Duplicate primary key(?: (?P<key>\S+))?";

    /// Storage messages reporting a timeout.
    pub const TIMEOUT_PATTERN: &'static str = r"(?i)\btimed? ?out\b";

    /// Turn a raw storage message for `table` into the matching error.
    ///
    /// Messages matching none of the patterns become [`Error::Driver`].
    pub fn from_driver_message(table: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let Some([not_found, duplicate, timeout]) = driver_patterns() else {
            return Error::driver(message);
        };
        if let Some(caps) = not_found.captures(&message) {
            return Error::DocumentNotFound(NotFoundError {
                table: table.to_string(),
                key: captured_key(&caps),
            });
        }
        if let Some(caps) = duplicate.captures(&message) {
            return Error::DuplicatePrimaryKey(DuplicateKeyError {
                table: table.to_string(),
                key: captured_key(&caps),
            });
        }
        if timeout.is_match(&message) {
            return Error::Timeout;
        }
        Error::driver(message)
    }

    /// Build a type mismatch error.
    pub fn type_mismatch(expected: &'static str, actual: &Value) -> Self {
        Error::Type(TypeError {
            expected,
            actual: actual.type_name().to_string(),
        })
    }

    /// Did the storage call time out?
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Error::Timeout)
    }

    /// Is this a missing-document error?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DocumentNotFound(_))
    }

    /// Validation failures, if this is a validation error.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(v) => Some(v),
            _ => None,
        }
    }

    /// The innermost error, following persistence and join wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Persistence(p) => p.source.root_cause(),
            Error::Join(JoinError {
                source: Some(source),
                ..
            }) => source.root_cause(),
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DocumentNotFound(e) => {
                write!(f, "Document not found: {} with key {}", e.table, e.key)
            }
            Error::InvalidWrite(e) => write!(f, "Invalid write on {}: {}", e.table, e.message),
            Error::Validation(e) => write!(f, "Validation error: {e}"),
            Error::DuplicatePrimaryKey(e) => {
                write!(f, "Duplicate primary key {} in {}", e.key, e.table)
            }
            Error::Config(e) => write!(f, "Configuration error: {e}"),
            Error::UnknownRelation(e) => {
                write!(f, "Unknown relation '{}' on model {}", e.field, e.model)
            }
            Error::CyclicRelation(e) => {
                write!(f, "Cyclic write dependency: {}", e.path.join(" -> "))
            }
            Error::Persistence(e) => write!(
                f,
                "Persistence error at step {}/{} ({} on {}): {}",
                e.step + 1,
                e.total,
                e.operation,
                e.table,
                e.source
            ),
            Error::Join(e) => {
                write!(f, "Join error on {}", e.model)?;
                if let Some(field) = &e.field {
                    write!(f, ".{field}")?;
                }
                if let Some(step) = e.step {
                    write!(f, " (step {step})")?;
                }
                write!(f, ": {}", e.message)
            }
            Error::Driver(e) => write!(f, "Driver error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: expected {}, found {}", e.expected, e.actual),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Validation(e) => Some(e),
            Error::Persistence(e) => Some(e.source.as_ref()),
            Error::Join(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Driver(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{model}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Error::Join(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::CyclicRelation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::config(None, format!("invalid JSON: {err}"))
    }
}

fn driver_patterns() -> Option<&'static [Regex; 3]> {
    static PATTERNS: OnceLock<Option<[Regex; 3]>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some([
                Regex::new(Error::DOCUMENT_NOT_FOUND_PATTERN).ok()?,
                Regex::new(Error::DUPLICATE_PRIMARY_KEY_PATTERN).ok()?,
                Regex::new(Error::TIMEOUT_PATTERN).ok()?,
            ])
        })
        .as_ref()
}

/// The `key` capture as a value: JSON when it parses, text otherwise.
fn captured_key(caps: &Captures<'_>) -> Value {
    let Some(text) = caps.name("key").map(|m| m.as_str().trim_matches(|c| matches!(c, '`' | ',' | ':'))) else {
        return Value::Null;
    };
    serde_json::from_str::<serde_json::Value>(text).map_or_else(|_| Value::Text(text.to_string()), Value::from_json)
}

/// Result type alias for document operations.
pub type Result<T> = std::result::Result<T, Error>;
