//! Field rules and schemas.
//!
//! A field rule is a tagged description: a [`RuleKind`] carrying the
//! constraints for that kind, plus presence, nullability, default and an
//! optional custom validator shared by every kind. The validation engine in
//! [`crate::validate`] interprets it.

use crate::config::ExtraFieldsBehavior;
use crate::value::{Record, Value};
use std::fmt;
use std::sync::Arc;

/// Custom field check. `Err` carries the failure message.
pub type FieldValidatorFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Computes a default from the record being built.
pub type DefaultFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Value used when a field is missing at construction time.
#[derive(Clone)]
pub enum DefaultValue {
    Constant(Value),
    Computed(DefaultFn),
}

impl DefaultValue {
    /// Produce the default for a record.
    pub fn resolve(&self, record: &Record) -> Value {
        match self {
            DefaultValue::Constant(v) => v.clone(),
            DefaultValue::Computed(f) => f(record),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            DefaultValue::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Whether a field must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presence {
    /// Follows the model's `enforce_missing` setting
    #[default]
    Inherit,
    /// Always required
    Required,
    /// Never required
    Optional,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringRules {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub length: Option<usize>,
    pub alphanum: bool,
    pub pattern: Option<String>,
    pub email: bool,
    pub lowercase: bool,
    pub uppercase: bool,
    pub one_of: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumberRules {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub integer: bool,
}

/// Bounds in epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateRules {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectRules {
    pub schema: Schema,
    /// Overrides the model's extra-field policy inside this object
    pub extra: Option<ExtraFieldsBehavior>,
}

#[derive(Debug, Clone, Default)]
pub struct ArrayRules {
    pub element: Option<Box<FieldRule>>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
}

/// The kind of a field and its kind-specific constraints.
#[derive(Debug, Clone)]
pub enum RuleKind {
    Any,
    String(StringRules),
    Number(NumberRules),
    Boolean,
    Date(DateRules),
    Object(ObjectRules),
    Array(ArrayRules),
}

impl RuleKind {
    /// Name used in type errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Any => "any",
            RuleKind::String(_) => "string",
            RuleKind::Number(_) => "number",
            RuleKind::Boolean => "boolean",
            RuleKind::Date(_) => "date",
            RuleKind::Object(_) => "object",
            RuleKind::Array(_) => "array",
        }
    }

    /// Does a (non-null) value have this kind's type?
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            RuleKind::Any => true,
            RuleKind::String(_) => matches!(value, Value::Text(_)),
            RuleKind::Number(_) => matches!(value, Value::Int(_) | Value::Double(_)),
            RuleKind::Boolean => matches!(value, Value::Bool(_)),
            RuleKind::Date(_) => matches!(value, Value::Timestamp(_)),
            RuleKind::Object(_) => matches!(value, Value::Object(_)),
            RuleKind::Array(_) => matches!(value, Value::Array(_)),
        }
    }
}

/// Rule for one field.
///
/// Kind-specific builder methods (`min_length`, `min`, ...) have no effect
/// on rules of another kind.
#[derive(Clone)]
pub struct FieldRule {
    kind: RuleKind,
    presence: Presence,
    allow_null: Option<bool>,
    default: Option<DefaultValue>,
    validator: Option<FieldValidatorFn>,
}

impl FieldRule {
    fn of(kind: RuleKind) -> Self {
        Self {
            kind,
            presence: Presence::Inherit,
            allow_null: None,
            default: None,
            validator: None,
        }
    }

    /// A field accepting any value.
    pub fn any() -> Self {
        Self::of(RuleKind::Any)
    }

    /// A text field.
    pub fn string() -> Self {
        Self::of(RuleKind::String(StringRules::default()))
    }

    /// A numeric field (integer or double).
    pub fn number() -> Self {
        Self::of(RuleKind::Number(NumberRules::default()))
    }

    /// A boolean field.
    pub fn boolean() -> Self {
        Self::of(RuleKind::Boolean)
    }

    /// A timestamp field.
    pub fn date() -> Self {
        Self::of(RuleKind::Date(DateRules::default()))
    }

    /// A nested object validated against `schema`.
    pub fn object(schema: Schema) -> Self {
        Self::of(RuleKind::Object(ObjectRules {
            schema,
            extra: None,
        }))
    }

    /// An array whose elements follow `element`.
    pub fn array(element: FieldRule) -> Self {
        Self::of(RuleKind::Array(ArrayRules {
            element: Some(Box::new(element)),
            ..ArrayRules::default()
        }))
    }

    /// An array with unchecked elements.
    pub fn array_of_any() -> Self {
        Self::of(RuleKind::Array(ArrayRules::default()))
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Explicit nullability, if set.
    pub fn nullability(&self) -> Option<bool> {
        self.allow_null
    }

    pub fn default_value(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }

    pub fn custom_validator(&self) -> Option<&FieldValidatorFn> {
        self.validator.as_ref()
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.presence = Presence::Required;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.presence = Presence::Optional;
        self
    }

    #[must_use]
    pub fn allow_null(mut self, allow: bool) -> Self {
        self.allow_null = Some(allow);
        self
    }

    /// Constant default applied when the field is missing.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Constant(value.into()));
        self
    }

    /// Computed default applied when the field is missing.
    #[must_use]
    pub fn default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Computed(Arc::new(f)));
        self
    }

    /// Custom validator run after the built-in checks pass.
    #[must_use]
    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    fn with_string(mut self, f: impl FnOnce(&mut StringRules)) -> Self {
        if let RuleKind::String(rules) = &mut self.kind {
            f(rules);
        }
        self
    }

    fn with_number(mut self, f: impl FnOnce(&mut NumberRules)) -> Self {
        if let RuleKind::Number(rules) = &mut self.kind {
            f(rules);
        }
        self
    }

    fn with_date(mut self, f: impl FnOnce(&mut DateRules)) -> Self {
        if let RuleKind::Date(rules) = &mut self.kind {
            f(rules);
        }
        self
    }

    fn with_array(mut self, f: impl FnOnce(&mut ArrayRules)) -> Self {
        if let RuleKind::Array(rules) = &mut self.kind {
            f(rules);
        }
        self
    }

    #[must_use]
    pub fn min_length(self, n: usize) -> Self {
        self.with_string(|r| r.min_length = Some(n))
    }

    #[must_use]
    pub fn max_length(self, n: usize) -> Self {
        self.with_string(|r| r.max_length = Some(n))
    }

    #[must_use]
    pub fn length(self, n: usize) -> Self {
        self.with_string(|r| r.length = Some(n))
    }

    #[must_use]
    pub fn alphanum(self) -> Self {
        self.with_string(|r| r.alphanum = true)
    }

    /// Require the text to match a regular expression.
    ///
    /// An invalid pattern is reported as a validation failure, not a panic.
    #[must_use]
    pub fn regex(self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.with_string(|r| r.pattern = Some(pattern))
    }

    #[must_use]
    pub fn email(self) -> Self {
        self.with_string(|r| r.email = true)
    }

    #[must_use]
    pub fn lowercase(self) -> Self {
        self.with_string(|r| r.lowercase = true)
    }

    #[must_use]
    pub fn uppercase(self) -> Self {
        self.with_string(|r| r.uppercase = true)
    }

    /// Restrict the text to a fixed set of values.
    #[must_use]
    pub fn one_of<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        self.with_string(|r| r.one_of = Some(values))
    }

    #[must_use]
    pub fn min(self, n: f64) -> Self {
        self.with_number(|r| r.min = Some(n))
    }

    #[must_use]
    pub fn max(self, n: f64) -> Self {
        self.with_number(|r| r.max = Some(n))
    }

    #[must_use]
    pub fn integer(self) -> Self {
        self.with_number(|r| r.integer = true)
    }

    #[must_use]
    pub fn min_date(self, epoch_ms: i64) -> Self {
        self.with_date(|r| r.min = Some(epoch_ms))
    }

    #[must_use]
    pub fn max_date(self, epoch_ms: i64) -> Self {
        self.with_date(|r| r.max = Some(epoch_ms))
    }

    #[must_use]
    pub fn min_items(self, n: usize) -> Self {
        self.with_array(|r| r.min_items = Some(n))
    }

    #[must_use]
    pub fn max_items(self, n: usize) -> Self {
        self.with_array(|r| r.max_items = Some(n))
    }

    /// Set the undeclared-field policy inside an object rule.
    #[must_use]
    pub fn extra_fields(mut self, behavior: ExtraFieldsBehavior) -> Self {
        if let RuleKind::Object(rules) = &mut self.kind {
            rules.extra = Some(behavior);
        }
        self
    }
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRule")
            .field("kind", &self.kind)
            .field("presence", &self.presence)
            .field("allow_null", &self.allow_null)
            .field("default", &self.default)
            .field("validator", &self.validator.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Ordered set of named field rules.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, FieldRule)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field rule.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.insert(name.into(), rule);
        self
    }

    /// Add or replace a field rule in place.
    pub fn insert(&mut self, name: String, rule: FieldRule) {
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = rule,
            None => self.fields.push((name, rule)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fill missing fields that declare a default.
    ///
    /// Computed defaults see the record as filled so far. Nested object
    /// rules are filled when the nested object is present.
    pub fn apply_defaults(&self, record: &mut Record) {
        for (name, rule) in &self.fields {
            if !record.contains_key(name) {
                if let Some(default) = &rule.default {
                    let value = default.resolve(record);
                    record.insert(name.clone(), value);
                }
            }
            if let (RuleKind::Object(nested), Some(Value::Object(inner))) =
                (&rule.kind, record.get_mut(name))
            {
                nested.schema.apply_defaults(inner);
            }
        }
    }
}
