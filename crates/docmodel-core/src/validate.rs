//! Validation engine.
//!
//! [`Validator::validate`] checks one document against its record type's
//! field rules and collects every failure into a single
//! [`ValidationError`]. [`Validator::validate_all`] walks a
//! [`DocumentGraph`] from a root, validating each attached document.
//!
//! The graph walk keeps a revisit barrier: the set of record types already
//! seen on the current path. A relation whose target type is in the barrier
//! is not descended into. Each branch gets its own copy of the barrier, so a
//! type skipped on one path is still validated on a disjoint one.

use std::collections::{HashMap, HashSet};
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::config::{ExtraFieldsBehavior, TypeEnforcement};
use crate::document::{DocId, Document, DocumentGraph, Link};
use crate::error::{Error, Result, ValidationError, ValidationErrorKind};
use crate::field::{DateRules, FieldRule, NumberRules, Presence, RuleKind, Schema, StringRules};
use crate::model::{HookEvent, HookPhase, RecordType};
use crate::registry::Registry;
use crate::value::{Record, Value};

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

/// Thread-safe regex cache for compiled patterns.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> std::result::Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// Compiled patterns are cached. An invalid pattern logs a warning and never
/// matches.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Per-call overrides of a model's strictness settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    pub enforce_missing: Option<bool>,
    pub enforce_extra: Option<ExtraFieldsBehavior>,
    pub enforce_type: Option<TypeEnforcement>,
}

impl ValidateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enforce_missing(mut self, enforce: bool) -> Self {
        self.enforce_missing = Some(enforce);
        self
    }

    #[must_use]
    pub fn enforce_extra(mut self, behavior: ExtraFieldsBehavior) -> Self {
        self.enforce_extra = Some(behavior);
        self
    }

    #[must_use]
    pub fn enforce_type(mut self, enforcement: TypeEnforcement) -> Self {
        self.enforce_type = Some(enforcement);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Strictness {
    enforce_missing: bool,
    enforce_extra: ExtraFieldsBehavior,
    enforce_type: TypeEnforcement,
}

/// Validates documents and document graphs against a registry.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'r> {
    registry: &'r Registry,
    options: ValidateOptions,
}

impl<'r> Validator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            options: ValidateOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ValidateOptions) -> Self {
        self.options = options;
        self
    }

    fn strictness(&self, record_type: &RecordType) -> Strictness {
        Strictness {
            enforce_missing: self
                .options
                .enforce_missing
                .unwrap_or(record_type.enforce_missing()),
            enforce_extra: self
                .options
                .enforce_extra
                .unwrap_or(record_type.enforce_extra()),
            enforce_type: self
                .options
                .enforce_type
                .unwrap_or(record_type.enforce_type()),
        }
    }

    /// Validate one document, ignoring its relations.
    ///
    /// Hook errors are returned as-is; rule failures come back as
    /// [`Error::Validation`].
    pub fn validate(&self, doc: &mut Document) -> Result<()> {
        let mut errors = ValidationError::new();
        self.check_document(doc, "", &mut errors)?;
        errors.into_result().map_err(Error::Validation)
    }

    /// Validate `root` and every document reachable through loaded links.
    ///
    /// With `model_to_validate`, only documents of that type are checked;
    /// the others are still traversed.
    pub fn validate_all(
        &self,
        graph: &mut DocumentGraph,
        root: DocId,
        model_to_validate: Option<&str>,
    ) -> Result<()> {
        let mut errors = ValidationError::new();
        let barrier = HashSet::new();
        let mut visited = 0usize;
        self.walk(
            graph,
            root,
            String::new(),
            &barrier,
            model_to_validate,
            &mut visited,
            &mut errors,
        )?;
        tracing::debug!(
            root = %root,
            documents = visited,
            failures = errors.len(),
            "Document graph validated"
        );
        errors.into_result().map_err(Error::Validation)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        graph: &mut DocumentGraph,
        id: DocId,
        path: String,
        barrier: &HashSet<String>,
        model_to_validate: Option<&str>,
        visited: &mut usize,
        errors: &mut ValidationError,
    ) -> Result<()> {
        let model = graph.doc(id).model().to_string();
        if model_to_validate.is_none_or(|m| m == model) {
            *visited += 1;
            self.check_document(graph.doc_mut(id), &path, errors)?;
        }

        let mut next = barrier.clone();
        next.insert(model);

        for (field, link) in graph.links(id) {
            let is_many = matches!(link, Link::Many(_));
            for (position, target) in link.targets().into_iter().enumerate() {
                let target_model = graph.doc(target).model();
                if next.contains(target_model) {
                    tracing::trace!(
                        field = %field,
                        model = target_model,
                        "Revisit barrier reached, not descending"
                    );
                    continue;
                }
                let segment = if is_many {
                    format!("{field}[{position}]")
                } else {
                    field.clone()
                };
                let child_path = join_path(&path, &segment);
                self.walk(
                    graph,
                    target,
                    child_path,
                    &next,
                    model_to_validate,
                    visited,
                    errors,
                )?;
            }
        }
        Ok(())
    }

    fn check_document(
        &self,
        doc: &mut Document,
        path: &str,
        errors: &mut ValidationError,
    ) -> Result<()> {
        let record_type = self.registry.model(doc.model())?;
        record_type.run_hooks(HookPhase::Pre, HookEvent::Validate, doc)?;

        let strictness = self.strictness(record_type);
        let mut local = ValidationError::new();
        check_record(
            record_type.schema(),
            doc.fields_mut(),
            path,
            strictness,
            strictness.enforce_extra,
            &mut local,
        );
        if let Some(validator) = record_type.validator() {
            if let Err(message) = validator(doc.fields()) {
                local.add_model_error(path, message);
            }
        }

        let passed = local.is_empty();
        errors.merge(local);
        if passed {
            record_type.run_hooks(HookPhase::Post, HookEvent::Validate, doc)?;
        }
        Ok(())
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn is_required(rule: &FieldRule, strictness: Strictness) -> bool {
    match rule.presence() {
        Presence::Required => true,
        Presence::Optional => false,
        Presence::Inherit => strictness.enforce_missing,
    }
}

fn check_record(
    schema: &Schema,
    record: &mut Record,
    path: &str,
    strictness: Strictness,
    extra: ExtraFieldsBehavior,
    errors: &mut ValidationError,
) {
    for (name, rule) in schema.iter() {
        let field_path = join_path(path, name);
        match record.get_mut(name) {
            None => {
                if is_required(rule, strictness) {
                    errors.add_required(field_path);
                }
            }
            Some(value) => check_value(rule, value, &field_path, strictness, errors),
        }
    }

    let undeclared: Vec<String> = record
        .keys()
        .filter(|k| !schema.contains(k))
        .cloned()
        .collect();
    match extra {
        ExtraFieldsBehavior::Strict => {
            for key in undeclared {
                errors.add_extra(join_path(path, &key));
            }
        }
        ExtraFieldsBehavior::Remove => {
            for key in undeclared {
                record.remove(&key);
            }
        }
        ExtraFieldsBehavior::None => {}
    }
}

fn check_value(
    rule: &FieldRule,
    value: &mut Value,
    path: &str,
    strictness: Strictness,
    errors: &mut ValidationError,
) {
    if value.is_null() {
        let allowed = rule
            .nullability()
            .unwrap_or(strictness.enforce_type != TypeEnforcement::Strict);
        if !allowed {
            errors.add_null(path);
        }
        return;
    }

    if strictness.enforce_type != TypeEnforcement::None && !rule.kind().accepts(value) {
        errors.add_type(path, rule.kind().type_name(), value);
        return;
    }

    let before = errors.len();
    match (rule.kind(), &mut *value) {
        (RuleKind::String(rules), Value::Text(text)) => check_string(rules, text, path, errors),
        (RuleKind::Number(rules), Value::Int(i)) => check_number(rules, *i as f64, path, errors),
        (RuleKind::Number(rules), Value::Double(d)) => check_number(rules, *d, path, errors),
        (RuleKind::Date(rules), Value::Timestamp(ms)) => check_date(rules, *ms, path, errors),
        (RuleKind::Object(rules), Value::Object(inner)) => check_record(
            &rules.schema,
            inner,
            path,
            strictness,
            rules.extra.unwrap_or(strictness.enforce_extra),
            errors,
        ),
        (RuleKind::Array(rules), Value::Array(items)) => {
            if let Some(min) = rules.min_items {
                if items.len() < min {
                    errors.add_min_items(path, min, items.len());
                }
            }
            if let Some(max) = rules.max_items {
                if items.len() > max {
                    errors.add_max_items(path, max, items.len());
                }
            }
            if let Some(element) = &rules.element {
                for (i, item) in items.iter_mut().enumerate() {
                    check_value(element, item, &format!("{path}[{i}]"), strictness, errors);
                }
            }
        }
        _ => {}
    }

    if errors.len() == before {
        if let Some(validator) = rule.custom_validator() {
            if let Err(message) = validator(value) {
                errors.add_custom(path, message);
            }
        }
    }
}

fn check_string(rules: &StringRules, text: &str, path: &str, errors: &mut ValidationError) {
    let len = text.chars().count();
    if let Some(min) = rules.min_length {
        if len < min {
            errors.add_min_length(path, min, len);
        }
    }
    if let Some(max) = rules.max_length {
        if len > max {
            errors.add_max_length(path, max, len);
        }
    }
    if let Some(exact) = rules.length {
        if len != exact {
            errors.add(
                path,
                ValidationErrorKind::Length,
                format!("must be exactly {exact} characters, got {len}"),
            );
        }
    }
    if rules.alphanum && !text.chars().all(char::is_alphanumeric) {
        errors.add(
            path,
            ValidationErrorKind::Alphanum,
            "must contain only letters and digits",
        );
    }
    if let Some(pattern) = &rules.pattern {
        if !matches_pattern(text, pattern) {
            errors.add_pattern(path, pattern);
        }
    }
    if rules.email && !matches_pattern(text, EMAIL_PATTERN) {
        errors.add(path, ValidationErrorKind::Email, "must be a valid email address");
    }
    if rules.lowercase && text.to_lowercase() != text {
        errors.add(path, ValidationErrorKind::Lowercase, "must be lowercase");
    }
    if rules.uppercase && text.to_uppercase() != text {
        errors.add(path, ValidationErrorKind::Uppercase, "must be uppercase");
    }
    if let Some(allowed) = &rules.one_of {
        if !allowed.iter().any(|a| a == text) {
            errors.add(
                path,
                ValidationErrorKind::Enum,
                format!("must be one of: {}", allowed.join(", ")),
            );
        }
    }
}

fn check_number(rules: &NumberRules, n: f64, path: &str, errors: &mut ValidationError) {
    if let Some(min) = rules.min {
        if n < min {
            errors.add_min(path, min, n);
        }
    }
    if let Some(max) = rules.max {
        if n > max {
            errors.add_max(path, max, n);
        }
    }
    if rules.integer && n.fract() != 0.0 {
        errors.add(path, ValidationErrorKind::Integer, "must be an integer");
    }
}

fn check_date(rules: &DateRules, ms: i64, path: &str, errors: &mut ValidationError) {
    if let Some(min) = rules.min {
        if ms < min {
            errors.add_min(path, Value::Timestamp(min), Value::Timestamp(ms));
        }
    }
    if let Some(max) = rules.max {
        if ms > max {
            errors.add_max(path, Value::Timestamp(max), Value::Timestamp(ms));
        }
    }
}
