//! Record types: the per-model half of the schema registry.
//!
//! A [`RecordType`] binds a model name to a table, a primary key, its field
//! rules, lifecycle hooks, event listeners, computed accessors, static
//! functions and index requests. Record types are created and configured
//! through [`Registry`](crate::Registry) during setup and are read-only once
//! the registry is shared.

use crate::config::{ExtraFieldsBehavior, OdmConfig, TypeEnforcement};
use crate::document::Document;
use crate::driver::IndexSpec;
use crate::error::{Error, Result};
use crate::field::{FieldRule, Schema};
use crate::value::{Record, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle points hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Save,
    Delete,
    Validate,
    /// Document construction, user-built or hydrated (post only)
    Init,
    /// Document hydrated from storage (post only)
    Retrieve,
}

impl HookEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            HookEvent::Save => "save",
            HookEvent::Delete => "delete",
            HookEvent::Validate => "validate",
            HookEvent::Init => "init",
            HookEvent::Retrieve => "retrieve",
        }
    }

    /// Can a pre-hook be registered for this event?
    pub const fn allows_pre(self) -> bool {
        matches!(
            self,
            HookEvent::Save | HookEvent::Delete | HookEvent::Validate
        )
    }
}

/// Whether a hook runs before or after its lifecycle point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Pre,
    Post,
}

/// Events emitted to listeners after hooks have run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentEvent {
    /// A write for the document is about to be issued
    Saving,
    /// The document was written
    Saved,
    /// The document was deleted
    Deleted,
}

pub type HookFn = Arc<dyn Fn(&mut Document) -> Result<()> + Send + Sync>;
pub type ListenerFn = Arc<dyn Fn(DocumentEvent, &Document) + Send + Sync>;
pub type ComputedFn = Arc<dyn Fn(&Document) -> Value + Send + Sync>;
pub type StaticFn = Arc<dyn Fn(&RecordType) -> Value + Send + Sync>;
pub type ModelValidatorFn = Arc<dyn Fn(&Record) -> std::result::Result<(), String> + Send + Sync>;

/// Per-model overrides of [`OdmConfig`].
#[derive(Clone, Default)]
pub struct ModelOptions {
    pub table: Option<String>,
    pub primary_key: Option<String>,
    pub enforce_missing: Option<bool>,
    pub enforce_extra: Option<ExtraFieldsBehavior>,
    pub enforce_type: Option<TypeEnforcement>,
    pub validator: Option<ModelValidatorFn>,
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn primary_key(mut self, pk: impl Into<String>) -> Self {
        self.primary_key = Some(pk.into());
        self
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

    /// Whole-record check run after field rules.
    #[must_use]
    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ModelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelOptions")
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("enforce_missing", &self.enforce_missing)
            .field("enforce_extra", &self.enforce_extra)
            .field("enforce_type", &self.enforce_type)
            .finish_non_exhaustive()
    }
}

/// A declared document schema bound to a storage table.
pub struct RecordType {
    name: String,
    table: String,
    primary_key: String,
    schema: Schema,
    enforce_missing: bool,
    enforce_extra: ExtraFieldsBehavior,
    enforce_type: TypeEnforcement,
    validator: Option<ModelValidatorFn>,
    relation_fields: Vec<String>,
    indexes: Vec<IndexSpec>,
    hooks: HashMap<(HookPhase, HookEvent), Vec<HookFn>>,
    listeners: Vec<(DocumentEvent, ListenerFn)>,
    computed: HashMap<String, ComputedFn>,
    statics: HashMap<String, StaticFn>,
}

impl RecordType {
    pub(crate) fn new(
        name: String,
        mut schema: Schema,
        options: ModelOptions,
        config: &OdmConfig,
    ) -> Self {
        let primary_key = options
            .primary_key
            .unwrap_or_else(|| config.primary_key.clone());
        if !schema.contains(&primary_key) {
            schema.insert(primary_key.clone(), FieldRule::any().optional());
        }
        Self {
            table: options.table.unwrap_or_else(|| name.clone()),
            name,
            primary_key,
            schema,
            enforce_missing: options.enforce_missing.unwrap_or(config.enforce_missing),
            enforce_extra: options.enforce_extra.unwrap_or(config.enforce_extra),
            enforce_type: options.enforce_type.unwrap_or(config.enforce_type),
            validator: options.validator,
            relation_fields: Vec::new(),
            indexes: Vec::new(),
            hooks: HashMap::new(),
            listeners: Vec::new(),
            computed: HashMap::new(),
            statics: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.schema.get(name)
    }

    pub fn enforce_missing(&self) -> bool {
        self.enforce_missing
    }

    pub fn enforce_extra(&self) -> ExtraFieldsBehavior {
        self.enforce_extra
    }

    pub fn enforce_type(&self) -> TypeEnforcement {
        self.enforce_type
    }

    pub fn validator(&self) -> Option<&ModelValidatorFn> {
        self.validator.as_ref()
    }

    /// Relation field names owned by this model, in declaration order.
    pub fn relation_fields(&self) -> &[String] {
        &self.relation_fields
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// The document's primary key, when set and non-null.
    pub fn key_of<'d>(&self, doc: &'d Document) -> Option<&'d Value> {
        doc.get(&self.primary_key).filter(|v| !v.is_null())
    }

    /// Is `name` taken by a field, relation or computed accessor?
    pub fn is_name_taken(&self, name: &str) -> bool {
        self.schema.contains(name)
            || self.relation_fields.iter().any(|f| f == name)
            || self.computed.contains_key(name)
    }

    /// Add a field rule after model creation.
    pub fn add_field(&mut self, name: impl Into<String>, rule: FieldRule) -> Result<()> {
        let name = name.into();
        if self.is_name_taken(&name) {
            return Err(Error::config(
                Some(&self.name),
                format!("field '{name}' is already declared"),
            ));
        }
        self.schema.insert(name, rule);
        Ok(())
    }

    pub(crate) fn ensure_field(&mut self, name: &str, rule: FieldRule) {
        if !self.schema.contains(name) {
            self.schema.insert(name.to_string(), rule);
        }
    }

    pub(crate) fn push_relation_field(&mut self, field: String) {
        self.relation_fields.push(field);
    }

    /// Register a computed accessor resolved with [`RecordType::compute`].
    pub fn define<F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&Document) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        if self.is_name_taken(&name) {
            return Err(Error::config(
                Some(&self.name),
                format!("cannot define '{name}': name is already in use"),
            ));
        }
        self.computed.insert(name, Arc::new(f));
        Ok(())
    }

    /// Evaluate a computed accessor for a document.
    pub fn compute(&self, name: &str, doc: &Document) -> Option<Value> {
        self.computed.get(name).map(|f| f(doc))
    }

    /// Register a model-level function.
    pub fn define_static<F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&RecordType) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        if self.statics.contains_key(&name) {
            return Err(Error::config(
                Some(&self.name),
                format!("static '{name}' is already defined"),
            ));
        }
        self.statics.insert(name, Arc::new(f));
        Ok(())
    }

    /// Call a model-level function.
    pub fn call_static(&self, name: &str) -> Option<Value> {
        self.statics.get(name).map(|f| f(self))
    }

    /// Request a secondary index. Requests with an existing name are ignored.
    pub fn ensure_index(&mut self, index: IndexSpec) {
        if self.indexes.iter().any(|i| i.name == index.name) {
            return;
        }
        tracing::debug!(model = %self.name, index = %index.name, "Index requested");
        self.indexes.push(index);
    }

    /// Register a hook run before `event`.
    pub fn pre<F>(&mut self, event: HookEvent, hook: F) -> Result<()>
    where
        F: Fn(&mut Document) -> Result<()> + Send + Sync + 'static,
    {
        if !event.allows_pre() {
            return Err(Error::config(
                Some(&self.name),
                format!("'{}' only supports post hooks", event.as_str()),
            ));
        }
        self.hooks
            .entry((HookPhase::Pre, event))
            .or_default()
            .push(Arc::new(hook));
        Ok(())
    }

    /// Register a hook run after `event`.
    pub fn post<F>(&mut self, event: HookEvent, hook: F)
    where
        F: Fn(&mut Document) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .entry((HookPhase::Post, event))
            .or_default()
            .push(Arc::new(hook));
    }

    /// Register an event listener.
    pub fn on<F>(&mut self, event: DocumentEvent, listener: F)
    where
        F: Fn(DocumentEvent, &Document) + Send + Sync + 'static,
    {
        self.listeners.push((event, Arc::new(listener)));
    }

    /// Run the hooks for a lifecycle point, in registration order.
    ///
    /// The first failing hook aborts the rest.
    pub fn run_hooks(&self, phase: HookPhase, event: HookEvent, doc: &mut Document) -> Result<()> {
        if let Some(hooks) = self.hooks.get(&(phase, event)) {
            tracing::trace!(
                model = %self.name,
                event = event.as_str(),
                count = hooks.len(),
                "Running hooks"
            );
            for hook in hooks {
                hook(doc)?;
            }
        }
        Ok(())
    }

    /// Notify listeners registered for `event`.
    pub fn emit(&self, event: DocumentEvent, doc: &Document) {
        for (registered, listener) in &self.listeners {
            if *registered == event {
                listener(event, doc);
            }
        }
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("schema", &self.schema)
            .field("relation_fields", &self.relation_fields)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use std::sync::Mutex;

    fn post_type() -> RecordType {
        RecordType::new(
            "Post".to_string(),
            Schema::new().field("title", FieldRule::string()),
            ModelOptions::new().table("posts"),
            &OdmConfig::default(),
        )
    }

    #[test]
    fn primary_key_is_added_to_schema() {
        let rt = post_type();
        assert_eq!(rt.table_name(), "posts");
        assert_eq!(rt.primary_key(), "id");
        assert!(rt.field("id").is_some());
    }

    #[test]
    fn define_rejects_field_collision() {
        let mut rt = post_type();
        assert!(rt.define("title", |_| Value::Null).is_err());
        rt.define("shout", |doc| {
            doc.get("title")
                .and_then(Value::as_str)
                .map_or(Value::Null, |t| Value::from(t.to_uppercase()))
        })
        .expect("define");
        let doc = Document::new("Post", record! { "title" => "hi" });
        assert_eq!(rt.compute("shout", &doc), Some(Value::from("HI")));
        assert_eq!(rt.compute("missing", &doc), None);
    }

    #[test]
    fn statics_are_callable() {
        let mut rt = post_type();
        rt.define_static("table", |rt| Value::from(rt.table_name()))
            .expect("define static");
        assert_eq!(rt.call_static("table"), Some(Value::from("posts")));
        assert!(rt.define_static("table", |_| Value::Null).is_err());
    }

    #[test]
    fn pre_hooks_rejected_for_post_only_events() {
        let mut rt = post_type();
        assert!(rt.pre(HookEvent::Init, |_| Ok(())).is_err());
        assert!(rt.pre(HookEvent::Save, |_| Ok(())).is_ok());
    }

    #[test]
    fn hooks_run_in_order_and_stop_on_error() {
        let mut rt = post_type();
        rt.pre(HookEvent::Save, |doc| {
            doc.set("stamp", "first");
            Ok(())
        })
        .expect("hook");
        rt.pre(HookEvent::Save, |_| Err(Error::Custom("stop".into())))
            .expect("hook");
        rt.pre(HookEvent::Save, |doc| {
            doc.set("stamp", "never");
            Ok(())
        })
        .expect("hook");

        let mut doc = Document::new("Post", Record::new());
        let err = rt
            .run_hooks(HookPhase::Pre, HookEvent::Save, &mut doc)
            .unwrap_err();
        assert_eq!(err.to_string(), "stop");
        assert_eq!(doc.get("stamp"), Some(&Value::from("first")));
    }

    #[test]
    fn listeners_filter_by_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut rt = post_type();
        let sink = Arc::clone(&seen);
        rt.on(DocumentEvent::Saved, move |event, _| {
            sink.lock().expect("lock").push(event);
        });
        let doc = Document::new("Post", Record::new());
        rt.emit(DocumentEvent::Saving, &doc);
        rt.emit(DocumentEvent::Saved, &doc);
        assert_eq!(*seen.lock().expect("lock"), vec![DocumentEvent::Saved]);
    }

    #[test]
    fn ensure_index_dedupes_by_name() {
        let mut rt = post_type();
        rt.ensure_index(IndexSpec::new("title"));
        rt.ensure_index(IndexSpec::new("title"));
        assert_eq!(rt.indexes().len(), 1);
    }
}
