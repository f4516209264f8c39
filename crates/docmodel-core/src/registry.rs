//! Schema and relation registry.
//!
//! The registry owns every [`RecordType`] and every declared [`Relation`].
//! It is built single-threaded through `&mut Registry` during setup and then
//! shared read-only (typically as `Arc<Registry>`) by sessions.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = Registry::new(OdmConfig::default());
//! registry.create_model("Post", Schema::new().field("title", FieldRule::string()), ModelOptions::new())?;
//! registry.create_model("Comment", Schema::new().field("text", FieldRule::string()), ModelOptions::new())?;
//! registry.has_many("Post", "Comment", "comments", "id", "postId")?;
//! registry.belongs_to("Comment", "Post", "post", "postId", "id")?;
//! ```

use crate::config::{OdmConfig, ValidatePolicy};
use crate::document::Document;
use crate::driver::IndexSpec;
use crate::error::{Error, Result, UnknownRelationError};
use crate::field::{FieldRule, Schema};
use crate::model::{HookEvent, HookPhase, ModelOptions, RecordType};
use crate::relationship::{LINK_PRIMARY_KEY, LinkTable, Relation, RelationKind, RelationOptions};
use crate::validate::Validator;
use crate::value::Record;
use std::collections::HashMap;

/// Names that cannot be used as relation key columns.
pub const RESERVED_NAMES: &[&str] = &[
    "save",
    "saveAll",
    "delete",
    "deleteAll",
    "purge",
    "merge",
    "validate",
    "validateAll",
    "getModel",
    "getOldValue",
    "setSaved",
    "isSaved",
    "addRelation",
    "removeRelation",
    "on",
    "emit",
    "__model__",
];

/// A secondary index to create on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub table: String,
    pub primary_key: String,
    pub index: IndexSpec,
}

/// Registry of record types and the relations between them.
#[derive(Debug, Default)]
pub struct Registry {
    config: OdmConfig,
    models: Vec<RecordType>,
    by_name: HashMap<String, usize>,
    relations: Vec<Relation>,
    relation_index: HashMap<(String, String), usize>,
    link_indexes: Vec<IndexRequest>,
}

impl Registry {
    pub fn new(config: OdmConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &OdmConfig {
        &self.config
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Declare a record type.
    pub fn create_model(
        &mut self,
        name: impl Into<String>,
        schema: Schema,
        options: ModelOptions,
    ) -> Result<&mut RecordType> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::config(None, "model name must not be empty"));
        }
        if self.by_name.contains_key(&name) {
            return Err(Error::config(
                Some(&name),
                "a model with this name already exists",
            ));
        }
        let record_type = RecordType::new(name.clone(), schema, options, &self.config);
        if let Some(existing) = self
            .models
            .iter()
            .find(|m| m.table_name() == record_type.table_name())
        {
            return Err(Error::config(
                Some(&name),
                format!(
                    "table '{}' is already bound to model {}",
                    record_type.table_name(),
                    existing.name()
                ),
            ));
        }

        tracing::debug!(
            model = %name,
            table = record_type.table_name(),
            primary_key = record_type.primary_key(),
            fields = record_type.schema().len(),
            "Model declared"
        );

        let index = self.models.len();
        self.models.push(record_type);
        self.by_name.insert(name, index);
        Ok(&mut self.models[index])
    }

    fn model_index(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::config(Some(name), "unknown model"))
    }

    pub fn model(&self, name: &str) -> Result<&RecordType> {
        let index = self.model_index(name)?;
        Ok(&self.models[index])
    }

    /// Mutable access for hook, listener and index registration.
    pub fn model_mut(&mut self, name: &str) -> Result<&mut RecordType> {
        let index = self.model_index(name)?;
        Ok(&mut self.models[index])
    }

    pub fn models(&self) -> impl Iterator<Item = &RecordType> {
        self.models.iter()
    }

    // ========================================================================
    // Relations
    // ========================================================================

    /// `owner` has one `target`; the key lives on `target.right_key`.
    pub fn has_one(
        &mut self,
        owner: &str,
        target: &str,
        field: &str,
        left_key: &str,
        right_key: &str,
    ) -> Result<&Relation> {
        self.declare(
            RelationKind::HasOne,
            owner,
            target,
            field,
            left_key,
            right_key,
            RelationOptions::default(),
        )
    }

    /// `owner` belongs to `target`; the key lives on `owner.left_key`.
    pub fn belongs_to(
        &mut self,
        owner: &str,
        target: &str,
        field: &str,
        left_key: &str,
        right_key: &str,
    ) -> Result<&Relation> {
        self.declare(
            RelationKind::BelongsTo,
            owner,
            target,
            field,
            left_key,
            right_key,
            RelationOptions::default(),
        )
    }

    /// `owner` has many `target`s; the key lives on each `target.right_key`.
    pub fn has_many(
        &mut self,
        owner: &str,
        target: &str,
        field: &str,
        left_key: &str,
        right_key: &str,
    ) -> Result<&Relation> {
        self.declare(
            RelationKind::HasMany,
            owner,
            target,
            field,
            left_key,
            right_key,
            RelationOptions::default(),
        )
    }

    /// Many-to-many through a derived link table.
    pub fn has_and_belongs_to_many(
        &mut self,
        owner: &str,
        target: &str,
        field: &str,
        left_key: &str,
        right_key: &str,
    ) -> Result<&Relation> {
        self.declare(
            RelationKind::HasAndBelongsToMany,
            owner,
            target,
            field,
            left_key,
            right_key,
            RelationOptions::default(),
        )
    }

    /// Record a relation.
    ///
    /// With `options.init` the key field is added to the key-holding model's
    /// schema (optional, nullable) and indexes are requested for the key
    /// columns.
    #[allow(clippy::too_many_arguments)]
    pub fn declare(
        &mut self,
        kind: RelationKind,
        owner: &str,
        target: &str,
        field: &str,
        left_key: &str,
        right_key: &str,
        options: RelationOptions,
    ) -> Result<&Relation> {
        let owner_index = self.model_index(owner)?;
        let target_index = self.model_index(target)?;

        if field.is_empty() {
            return Err(Error::config(Some(owner), "relation field must not be empty"));
        }
        if self.models[owner_index].is_name_taken(field) {
            return Err(Error::config(
                Some(owner),
                format!("relation field '{field}' collides with an existing field or relation"),
            ));
        }
        for key in [left_key, right_key] {
            if key.is_empty() {
                return Err(Error::config(
                    Some(owner),
                    format!("relation '{field}' has an empty key"),
                ));
            }
            if RESERVED_NAMES.contains(&key) {
                return Err(Error::config(
                    Some(owner),
                    format!("relation '{field}' uses reserved name '{key}' as a key"),
                ));
            }
            if key == field {
                return Err(Error::config(
                    Some(owner),
                    format!("relation '{field}' cannot use its own field name as a key"),
                ));
            }
        }

        let link = if kind == RelationKind::HasAndBelongsToMany {
            let link = LinkTable::derive(
                self.models[owner_index].table_name(),
                left_key,
                self.models[target_index].table_name(),
                right_key,
                options.link_type.as_deref(),
            );
            let mirrored = link.mirrored();
            let clash = self.relations.iter().find(|r| {
                r.link.as_ref().is_some_and(|l| l.table == link.table)
                    && !(r.owner == target && r.target == owner && r.link.as_ref() == Some(&mirrored))
            });
            if let Some(existing) = clash {
                return Err(Error::config(
                    Some(owner),
                    format!(
                        "link table '{}' is already used by {}; set a link_type",
                        link.table,
                        existing.qualified_name()
                    ),
                ));
            }
            Some(link)
        } else {
            None
        };

        if options.init {
            self.init_keys(kind, owner_index, target_index, left_key, right_key, link.as_ref());
        }

        let relation = Relation {
            kind,
            owner: owner.to_string(),
            target: target.to_string(),
            field: field.to_string(),
            left_key: left_key.to_string(),
            right_key: right_key.to_string(),
            link,
        };

        tracing::debug!(
            relation = %relation.qualified_name(),
            kind = kind.as_str(),
            target = target,
            left_key = left_key,
            right_key = right_key,
            "Relation declared"
        );

        self.models[owner_index].push_relation_field(field.to_string());
        let index = self.relations.len();
        self.relations.push(relation);
        self.relation_index
            .insert((owner.to_string(), field.to_string()), index);
        Ok(&self.relations[index])
    }

    fn init_keys(
        &mut self,
        kind: RelationKind,
        owner_index: usize,
        target_index: usize,
        left_key: &str,
        right_key: &str,
        link: Option<&LinkTable>,
    ) {
        let fk_rule = || FieldRule::any().optional().allow_null(true);
        match kind {
            RelationKind::BelongsTo => {
                index_key(&mut self.models[owner_index], left_key, Some(fk_rule()));
                index_key(&mut self.models[target_index], right_key, None);
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                index_key(&mut self.models[target_index], right_key, Some(fk_rule()));
                index_key(&mut self.models[owner_index], left_key, None);
            }
            RelationKind::HasAndBelongsToMany => {
                if let Some(link) = link {
                    for column in [&link.left_column, &link.right_column] {
                        let request = IndexRequest {
                            table: link.table.clone(),
                            primary_key: LINK_PRIMARY_KEY.to_string(),
                            index: IndexSpec::new(column.clone()),
                        };
                        if !self.link_indexes.contains(&request) {
                            self.link_indexes.push(request);
                        }
                    }
                }
            }
        }
    }

    /// Look up the relation attached on `model.field`.
    pub fn resolve(&self, model: &str, field: &str) -> Result<&Relation> {
        self.relation(model, field).ok_or_else(|| {
            Error::UnknownRelation(UnknownRelationError {
                model: model.to_string(),
                field: field.to_string(),
            })
        })
    }

    pub fn relation(&self, model: &str, field: &str) -> Option<&Relation> {
        self.relation_index
            .get(&(model.to_string(), field.to_string()))
            .map(|i| &self.relations[*i])
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Relations owned by `model`, in declaration order.
    pub fn relations_of<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a Relation> {
        self.relations.iter().filter(move |r| r.owner == model)
    }

    /// Relations whose target is `model`, in declaration order.
    pub fn relations_targeting<'a>(
        &'a self,
        model: &'a str,
    ) -> impl Iterator<Item = &'a Relation> {
        self.relations.iter().filter(move |r| r.target == model)
    }

    /// The declared inverse of a relation, if any.
    ///
    /// `belongsTo` pairs with `hasOne`/`hasMany` over the same key columns;
    /// many-to-many pairs with the relation sharing its link table.
    pub fn reciprocal_of(&self, relation: &Relation) -> Option<&Relation> {
        let mirrored_link = relation.link.as_ref().map(LinkTable::mirrored);
        self.relations.iter().find(|r| {
            r.owner == relation.target
                && r.target == relation.owner
                && !(r.owner == relation.owner && r.field == relation.field)
                && match (relation.kind, r.kind) {
                    (RelationKind::BelongsTo, RelationKind::HasOne | RelationKind::HasMany)
                    | (RelationKind::HasOne | RelationKind::HasMany, RelationKind::BelongsTo) => {
                        r.left_key == relation.right_key && r.right_key == relation.left_key
                    }
                    (RelationKind::HasAndBelongsToMany, RelationKind::HasAndBelongsToMany) => {
                        r.link.as_ref() == mirrored_link.as_ref()
                    }
                    _ => false,
                }
        })
    }

    /// Every index requested by models and link tables.
    pub fn index_requests(&self) -> Vec<IndexRequest> {
        let mut requests: Vec<IndexRequest> = self
            .models
            .iter()
            .flat_map(|m| {
                m.indexes().iter().map(|index| IndexRequest {
                    table: m.table_name().to_string(),
                    primary_key: m.primary_key().to_string(),
                    index: index.clone(),
                })
            })
            .collect();
        requests.extend(self.link_indexes.iter().cloned());
        requests
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Build an unsaved document.
    ///
    /// Applies field defaults, runs post-`init` hooks and validates when the
    /// policy is [`ValidatePolicy::OnCreate`].
    pub fn new_document(&self, model: &str, data: Record) -> Result<Document> {
        let record_type = self.model(model)?;
        let mut fields = data;
        record_type.schema().apply_defaults(&mut fields);
        let mut doc = Document::new(record_type.name(), fields);
        record_type.run_hooks(HookPhase::Post, HookEvent::Init, &mut doc)?;
        if self.config.validate == ValidatePolicy::OnCreate {
            Validator::new(self).validate(&mut doc)?;
        }
        Ok(doc)
    }

    /// Build a saved document from a stored record.
    ///
    /// Runs post-`init` then post-`retrieve` hooks.
    pub fn hydrate(&self, model: &str, record: Record) -> Result<Document> {
        let record_type = self.model(model)?;
        let mut doc = Document::stored(record_type.name(), record);
        record_type.run_hooks(HookPhase::Post, HookEvent::Init, &mut doc)?;
        record_type.run_hooks(HookPhase::Post, HookEvent::Retrieve, &mut doc)?;
        Ok(doc)
    }
}

fn index_key(record_type: &mut RecordType, key: &str, field_rule: Option<FieldRule>) {
    if let Some(rule) = field_rule {
        record_type.ensure_field(key, rule);
    }
    if key != record_type.primary_key() {
        record_type.ensure_index(IndexSpec::new(key));
    }
}
