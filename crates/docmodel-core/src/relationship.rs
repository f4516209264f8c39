//! Relation metadata between record types.

use crate::value::Value;

/// The kind of a declared relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// One-to-one, key stored on the target (`target.right_key == owner.left_key`)
    HasOne,
    /// One-to-one, key stored on the owner (`owner.left_key == target.right_key`)
    BelongsTo,
    /// One-to-many, key stored on each target
    HasMany,
    /// Many-to-many through a link table
    HasAndBelongsToMany,
}

impl RelationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RelationKind::HasOne => "hasOne",
            RelationKind::BelongsTo => "belongsTo",
            RelationKind::HasMany => "hasMany",
            RelationKind::HasAndBelongsToMany => "hasAndBelongsToMany",
        }
    }

    /// Does the owner hold a list of targets?
    pub const fn is_many(self) -> bool {
        matches!(
            self,
            RelationKind::HasMany | RelationKind::HasAndBelongsToMany
        )
    }
}

/// Link table for a many-to-many relation.
///
/// `left_column` holds the owner's `left_key` value and `right_column` the
/// target's `right_key` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTable {
    pub table: String,
    pub left_column: String,
    pub right_column: String,
}

/// Primary key column of every link table.
pub const LINK_PRIMARY_KEY: &str = "id";

impl LinkTable {
    /// Derive the link table for a relation between two tables.
    ///
    /// Table names are sorted before joining, so both directions of a
    /// relation derive the same table.
    pub fn derive(
        owner_table: &str,
        left_key: &str,
        target_table: &str,
        right_key: &str,
        link_type: Option<&str>,
    ) -> Self {
        let (first, second) = if owner_table <= target_table {
            (owner_table, target_table)
        } else {
            (target_table, owner_table)
        };
        let mut table = format!("{first}_{second}");
        if let Some(link_type) = link_type {
            table.push('_');
            table.push_str(link_type);
        }

        let mut left_column = format!("{owner_table}_{left_key}");
        let mut right_column = format!("{target_table}_{right_key}");
        if left_column == right_column {
            left_column.push_str("_left");
            right_column.push_str("_right");
        }

        Self {
            table,
            left_column,
            right_column,
        }
    }

    /// Same table seen from the other side.
    pub fn mirrored(&self) -> Self {
        Self {
            table: self.table.clone(),
            left_column: self.right_column.clone(),
            right_column: self.left_column.clone(),
        }
    }

    /// Deterministic row id for a pair, independent of which side writes it.
    ///
    /// Both keys are written with their variant tags (`[{"Int":1},{"Text":"a"}]`),
    /// so distinct pairs never share an id.
    pub fn row_id(&self, left: &Value, right: &Value) -> String {
        let (first, second) = if self.left_column <= self.right_column {
            (left, right)
        } else {
            (right, left)
        };
        serde_json::json!([first, second]).to_string()
    }
}

/// Options for a relation declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationOptions {
    /// Add the foreign-key field and its index when declaring
    pub init: bool,
    /// Suffix for the link table, to keep several many-to-many relations
    /// between the same tables apart
    pub link_type: Option<String>,
}

impl Default for RelationOptions {
    fn default() -> Self {
        Self {
            init: true,
            link_type: None,
        }
    }
}

impl RelationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn init(mut self, init: bool) -> Self {
        self.init = init;
        self
    }

    #[must_use]
    pub fn link_type(mut self, link_type: impl Into<String>) -> Self {
        self.link_type = Some(link_type.into());
        self
    }
}

/// A declared association between two record types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub kind: RelationKind,
    /// Owning model name
    pub owner: String,
    /// Target model name
    pub target: String,
    /// Field on the owner where related documents are attached
    pub field: String,
    /// Column on the owner
    pub left_key: String,
    /// Column on the target
    pub right_key: String,
    /// Link table, for many-to-many only
    pub link: Option<LinkTable>,
}

impl Relation {
    /// Model and column holding the foreign key, for non-link relations.
    pub fn foreign_key(&self) -> Option<(&str, &str)> {
        match self.kind {
            RelationKind::BelongsTo => Some((&self.owner, &self.left_key)),
            RelationKind::HasOne | RelationKind::HasMany => Some((&self.target, &self.right_key)),
            RelationKind::HasAndBelongsToMany => None,
        }
    }

    /// Display form `Owner.field`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_table_is_order_independent() {
        let a = LinkTable::derive("posts", "id", "tags", "id", None);
        let b = LinkTable::derive("tags", "id", "posts", "id", None);
        assert_eq!(a.table, "posts_tags");
        assert_eq!(b.table, "posts_tags");
        assert_eq!(a.left_column, "posts_id");
        assert_eq!(a.right_column, "tags_id");
        assert_eq!(a.mirrored(), b);
    }

    #[test]
    fn link_type_suffix_and_self_relation() {
        let typed = LinkTable::derive("posts", "id", "tags", "id", Some("featured"));
        assert_eq!(typed.table, "posts_tags_featured");

        let friends = LinkTable::derive("users", "id", "users", "id", None);
        assert_eq!(friends.table, "users_users");
        assert_eq!(friends.left_column, "users_id_left");
        assert_eq!(friends.right_column, "users_id_right");
    }

    #[test]
    fn row_id_matches_from_both_sides() {
        let link = LinkTable::derive("posts", "id", "tags", "id", None);
        let mirrored = link.mirrored();
        let post = Value::Int(1);
        let tag = Value::Text("rust".into());
        assert_eq!(link.row_id(&post, &tag), mirrored.row_id(&tag, &post));
        assert_eq!(link.row_id(&post, &tag), r#"[{"Int":1},{"Text":"rust"}]"#);
    }

    #[test]
    fn row_ids_do_not_collide_on_separators_or_types() {
        let link = LinkTable::derive("posts", "id", "tags", "id", None);
        let text = |s: &str| Value::Text(s.to_string());
        assert_ne!(
            link.row_id(&text("a"), &text("b_c")),
            link.row_id(&text("a_b"), &text("c"))
        );
        assert_ne!(
            link.row_id(&Value::Int(1), &Value::Int(7)),
            link.row_id(&text("1"), &Value::Int(7))
        );
        assert_ne!(
            link.row_id(&Value::Int(1), &Value::Int(7)),
            link.row_id(&Value::Timestamp(1), &Value::Int(7))
        );
    }

    #[test]
    fn foreign_key_side_follows_kind() {
        let rel = Relation {
            kind: RelationKind::BelongsTo,
            owner: "Post".into(),
            target: "User".into(),
            field: "author".into(),
            left_key: "authorId".into(),
            right_key: "id".into(),
            link: None,
        };
        assert_eq!(rel.foreign_key(), Some(("Post", "authorId")));

        let rel = Relation {
            kind: RelationKind::HasMany,
            owner: "Post".into(),
            target: "Comment".into(),
            field: "comments".into(),
            left_key: "id".into(),
            right_key: "postId".into(),
            link: None,
        };
        assert_eq!(rel.foreign_key(), Some(("Comment", "postId")));
        assert_eq!(rel.qualified_name(), "Post.comments");
    }
}
