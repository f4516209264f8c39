//! Join planning.
//!
//! [`JoinPlanner::plan`] turns a model and a [`JoinShape`] into a
//! [`QueryPlan`]: an ordered list of fetch steps where every step comes
//! after the step producing its owners.

use crate::shape::{JoinNode, JoinShape};
use docmodel_core::{Error, Filter, JoinError, LinkTable, Registry, Relation, RelationKind, Result};
use std::collections::HashSet;
use std::fmt;

/// Index of a step within its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub usize);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a step reads its records.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchKind {
    /// `belongsTo`: targets whose `right_key` is one of the owners' `left_key`s
    Lookup,
    /// `hasOne`/`hasMany`: targets whose `right_key` is one of the owners' `left_key`s
    Scan,
    /// Many-to-many, first half: link rows whose left column matches the owners
    LinkRows { link: LinkTable },
    /// Many-to-many, second half: targets named by the link rows of `rows`
    LinkedTargets { link: LinkTable, rows: StepId },
}

impl FetchKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FetchKind::Lookup => "lookup",
            FetchKind::Scan => "scan",
            FetchKind::LinkRows { .. } => "link-rows",
            FetchKind::LinkedTargets { .. } => "linked-targets",
        }
    }
}

/// One read in a join plan.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchStep {
    pub id: StepId,
    /// Step producing the owners; `None` means the root documents
    pub parent: Option<StepId>,
    pub relation: Relation,
    pub kind: FetchKind,
    /// Extra predicate on target records
    pub filter: Option<Filter>,
    /// Dotted relation path from the root (`comments.author`)
    pub path: String,
}

impl FetchStep {
    /// Does this step produce documents that later steps can own?
    pub fn yields_documents(&self) -> bool {
        !matches!(self.kind, FetchKind::LinkRows { .. })
    }
}

/// Ordered fetch steps for one joined read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    model: String,
    steps: Vec<FetchStep>,
}

impl QueryPlan {
    /// Root model.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn steps(&self) -> &[FetchStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// One line per step, for logs and tests.
    pub fn describe(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| {
                let parent = s.parent.map_or_else(|| "root".to_string(), |p| format!("#{p}"));
                format!("#{} {} {} <- {}", s.id, s.kind.as_str(), s.path, parent)
            })
            .collect()
    }
}

/// The root model, then one indented line per step.
impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model)?;
        for line in self.describe() {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

/// Plans joined reads against a registry.
#[derive(Debug, Clone, Copy)]
pub struct JoinPlanner<'r> {
    registry: &'r Registry,
}

impl<'r> JoinPlanner<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Plan the reads for `shape` rooted at `model`.
    ///
    /// Fails with `UnknownRelation` for an undeclared field, and with
    /// `JoinError` when one path repeats the same `(model, field)` pair.
    pub fn plan(&self, model: &str, shape: &JoinShape) -> Result<QueryPlan> {
        self.registry.model(model)?;
        let mut steps = Vec::new();
        let mut pairs = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(model.to_string());
        self.plan_level(model, shape, None, "", &mut pairs, &visited, &mut steps)?;

        let plan = QueryPlan {
            model: model.to_string(),
            steps,
        };
        tracing::debug!(model = model, steps = plan.len(), "Join planned");
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_level(
        &self,
        model: &str,
        shape: &JoinShape,
        parent: Option<StepId>,
        prefix: &str,
        pairs: &mut Vec<(String, String)>,
        visited: &HashSet<String>,
        steps: &mut Vec<FetchStep>,
    ) -> Result<()> {
        let mut expanded = HashSet::new();
        if shape.is_all() {
            let relations: Vec<Relation> = self.registry.relations_of(model).cloned().collect();
            for relation in relations {
                let explicit = shape.get(&relation.field);
                if visited.contains(&relation.target) {
                    if explicit.is_none() {
                        tracing::debug!(
                            model = model,
                            field = %relation.field,
                            target = %relation.target,
                            "Not expanding relation back to a model on the path"
                        );
                    }
                    continue;
                }
                // an explicit request keeps its filter and nested fields on top of the expansion
                let node = match explicit {
                    Some(node) => JoinNode {
                        filter: node.filter.clone(),
                        nested: node.nested.clone().expand_all(),
                    },
                    None => JoinNode::new().nested(JoinShape::all()),
                };
                expanded.insert(relation.field.clone());
                self.plan_relation(relation, &node, parent, prefix, pairs, visited, steps)?;
            }
        }

        for (field, node) in shape.relations() {
            if expanded.contains(field) {
                continue;
            }
            let relation = self.registry.resolve(model, field)?.clone();
            if pairs.iter().any(|(m, f)| m == model && f == field) {
                let path = pairs
                    .iter()
                    .map(|(m, f)| format!("{m}.{f}"))
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(Error::Join(JoinError {
                    model: model.to_string(),
                    field: Some(field.to_string()),
                    step: None,
                    message: format!("relation repeats along path {path} -> {model}.{field}"),
                    source: None,
                }));
            }
            self.plan_relation(relation, node, parent, prefix, pairs, visited, steps)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_relation(
        &self,
        relation: Relation,
        node: &JoinNode,
        parent: Option<StepId>,
        prefix: &str,
        pairs: &mut Vec<(String, String)>,
        visited: &HashSet<String>,
        steps: &mut Vec<FetchStep>,
    ) -> Result<()> {
        let path = if prefix.is_empty() {
            relation.field.clone()
        } else {
            format!("{prefix}.{}", relation.field)
        };

        let owner_step = match (&relation.kind, &relation.link) {
            (RelationKind::HasAndBelongsToMany, Some(link)) => {
                let rows = StepId(steps.len());
                steps.push(FetchStep {
                    id: rows,
                    parent,
                    relation: relation.clone(),
                    kind: FetchKind::LinkRows { link: link.clone() },
                    filter: None,
                    path: path.clone(),
                });
                let targets = StepId(steps.len());
                steps.push(FetchStep {
                    id: targets,
                    parent,
                    relation: relation.clone(),
                    kind: FetchKind::LinkedTargets {
                        link: link.clone(),
                        rows,
                    },
                    filter: node.filter.clone(),
                    path: path.clone(),
                });
                targets
            }
            (RelationKind::HasAndBelongsToMany, None) => {
                return Err(Error::Join(JoinError {
                    model: relation.owner.clone(),
                    field: Some(relation.field.clone()),
                    step: None,
                    message: "many-to-many relation has no link table".to_string(),
                    source: None,
                }));
            }
            (kind, _) => {
                let id = StepId(steps.len());
                let fetch = if *kind == RelationKind::BelongsTo {
                    FetchKind::Lookup
                } else {
                    FetchKind::Scan
                };
                steps.push(FetchStep {
                    id,
                    parent,
                    relation: relation.clone(),
                    kind: fetch,
                    filter: node.filter.clone(),
                    path: path.clone(),
                });
                id
            }
        };

        if node.nested.is_empty() {
            return Ok(());
        }
        let mut next_visited = visited.clone();
        next_visited.insert(relation.target.clone());
        pairs.push((relation.owner.clone(), relation.field.clone()));
        let result = self.plan_level(
            &relation.target,
            &node.nested,
            Some(owner_step),
            &path,
            pairs,
            &next_visited,
            steps,
        );
        pairs.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::{FieldRule, ModelOptions, OdmConfig, Schema};

    fn blog() -> Registry {
        let mut registry = Registry::new(OdmConfig::default());
        for (name, table) in [
            ("Post", "posts"),
            ("Comment", "comments"),
            ("User", "users"),
            ("Tag", "tags"),
        ] {
            registry
                .create_model(
                    name,
                    Schema::new().field("name", FieldRule::string()),
                    ModelOptions::new().table(table),
                )
                .expect("model");
        }
        registry
            .belongs_to("Post", "User", "author", "authorId", "id")
            .expect("author");
        registry
            .has_many("Post", "Comment", "comments", "id", "postId")
            .expect("comments");
        registry
            .belongs_to("Comment", "Post", "post", "postId", "id")
            .expect("post");
        registry
            .belongs_to("Comment", "User", "author", "authorId", "id")
            .expect("comment author");
        registry
            .has_and_belongs_to_many("Post", "Tag", "tags", "id", "id")
            .expect("tags");
        registry
    }

    #[test]
    fn parents_precede_children() {
        let registry = blog();
        let shape = JoinShape::new()
            .path("comments.author")
            .include("tags");
        let plan = JoinPlanner::new(&registry)
            .plan("Post", &shape)
            .expect("plan");
        assert_eq!(
            plan.describe(),
            vec![
                "#0 scan comments <- root",
                "#1 lookup comments.author <- #0",
                "#2 link-rows tags <- root",
                "#3 linked-targets tags <- root",
            ]
        );
        for step in plan.steps() {
            if let Some(parent) = step.parent {
                assert!(parent.0 < step.id.0);
            }
        }
    }

    #[test]
    fn plans_render_one_line_per_step() {
        let registry = blog();
        let plan = JoinPlanner::new(&registry)
            .plan("Post", &JoinShape::new().path("comments.author"))
            .expect("plan");
        assert_eq!(
            plan.to_string(),
            "Post\n  #0 scan comments <- root\n  #1 lookup comments.author <- #0"
        );
        let bare = JoinPlanner::new(&registry)
            .plan("Tag", &JoinShape::new())
            .expect("plan");
        assert_eq!(bare.to_string(), "Tag");
    }

    #[test]
    fn filters_land_on_target_steps() {
        let registry = blog();
        let shape = JoinShape::new().include_where("tags", Filter::eq("name", "rust"));
        let plan = JoinPlanner::new(&registry)
            .plan("Post", &shape)
            .expect("plan");
        assert_eq!(plan.steps()[0].filter, None);
        assert_eq!(plan.steps()[1].filter, Some(Filter::eq("name", "rust")));
        assert!(matches!(
            plan.steps()[1].kind,
            FetchKind::LinkedTargets { rows: StepId(0), .. }
        ));
    }

    #[test]
    fn unknown_relation_fails() {
        let registry = blog();
        let err = JoinPlanner::new(&registry)
            .plan("Post", &JoinShape::new().include("likes"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRelation(_)));
    }

    #[test]
    fn repeated_pair_on_one_path_is_a_join_error() {
        let registry = blog();
        let shape = JoinShape::new().path("comments.post.comments");
        let err = JoinPlanner::new(&registry)
            .plan("Post", &shape)
            .unwrap_err();
        assert!(matches!(err, Error::Join(ref e) if e.field.as_deref() == Some("comments")));
    }

    #[test]
    fn same_pair_on_different_paths_is_fine() {
        let registry = blog();
        let shape = JoinShape::new()
            .path("author")
            .path("comments.author");
        let plan = JoinPlanner::new(&registry)
            .plan("Post", &shape)
            .expect("plan");
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn explicit_fields_survive_the_all_barrier() {
        let registry = blog();
        let shape = JoinShape::all()
            .include_nested("comments", JoinShape::new().include("post"))
            .include_where("author", Filter::eq("name", "ann"));
        let plan = JoinPlanner::new(&registry)
            .plan("Post", &shape)
            .expect("plan");
        let paths: Vec<&str> = plan.steps().iter().map(|s| s.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["author", "comments", "comments.author", "comments.post", "tags", "tags"]
        );
        assert_eq!(plan.steps()[0].filter, Some(Filter::eq("name", "ann")));
    }

    #[test]
    fn all_expands_without_revisiting_models() {
        let registry = blog();
        let plan = JoinPlanner::new(&registry)
            .plan("Post", &JoinShape::all())
            .expect("plan");
        let paths: Vec<&str> = plan.steps().iter().map(|s| s.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["author", "comments", "comments.author", "tags", "tags"]
        );
    }
}
