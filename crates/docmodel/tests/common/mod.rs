//! Blog models shared by the integration tests.

#![allow(dead_code)]

use docmodel::prelude::*;

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// `Post` has many `Comment`s, belongs to a `User` author and has many `Tag`s
/// through a link table. `Comment` belongs to its `Post`.
pub fn blog() -> Odm {
    let mut odm = Odm::new(OdmConfig::default());
    odm.create_model(
        "Post",
        Schema::new().field("title", FieldRule::string()),
        ModelOptions::new().table("posts"),
    )
    .expect("post");
    odm.create_model(
        "Comment",
        Schema::new().field("text", FieldRule::string()),
        ModelOptions::new().table("comments"),
    )
    .expect("comment");
    odm.create_model(
        "User",
        Schema::new().field("name", FieldRule::string()),
        ModelOptions::new().table("users"),
    )
    .expect("user");
    odm.create_model(
        "Tag",
        Schema::new().field("label", FieldRule::string()),
        ModelOptions::new().table("tags"),
    )
    .expect("tag");

    let registry = odm.registry_mut();
    registry
        .has_many("Post", "Comment", "comments", "id", "postId")
        .expect("comments");
    registry
        .belongs_to("Comment", "Post", "post", "postId", "id")
        .expect("post");
    registry
        .belongs_to("Post", "User", "author", "authorId", "id")
        .expect("author");
    registry
        .has_many("User", "Post", "posts", "id", "authorId")
        .expect("posts");
    registry
        .has_and_belongs_to_many("Post", "Tag", "tags", "id", "id")
        .expect("tags");
    registry
        .has_and_belongs_to_many("Tag", "Post", "posts", "id", "id")
        .expect("tag posts");
    odm
}

pub fn connect() -> (Session<MemoryDriver>, MemoryDriver) {
    let driver = MemoryDriver::new();
    (blog().connect(driver.clone()), driver)
}

pub fn new_doc(session: &Session<MemoryDriver>, graph: &mut DocumentGraph, model: &str, data: Record) -> DocId {
    let doc = session
        .registry()
        .new_document(model, data)
        .expect("new document");
    graph.insert(doc)
}

/// Stored id of the `Post.tags` link row for a pair of keys.
pub fn link_row_id(session: &Session<MemoryDriver>, post: i64, tag: i64) -> String {
    session
        .registry()
        .resolve("Post", "tags")
        .expect("tags")
        .link
        .as_ref()
        .expect("link table")
        .row_id(&Value::Int(post), &Value::Int(tag))
}

pub fn link_table(session: &Session<MemoryDriver>) -> String {
    session
        .registry()
        .resolve("Post", "tags")
        .expect("tags")
        .link
        .as_ref()
        .expect("link table")
        .table
        .clone()
}
