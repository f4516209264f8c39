mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{connect, link_row_id, link_table, new_doc, unwrap_outcome};
use docmodel::prelude::*;
use docmodel::{Cleanup, OperationKind};
use std::sync::{Arc, Mutex};

/// Post 1 by user 9 with comments 5 and 6 and tag 7, all stored.
fn seed(session: &Session<MemoryDriver>, driver: &MemoryDriver) {
    let links = link_table(session);
    driver.seed("users", vec![record! { "id" => 9, "name" => "ann" }]);
    driver.seed(
        "posts",
        vec![
            record! { "id" => 1, "title" => "Hello", "authorId" => 9 },
            record! { "id" => 2, "title" => "Other", "authorId" => 9 },
        ],
    );
    driver.seed(
        "comments",
        vec![
            record! { "id" => 5, "text" => "a", "postId" => 1 },
            record! { "id" => 6, "text" => "b", "postId" => 1 },
            record! { "id" => 8, "text" => "c", "postId" => 2 },
        ],
    );
    driver.seed("tags", vec![record! { "id" => 7, "label" => "rust" }]);
    driver.seed(
        &links,
        vec![
            record! { "id" => link_row_id(session, 1, 7), "posts_id" => 1, "tags_id" => 7 },
            record! { "id" => link_row_id(session, 2, 7), "posts_id" => 2, "tags_id" => 7 },
        ],
    );
}

#[test]
fn delete_requires_a_saved_document() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let mut graph = DocumentGraph::new();
        let post = new_doc(&session, &mut graph, "Post", record! { "title" => "Hello" });
        match session.delete(&cx, &mut graph, post).await {
            Outcome::Err(Error::InvalidWrite(_)) => {}
            other => panic!("expected an invalid write, got {other:?}"),
        }
        assert!(driver.operations().is_empty());
    });
}

#[test]
fn delete_removes_one_record_and_notifies() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let deleted: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let mut odm = common::blog();
        let seen = Arc::clone(&deleted);
        odm.model_mut("Comment")
            .expect("comment")
            .on(DocumentEvent::Deleted, move |_, doc| {
                let id = doc.get("id").cloned().unwrap_or(Value::Null);
                seen.lock().expect("lock").push(id);
            });
        let driver = MemoryDriver::new();
        let session = odm.connect(driver.clone());
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let comment = unwrap_outcome(session.get(&cx, &mut graph, "Comment", &Value::Int(5)).await);
        unwrap_outcome(session.delete(&cx, &mut graph, comment).await);

        assert!(!graph.doc(comment).is_saved());
        assert!(graph.doc(comment).old_value().is_none());
        assert!(driver.get_row("comments", "id", &Value::Int(5)).is_none());
        assert_eq!(driver.table_rows("comments").len(), 2);
        assert_eq!(*deleted.lock().expect("lock"), vec![Value::Int(5)]);
    });
}

#[test]
fn purge_clears_references_in_unloaded_records() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let links = link_table(&session);
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let post = unwrap_outcome(session.get(&cx, &mut graph, "Post", &Value::Int(1)).await);
        let cleanups = unwrap_outcome(session.purge(&cx, &mut graph, post).await);

        assert!(driver.get_row("posts", "id", &Value::Int(1)).is_none());
        for key in [5, 6] {
            let row = driver.get_row("comments", "id", &Value::Int(key)).expect("comment row");
            assert_eq!(row.get("postId"), Some(&Value::Null));
        }
        let untouched = driver.get_row("comments", "id", &Value::Int(8)).expect("comment 8");
        assert_eq!(untouched.get("postId"), Some(&Value::Int(2)));

        let remaining = driver.table_rows(&links);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get("posts_id"), Some(&Value::Int(2)));

        // Post.tags and Tag.posts share one link table and column
        let link_cleanups = cleanups
            .iter()
            .filter(|c| matches!(c, Cleanup::DeleteLinks { .. }))
            .count();
        assert_eq!(link_cleanups, 1);
        assert!(!graph.doc(post).is_saved());
    });
}

#[test]
fn purge_nulls_loaded_holders_and_detaches_them() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let user = unwrap_outcome(
            session
                .get_join(&cx, &mut graph, "User", &Value::Int(9), &JoinShape::new().include("posts"))
                .await,
        );
        let post = graph.find("Post", &Value::Int(1)).expect("post 1");
        let other = graph.find("Post", &Value::Int(2)).expect("post 2");
        unwrap_outcome(session.purge(&cx, &mut graph, user).await);

        for id in [post, other] {
            assert_eq!(graph.doc(id).get("authorId"), Some(&Value::Null));
            assert!(graph.doc(id).changed_fields().is_empty());
        }
        for row in driver.table_rows("posts") {
            assert_eq!(row.get("authorId"), Some(&Value::Null));
        }
        assert_eq!(graph.link(user, "posts"), None);
        assert_eq!(graph.persisted_links(user, "posts"), Some(&[][..]));
    });
}

#[test]
fn delete_all_of_one_model_leaves_the_others_untouched() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let links = link_table(&session);
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let shape = JoinShape::new().include("comments").include("author").include("tags");
        let post = unwrap_outcome(session.get_join(&cx, &mut graph, "Post", &Value::Int(1), &shape).await);
        driver.clear_journal();

        let deleted = unwrap_outcome(session.delete_all(&cx, &mut graph, post, Some("Comment")).await);

        assert_eq!(deleted.len(), 2);
        assert!(deleted.iter().all(|id| graph.doc(*id).model() == "Comment"));
        let writes = driver.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes
            .iter()
            .all(|op| op.kind == OperationKind::Delete && op.table == "comments"));

        assert!(graph.doc(post).is_saved());
        assert_eq!(driver.table_rows(&links).len(), 2);
        assert_eq!(driver.table_rows("comments").len(), 1);
        assert_eq!(graph.link(post, "comments"), Some(&Link::Many(Vec::new())));
        assert_eq!(graph.persisted_links(post, "comments"), Some(&[][..]));
    });
}

#[test]
fn delete_all_removes_referencing_documents_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let links = link_table(&session);
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let shape = JoinShape::new().include("comments").include("author").include("tags");
        let post = unwrap_outcome(session.get_join(&cx, &mut graph, "Post", &Value::Int(1), &shape).await);
        driver.clear_journal();

        let deleted = unwrap_outcome(session.delete_all(&cx, &mut graph, post, None).await);
        assert_eq!(deleted.len(), 5);

        let writes = driver.writes();
        let tables: Vec<&str> = writes.iter().map(|op| op.table.as_str()).collect();
        // the link row goes first, the author after the post that references it
        assert_eq!(tables[0], links);
        let position = |table: &str| tables.iter().position(|t| *t == table).expect("deleted");
        assert!(position("comments") < position("posts"));
        assert!(position("posts") < position("users"));

        assert!(driver.get_row("posts", "id", &Value::Int(1)).is_none());
        assert!(driver.get_row("users", "id", &Value::Int(9)).is_none());
        assert!(driver.get_row("tags", "id", &Value::Int(7)).is_none());
        assert_eq!(driver.table_rows(&links).len(), 1);
        assert!(deleted.iter().all(|id| !graph.doc(*id).is_saved()));
    });
}

#[test]
fn delete_all_filtered_by_model_never_writes_kept_documents() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let post = unwrap_outcome(
            session
                .get_join(&cx, &mut graph, "Post", &Value::Int(1), &JoinShape::new().include("author"))
                .await,
        );
        let user = graph.find("User", &Value::Int(9)).expect("author");
        driver.clear_journal();

        let deleted = unwrap_outcome(session.delete_all(&cx, &mut graph, post, Some("User")).await);
        assert_eq!(deleted, vec![user]);

        // the post is only changed in memory; its stored row is untouched
        let stored = driver.get_row("posts", "id", &Value::Int(1)).expect("post row");
        assert_eq!(stored.get("authorId"), Some(&Value::Int(9)));
        assert_eq!(graph.doc(post).get("authorId"), Some(&Value::Null));
        assert_eq!(graph.doc(post).changed_fields(), vec!["authorId"]);
        assert_eq!(graph.link(post, "author"), Some(&Link::One(None)));
        assert_eq!(graph.persisted_links(post, "author"), Some(&[][..]));

        let writes = driver.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind, OperationKind::Delete);
        assert_eq!(writes[0].table, "users");
    });
}

#[test]
fn delete_all_writes_nothing_for_unsaved_documents() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);

        let mut graph = DocumentGraph::new();
        let post = unwrap_outcome(session.get(&cx, &mut graph, "Post", &Value::Int(2)).await);
        let draft = new_doc(
            &session,
            &mut graph,
            "Comment",
            record! { "text" => "draft", "postId" => 2 },
        );
        graph.attach(session.registry(), post, "comments", draft).expect("attach");
        driver.clear_journal();

        let deleted = unwrap_outcome(session.delete_all(&cx, &mut graph, post, None).await);
        assert_eq!(deleted, vec![post]);
        assert_eq!(driver.writes().len(), 1);
        assert_eq!(graph.link(post, "comments"), Some(&Link::Many(Vec::new())));
        assert_eq!(graph.doc(draft).get("postId"), Some(&Value::Null));
        assert!(!graph.doc(draft).is_saved());
    });
}
