mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{connect, link_row_id, link_table, unwrap_outcome};
use docmodel::prelude::*;
use docmodel::OperationKind;

fn seed(session: &Session<MemoryDriver>, driver: &MemoryDriver) {
    let links = link_table(session);
    driver.seed("users", vec![record! { "id" => 9, "name" => "ann" }]);
    driver.seed(
        "posts",
        vec![
            record! { "id" => 1, "title" => "Hello", "authorId" => 9 },
            record! { "id" => 2, "title" => "Orphan", "authorId" => 404 },
        ],
    );
    driver.seed(
        "comments",
        vec![
            record! { "id" => 5, "text" => "a", "postId" => 1 },
            record! { "id" => 6, "text" => "b", "postId" => 1 },
        ],
    );
    driver.seed("tags", vec![record! { "id" => 7, "label" => "rust" }]);
    driver.seed(&links, vec![record! { "id" => link_row_id(session, 1, 7), "posts_id" => 1, "tags_id" => 7 }]);
}

#[test]
fn get_join_stitches_every_requested_relation() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let shape = JoinShape::new()
            .include("comments")
            .include("author")
            .include("tags");
        let post = unwrap_outcome(session.get_join(&cx, &mut graph, "Post", &Value::from(1), &shape).await);

        let Some(Link::Many(comments)) = graph.link(post, "comments") else {
            panic!("comments not loaded");
        };
        assert_eq!(comments.len(), 2);
        let Some(Link::One(Some(author))) = graph.link(post, "author") else {
            panic!("author not loaded");
        };
        assert_eq!(graph.doc(*author).get("name"), Some(&Value::from("ann")));
        let Some(Link::Many(tags)) = graph.link(post, "tags") else {
            panic!("tags not loaded");
        };
        assert_eq!(tags.len(), 1);
        assert!(graph.doc(post).is_saved());
        assert!(graph.doc(post).changed_fields().is_empty());
    });
}

#[test]
fn missing_belongs_to_target_loads_as_none() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let shape = JoinShape::new().include("author").include("comments");
        let post = unwrap_outcome(session.get_join(&cx, &mut graph, "Post", &Value::from(2), &shape).await);
        assert_eq!(graph.link(post, "author"), Some(&Link::One(None)));
        assert_eq!(graph.link(post, "comments"), Some(&Link::Many(Vec::new())));
    });
}

#[test]
fn shapes_from_json_load_nested_relations() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let shape = JoinShape::from_json(&serde_json::json!({
            "posts": { "comments": true, "_apply": "ignored" },
        }))
        .expect("shape");
        let user = unwrap_outcome(session.get_join(&cx, &mut graph, "User", &Value::from(9), &shape).await);

        let Some(Link::Many(posts)) = graph.link(user, "posts") else {
            panic!("posts not loaded");
        };
        assert_eq!(posts.len(), 1);
        let Some(Link::Many(comments)) = graph.link(posts[0], "comments") else {
            panic!("nested comments not loaded");
        };
        assert_eq!(comments.len(), 2);
    });
}

#[test]
fn repeating_a_relation_along_a_path_is_rejected_before_reading() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let shape = JoinShape::new().include_nested(
            "comments",
            JoinShape::new().include_nested("post", JoinShape::new().include("comments")),
        );
        match session.get_join(&cx, &mut graph, "Post", &Value::from(1), &shape).await {
            Outcome::Err(Error::Join(err)) => assert_eq!(err.field.as_deref(), Some("comments")),
            other => panic!("expected a join error, got {other:?}"),
        }
        assert_eq!(driver.count(OperationKind::Query), 0);
        assert_eq!(graph.ids().count(), 0);
    });
}

#[test]
fn find_filters_roots_and_batches_relations() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let posts = unwrap_outcome(
            session
                .find(
                    &cx,
                    &mut graph,
                    "Post",
                    &Filter::eq("authorId", 9),
                    &JoinShape::new().include("comments"),
                )
                .await,
        );
        assert_eq!(posts.len(), 1);
        assert_eq!(graph.doc(posts[0]).get("title"), Some(&Value::from("Hello")));
        // one read for the posts, one for all of their comments
        assert_eq!(driver.count(OperationKind::Query), 2);
    });
}

#[test]
fn validate_all_terminates_on_cyclic_links() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let shape = JoinShape::new().include("comments");
        let post = unwrap_outcome(session.get_join(&cx, &mut graph, "Post", &Value::from(1), &shape).await);
        let comment = graph.link(post, "comments").expect("comments").targets()[0];
        graph
            .attach(session.registry(), comment, "post", post)
            .expect("back link");

        session.validate_all(&mut graph, post, None).expect("valid graph");
        graph.doc_mut(comment).set("text", 12);
        let err = session
            .validate_all(&mut graph, post, None)
            .expect_err("bad comment");
        assert!(err.to_string().contains("text"));
    });
}

#[test]
fn add_and_remove_relation_write_immediately() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let links = link_table(&session);
        seed(&session, &driver);
        let mut graph = DocumentGraph::new();

        let post = unwrap_outcome(session.get(&cx, &mut graph, "Post", &Value::from(2)).await);
        let comment = unwrap_outcome(session.get(&cx, &mut graph, "Comment", &Value::from(5)).await);
        let tag = unwrap_outcome(session.get(&cx, &mut graph, "Tag", &Value::from(7)).await);
        driver.clear_journal();

        unwrap_outcome(session.add_relation(&cx, &mut graph, post, "comments", comment).await);
        let stored = driver
            .get_row("comments", "id", &Value::from(5))
            .expect("comment row");
        assert_eq!(stored.get("postId"), Some(&Value::from(2)));
        assert!(graph.doc(comment).changed_fields().is_empty());
        assert_eq!(graph.link(post, "comments"), Some(&Link::Many(vec![comment])));

        unwrap_outcome(session.add_relation(&cx, &mut graph, post, "tags", tag).await);
        assert_eq!(driver.table_rows(&links).len(), 2);

        unwrap_outcome(session.remove_relation(&cx, &mut graph, post, "tags", Some(tag)).await);
        assert_eq!(driver.table_rows(&links).len(), 1);
        assert_eq!(graph.link(post, "tags"), Some(&Link::Many(Vec::new())));

        unwrap_outcome(session.remove_relation(&cx, &mut graph, post, "comments", None).await);
        let stored = driver
            .get_row("comments", "id", &Value::from(5))
            .expect("comment row");
        assert_eq!(stored.get("postId"), Some(&Value::Null));
        assert_eq!(graph.doc(comment).get("postId"), Some(&Value::Null));
        assert_eq!(driver.writes().len(), 4);
    });
}

#[test]
fn add_relation_requires_saved_documents() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let mut graph = DocumentGraph::new();
        let post = common::new_doc(&session, &mut graph, "Post", record! { "title" => "draft" });
        let comment = common::new_doc(&session, &mut graph, "Comment", record! { "text" => "hi" });

        match session.add_relation(&cx, &mut graph, post, "comments", comment).await {
            Outcome::Err(Error::InvalidWrite(_)) => {}
            other => panic!("expected an invalid write, got {other:?}"),
        }
        assert!(driver.operations().is_empty());
        assert!(graph.link(post, "comments").is_none());
    });
}

#[test]
fn text_keys_with_separators_keep_distinct_link_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let (session, driver) = connect();
        let links = link_table(&session);
        driver.seed(
            "posts",
            vec![
                record! { "id" => "a", "title" => "A" },
                record! { "id" => "a_b", "title" => "AB" },
            ],
        );
        driver.seed(
            "tags",
            vec![
                record! { "id" => "b_c", "label" => "bc" },
                record! { "id" => "c", "label" => "c" },
            ],
        );
        let mut graph = DocumentGraph::new();
        let mut ids = Vec::new();
        for (model, key) in [("Post", "a"), ("Post", "a_b"), ("Tag", "b_c"), ("Tag", "c")] {
            ids.push(unwrap_outcome(session.get(&cx, &mut graph, model, &Value::from(key)).await));
        }
        let (a, ab, bc, c) = (ids[0], ids[1], ids[2], ids[3]);

        unwrap_outcome(session.add_relation(&cx, &mut graph, a, "tags", bc).await);
        unwrap_outcome(session.add_relation(&cx, &mut graph, ab, "tags", c).await);

        let rows = driver.table_rows(&links);
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|row| row.get("posts_id") == Some(&Value::from("a"))
                && row.get("tags_id") == Some(&Value::from("b_c"))));
    });
}
