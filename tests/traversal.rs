//! Integration tests for graph traversal over inline edges.

use remdb::{Config, Direction, RemDb};
use serde_json::json;
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> RemDb {
    RemDb::open(dir.path().join("rem.db"), Config::for_tenant("t1")).unwrap()
}

/// a → b → c, all with rel X.
fn chain(db: &RemDb) -> Vec<remdb::EntityId> {
    let ids = db
        .upsert(
            "entities",
            vec![
                json!({"name": "a"}),
                json!({"name": "b"}),
                json!({"name": "c"}),
            ],
        )
        .unwrap();
    db.add_edge(ids[0], ids[1], "X").unwrap();
    db.add_edge(ids[1], ids[2], "X").unwrap();
    ids
}

#[test]
fn test_bfs_depth_two_reaches_chain_end() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let ids = chain(&db);

    let result = db.traverse(ids[0], 2, Direction::Out, Some("X")).unwrap();
    assert_eq!(result.ids, vec![ids[0], ids[1], ids[2]]);

    let result = db.traverse(ids[0], 1, Direction::Out, Some("X")).unwrap();
    assert_eq!(result.ids, vec![ids[0], ids[1]]);

    db.close().unwrap();
}

#[test]
fn test_paths_trace_route_from_start() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let ids = chain(&db);

    let result = db.traverse(ids[0], 2, Direction::Out, Some("X")).unwrap();
    assert_eq!(result.paths.len(), result.ids.len());
    assert_eq!(result.paths[0], vec![ids[0]]);
    assert_eq!(result.paths[2], vec![ids[0], ids[1], ids[2]]);

    db.close().unwrap();
}

#[test]
fn test_edges_visible_on_entities() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let ids = chain(&db);

    let a = db.get(ids[0]).unwrap().unwrap();
    assert_eq!(a.edges.len(), 1);
    assert_eq!(a.edges[0].src, ids[0]);
    assert_eq!(a.edges[0].dst, ids[1]);
    assert_eq!(a.edges[0].rel_type, "X");

    db.close().unwrap();
}

#[test]
fn test_incoming_and_both_directions() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let ids = chain(&db);

    let incoming = db.traverse(ids[2], 2, Direction::In, Some("X")).unwrap();
    assert_eq!(incoming.ids, vec![ids[2], ids[1], ids[0]]);

    let both = db.traverse(ids[1], 1, Direction::Both, Some("X")).unwrap();
    assert_eq!(both.ids.len(), 3);

    db.close().unwrap();
}

#[test]
fn test_zero_depth_traverse() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let ids = chain(&db);

    let result = db.traverse(ids[0], 0, Direction::Out, None).unwrap();
    assert_eq!(result.ids, vec![ids[0]]);

    db.close().unwrap();
}

#[test]
fn test_traverse_via_sql_statement() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let ids = chain(&db);

    let rows = db
        .sql(&format!(
            "TRAVERSE FROM '{}' DEPTH 2 DIRECTION out TYPE 'X'",
            ids[0]
        ))
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["id"], json!(ids[0].to_string()));

    db.close().unwrap();
}

#[test]
fn test_traverse_unknown_start() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);

    let err = db
        .traverse(remdb::EntityId::new(), 2, Direction::Out, None)
        .unwrap_err();
    assert!(err.is_not_found());

    db.close().unwrap();
}
