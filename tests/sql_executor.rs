//! Integration tests for REM-SQL execution.
//!
//! Exercises SELECT with indexed predicates, projection and ordering,
//! LOOKUP across schemas, and hybrid SEARCH ... WHERE intersection.

use remdb::{Config, RemDb};
use serde_json::json;
use tempfile::tempdir;

fn seeded_db(dir: &tempfile::TempDir) -> RemDb {
    let db = RemDb::open(dir.path().join("rem.db"), Config::for_tenant("t1")).unwrap();

    let resources = [
        ("Python for Beginners", "tutorial", "python basics for new programmers"),
        ("JavaScript Basics", "tutorial", "javascript basics for the web"),
        ("OAuth 2.0 Implementation", "tutorial", "implementing oauth flows"),
        ("Rust Internals", "reference", "rust systems programming internals"),
        ("Design Notes", "article", "assorted design notes"),
    ];
    for (name, category, content) in resources {
        db.insert_with_embedding(
            "resources",
            json!({"name": name, "category": category, "content": content}),
        )
        .unwrap();
    }
    db
}

// ============================================================================
// SELECT
// ============================================================================

#[test]
fn test_select_by_indexed_category() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let rows = db
        .sql("SELECT * FROM resources WHERE category = 'tutorial'")
        .unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row["properties"]["category"], json!("tutorial"));
    }

    db.close().unwrap();
}

#[test]
fn test_select_projection_limits_fields() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let rows = db
        .sql("SELECT name, category FROM resources LIMIT 3")
        .unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        let object = row.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert!(object.contains_key("name"));
        assert!(object.contains_key("category"));
    }

    db.close().unwrap();
}

#[test]
fn test_select_order_by_name() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let rows = db
        .sql("SELECT name FROM resources ORDER BY name ASC LIMIT 4")
        .unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    let rows = db
        .sql("SELECT name FROM resources ORDER BY name DESC LIMIT 2")
        .unwrap();
    assert_eq!(rows[0]["name"], json!("Rust Internals"));

    db.close().unwrap();
}

#[test]
fn test_select_offset_pagination() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let all = db.sql("SELECT name FROM resources ORDER BY name ASC").unwrap();
    let page = db
        .sql("SELECT name FROM resources ORDER BY name ASC LIMIT 2 OFFSET 2")
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0], all[2]);
    assert_eq!(page[1], all[3]);

    db.close().unwrap();
}

#[test]
fn test_select_in_and_range_predicates() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let rows = db
        .sql("SELECT * FROM resources WHERE category IN ('article', 'reference')")
        .unwrap();
    assert_eq!(rows.len(), 2);

    let rows = db
        .sql("SELECT * FROM resources WHERE name >= 'P' AND name < 'S'")
        .unwrap();
    // Python for Beginners, Rust Internals
    assert_eq!(rows.len(), 2);

    db.close().unwrap();
}

#[test]
fn test_select_non_indexed_predicate_rejected() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let err = db
        .sql("SELECT * FROM resources WHERE content = 'anything'")
        .unwrap_err();
    assert_eq!(err.code(), "query");

    db.close().unwrap();
}

#[test]
fn test_malformed_sql_is_parse_error() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let err = db.sql("SELEKT * FROM resources").unwrap_err();
    assert_eq!(err.code(), "query_parse");

    db.close().unwrap();
}

// ============================================================================
// LOOKUP
// ============================================================================

#[test]
fn test_lookup_by_id_and_derived_key() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    db.upsert("sessions", vec![json!({"session_id": "s-42", "agent": "helper"})])
        .unwrap();

    // Derived key
    let rows = db.sql("LOOKUP 's-42'").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["properties"]["agent"], json!("helper"));

    // Canonical id
    let id = rows[0]["id"].as_str().unwrap();
    let rows = db.sql(&format!("LOOKUP '{}'", id)).unwrap();
    assert_eq!(rows.len(), 1);

    // Unknown keys resolve to nothing, not an error
    assert!(db.sql("LOOKUP 'nope'").unwrap().is_empty());

    db.close().unwrap();
}

// ============================================================================
// Hybrid SEARCH
// ============================================================================

#[test]
fn test_hybrid_search_intersects_with_postings() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let rows = db
        .sql("SEARCH 'python basics' IN resources WHERE category = 'tutorial' LIMIT 3")
        .unwrap();
    assert!(!rows.is_empty());
    for row in &rows {
        assert_eq!(row["properties"]["category"], json!("tutorial"));
    }
    // Best match leads
    assert_eq!(rows[0]["properties"]["name"], json!("Python for Beginners"));

    // The same text without the filter may reach other categories
    let unfiltered = db
        .sql("SEARCH 'python basics' IN resources LIMIT 5")
        .unwrap();
    assert!(unfiltered.len() >= rows.len());

    db.close().unwrap();
}

#[test]
fn test_search_limit_respected() {
    let dir = tempdir().unwrap();
    let db = seeded_db(&dir);

    let rows = db.sql("SEARCH 'basics' IN resources LIMIT 1").unwrap();
    assert!(rows.len() <= 1);

    db.close().unwrap();
}
