//! Property-based tests for store and index invariants.
//!
//! Kept at a modest case count: every case opens a real database file.

use proptest::prelude::*;
use remdb::query::Statement;
use remdb::storage::encode_index_value;
use remdb::{Config, RemDb};
use serde_json::json;
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> RemDb {
    RemDb::open(dir.path().join("rem.db"), Config::for_tenant("t1")).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// upsert(k, v); upsert(k, v') yields one id, final properties v',
    /// and exactly two WAL entries for the key.
    #[test]
    fn prop_upsert_idempotent(
        key in "[a-z0-9]{1,12}",
        v1 in "[a-zA-Z0-9 ]{0,20}",
        v2 in "[a-zA-Z0-9 ]{0,20}",
    ) {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let before = db.store().storage().last_seq();
        let first = db
            .upsert("sessions", vec![json!({"session_id": key, "user_id": v1})])
            .unwrap();
        let second = db
            .upsert("sessions", vec![json!({"session_id": key, "user_id": v2})])
            .unwrap();

        prop_assert_eq!(&first, &second);
        let entity = db.get(first[0]).unwrap().unwrap();
        prop_assert_eq!(entity.property("user_id"), Some(&json!(v2)));
        prop_assert_eq!(db.store().storage().last_seq(), before + 2);
        prop_assert_eq!(db.scan(Some("sessions")).unwrap().len(), 1);

        db.close().unwrap();
    }

    /// Every posting answers consistently: querying an indexed value
    /// returns exactly the live entities carrying it.
    #[test]
    fn prop_postings_match_live_entities(
        categories in prop::collection::vec("[a-c]", 1..8),
    ) {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut ids = Vec::new();
        for (i, category) in categories.iter().enumerate() {
            let id = db
                .insert("resources", json!({"name": format!("r{}", i), "category": category}))
                .unwrap();
            ids.push(id);
        }
        // Delete the first entity; its postings must disappear
        db.delete(ids[0]).unwrap();

        for category in ["a", "b", "c"] {
            let rows = db
                .sql(&format!("SELECT * FROM resources WHERE category = '{}'", category))
                .unwrap();
            let expected = categories
                .iter()
                .enumerate()
                .filter(|(i, c)| *i != 0 && c.as_str() == category)
                .count();
            prop_assert_eq!(rows.len(), expected, "category {}", category);
            for row in &rows {
                prop_assert_eq!(&row["properties"]["category"], &json!(category));
                prop_assert!(row.get("deleted_at").is_none());
            }
        }

        db.close().unwrap();
    }

    /// Search returns scores in [0, 1], non-increasing, and every hit has
    /// the provider's dimension recorded on the entity.
    #[test]
    fn prop_search_scores_bounded_and_sorted(
        texts in prop::collection::vec("[a-z]{2,8}( [a-z]{2,8}){0,4}", 1..6),
        query in "[a-z]{2,8}( [a-z]{2,8}){0,3}",
    ) {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        for (i, text) in texts.iter().enumerate() {
            db.insert_with_embedding(
                "resources",
                json!({"name": format!("doc{}", i), "content": text}),
            )
            .unwrap();
        }

        let results = db.search(&query, "resources", 10).unwrap();
        let mut last = f32::INFINITY;
        for (entity, score) in &results {
            prop_assert!((0.0..=1.0).contains(score));
            prop_assert!(*score <= last);
            last = *score;
            let embedding = entity.property("embedding").unwrap().as_array().unwrap();
            prop_assert_eq!(embedding.len(), 384);
        }

        db.close().unwrap();
    }

    /// WAL seq numbers are strictly monotonic over arbitrary operation
    /// sequences.
    #[test]
    fn prop_wal_seq_strictly_monotonic(
        ops in prop::collection::vec(0u8..3, 1..12),
    ) {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut last = db.store().storage().last_seq();
        let mut live: Vec<remdb::EntityId> = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            match op {
                0 => {
                    let id = db
                        .insert("resources", json!({"name": format!("n{}", i)}))
                        .unwrap();
                    live.push(id);
                }
                1 => {
                    db.upsert("sessions", vec![json!({"session_id": "fixed"})]).unwrap();
                }
                _ => {
                    if let Some(id) = live.pop() {
                        db.delete(id).unwrap();
                    } else {
                        continue;
                    }
                }
            }
            let seq = db.store().storage().last_seq();
            prop_assert!(seq > last, "seq {} did not advance past {}", seq, last);
            last = seq;
        }

        db.close().unwrap();
    }

    /// The index value encoding preserves i64 ordering.
    #[test]
    fn prop_encode_preserves_i64_order(a in any::<i64>(), b in any::<i64>()) {
        let ea = encode_index_value(&json!(a)).unwrap();
        let eb = encode_index_value(&json!(b)).unwrap();
        prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
    }

    /// LOOKUP statements round trip through render and parse for
    /// arbitrary key content, including quotes.
    #[test]
    fn prop_lookup_roundtrip(keys in prop::collection::vec("[ -~]{1,20}", 1..4)) {
        let statement = Statement::Lookup { keys };
        let rendered = statement.to_string();
        let reparsed = Statement::parse(&rendered).unwrap();
        prop_assert_eq!(reparsed, statement);
    }
}
