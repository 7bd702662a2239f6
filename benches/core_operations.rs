//! Benchmarks for the hot paths: upsert, point get, indexed SELECT and
//! semantic search.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use remdb::{Config, RemDb};
use serde_json::json;
use tempfile::tempdir;

fn bench_upsert(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = RemDb::open(dir.path().join("bench.db"), Config::for_tenant("bench")).unwrap();

    let mut i = 0u64;
    c.bench_function("upsert_keyed_session", |b| {
        b.iter(|| {
            i += 1;
            db.upsert(
                "sessions",
                vec![json!({"session_id": format!("s-{}", i % 128), "user_id": "u"})],
            )
            .unwrap()
        })
    });

    db.close().unwrap();
}

fn bench_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = RemDb::open(dir.path().join("bench.db"), Config::for_tenant("bench")).unwrap();

    let id = db
        .insert("resources", json!({"name": "bench", "category": "bench"}))
        .unwrap();

    c.bench_function("get_by_id", |b| {
        b.iter(|| db.get(black_box(id)).unwrap().unwrap())
    });

    db.close().unwrap();
}

fn bench_indexed_select(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = RemDb::open(dir.path().join("bench.db"), Config::for_tenant("bench")).unwrap();

    for i in 0..500 {
        db.insert(
            "resources",
            json!({"name": format!("doc-{}", i), "category": if i % 10 == 0 { "hot" } else { "cold" }}),
        )
        .unwrap();
    }

    c.bench_function("select_indexed_equality", |b| {
        b.iter(|| {
            db.sql(black_box("SELECT * FROM resources WHERE category = 'hot'"))
                .unwrap()
        })
    });

    db.close().unwrap();
}

fn bench_search(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = RemDb::open(dir.path().join("bench.db"), Config::for_tenant("bench")).unwrap();

    for i in 0..200 {
        db.insert_with_embedding(
            "resources",
            json!({"name": format!("doc-{}", i), "content": format!("topic {} with shared vocabulary", i)}),
        )
        .unwrap();
    }

    c.bench_function("search_top_10", |b| {
        b.iter(|| {
            db.search(black_box("shared vocabulary topic"), "resources", 10)
                .unwrap()
        })
    });

    db.close().unwrap();
}

criterion_group!(benches, bench_upsert, bench_get, bench_indexed_select, bench_search);
criterion_main!(benches);
