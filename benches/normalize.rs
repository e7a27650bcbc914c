use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};

use recache::{
    denormalize_many, normalize, EntitySchema, Filter, Fingerprint, SchemaRegistry, StoreState,
    Transition,
};

fn make_schemas() -> SchemaRegistry {
    SchemaRegistry::new([
        EntitySchema::builder("posts")
            .field("title")
            .belongs_to("author", "users")
            .has_many("comments", "comments")
            .build(),
        EntitySchema::builder("users").field("name").build(),
        EntitySchema::builder("comments")
            .field("body")
            .belongs_to("author", "users")
            .build(),
    ])
    .unwrap()
}

// 100 posts, 5 comments each, authors drawn from 20 users.
fn make_page() -> Value {
    let posts: Vec<Value> = (0..100u32)
        .map(|p| {
            let comments: Vec<Value> = (0..5u32)
                .map(|c| {
                    let user = (p + c) % 20;
                    json!({
                        "id": format!("c{p}-{c}"),
                        "body": "comment body",
                        "author": {"id": format!("u{user}"), "name": format!("User {user}")}
                    })
                })
                .collect();
            json!({
                "id": format!("p{p}"),
                "title": format!("Post {p}"),
                "author": {"id": format!("u{}", p % 20), "name": format!("User {}", p % 20)},
                "comments": comments
            })
        })
        .collect();
    Value::Array(posts)
}

fn bench_normalize(c: &mut Criterion) {
    let schemas = make_schemas();
    let page = make_page();

    let mut group = c.benchmark_group("normalize");
    group.throughput(Throughput::Elements(100));
    group.bench_function("page_of_100_posts", |b| {
        b.iter(|| normalize(black_box(&page), "posts", &schemas).unwrap());
    });
    group.finish();
}

fn bench_denormalize(c: &mut Criterion) {
    let schemas = make_schemas();
    let normalized = normalize(&make_page(), "posts", &schemas).unwrap();
    let ids = normalized.result.into_ids();
    // Go through the store so the bench reads what the cache would hold.
    let state = StoreState::new().reduce(Transition::ReceiveMany {
        entities: normalized.entities,
        valid_at: chrono::Utc::now(),
    });

    let mut group = c.benchmark_group("denormalize");
    group.throughput(Throughput::Elements(100));
    for depth in [0usize, 1, 2] {
        group.bench_function(format!("depth_{depth}"), |b| {
            b.iter(|| {
                denormalize_many(black_box(&ids), "posts", state.collections(), &schemas, depth)
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let filter = Filter::new()
        .with("page", 3)
        .with("q", "rust")
        .with("tags", json!(["cache", "async"]));

    c.bench_function("index/canonicalize_and_fingerprint", |b| {
        b.iter(|| {
            let canonical = black_box(&filter).canonicalize(10).unwrap();
            Fingerprint::of("posts", &canonical)
        });
    });
}

criterion_group!(benches, bench_normalize, bench_denormalize, bench_fingerprint);
criterion_main!(benches);
