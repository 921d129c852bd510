use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_core::{ChangeOrigin, DocumentHandle, YrsDocument};

fn seeded(client_id: u64, chars: usize) -> YrsDocument {
    let doc = YrsDocument::with_client_id(client_id);
    let chunk = "x".repeat(32);
    for _ in 0..(chars / 32) {
        doc.push_text(&chunk);
    }
    doc
}

fn bench_local_insert(c: &mut Criterion) {
    let doc = YrsDocument::with_client_id(1);

    c.bench_function("local_insert_char", |b| {
        b.iter(|| {
            doc.push_text(black_box("a"));
        })
    });
}

fn bench_state_vector(c: &mut Criterion) {
    let doc = seeded(1, 4096);

    c.bench_function("state_vector_4k", |b| {
        b.iter(|| {
            black_box(doc.state_vector());
        })
    });
}

fn bench_diff_update(c: &mut Criterion) {
    let ahead = seeded(1, 4096);
    let behind = YrsDocument::with_client_id(2);
    let sv = behind.state_vector();

    c.bench_function("diff_update_4k_from_empty", |b| {
        b.iter(|| {
            black_box(ahead.diff_update(black_box(&sv)).unwrap());
        })
    });
}

fn bench_full_encode(c: &mut Criterion) {
    let doc = seeded(1, 16 * 1024);

    c.bench_function("full_encode_16k", |b| {
        b.iter(|| {
            black_box(doc.full_encode());
        })
    });
}

fn bench_apply_remote(c: &mut Criterion) {
    let source = seeded(1, 4096);
    let update = source.full_encode();

    c.bench_function("apply_remote_4k", |b| {
        b.iter(|| {
            let target = YrsDocument::with_client_id(2);
            target
                .apply(black_box(&update), ChangeOrigin::Remote)
                .unwrap();
            black_box(target);
        })
    });
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_state_vector,
    bench_diff_update,
    bench_full_encode,
    bench_apply_remote,
);
criterion_main!(benches);
