use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::time::Duration;
use tandem_sync::awareness::{AwarenessStore, AwarenessUpdate};
use tandem_sync::persist::SaveScheduler;
use tandem_sync::protocol::SyncMessage;
use tandem_sync::transport::{Channel, LocalHub, Transport};
use tokio::time::Instant;

fn bench_update_encode(c: &mut Criterion) {
    let msg = SyncMessage::update(7, vec![0u8; 64]);

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(7, vec![0u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    // 50 peers each moving a cursor
    let updates: Vec<AwarenessUpdate> = (1..=50u64)
        .map(|id| {
            let mut peer = AwarenessStore::new(id);
            peer.set_local_field("cursor", json!({ "anchor": id, "head": id + 3 }))
        })
        .collect();

    c.bench_function("awareness_apply_50_peers", |b| {
        b.iter(|| {
            let mut store = AwarenessStore::new(1_000);
            let now = Instant::now();
            for update in &updates {
                store.apply_update(black_box(update), now).unwrap();
            }
            black_box(store.peer_count());
        })
    });
}

fn bench_save_scheduler(c: &mut Criterion) {
    c.bench_function("save_scheduler_1K_changes", |b| {
        b.iter(|| {
            let mut saves = SaveScheduler::new(Duration::from_millis(1_000));
            let now = Instant::now();
            for _ in 0..1_000 {
                saves.note_change(black_box(now));
            }
            black_box(saves.begin());
        })
    });
}

fn bench_hub_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let hub = LocalHub::with_capacity(100_000);

    let (sender, mut receivers) = rt.block_on(async {
        let sender = hub.join("bench", 0).await.unwrap();
        let mut receivers = Vec::new();
        for id in 1..=100u64 {
            receivers.push(hub.join("bench", id).await.unwrap());
        }
        (sender, receivers)
    });

    c.bench_function("hub_broadcast_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                sender.channel.broadcast(vec![0u8; 64]).await.unwrap();
            });
            for joined in receivers.iter_mut() {
                while joined.events.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_apply,
    bench_save_scheduler,
    bench_hub_fanout,
);
criterion_main!(benches);
