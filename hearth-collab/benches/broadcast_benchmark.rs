use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use hearth_collab::{Audience, Connection, ConnectionRegistry, Hearth, MemoryStore, Subscription};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

fn populated_registry(admins: usize, guests: usize) -> (ConnectionRegistry, Vec<UnboundedReceiver<Arc<str>>>) {
    let registry = ConnectionRegistry::new();
    registry.set_current_map(Some(1));
    let mut receivers = Vec::new();
    for i in 0..admins + guests {
        let (conn, rx) = Connection::new(i < admins, Some(1));
        registry.register(conn);
        receivers.push(rx);
    }
    (registry, receivers)
}

fn bench_registry_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("Registry Fan-out");
    group.throughput(Throughput::Elements(100));

    group.bench_function("push_folders_100_admins", |b| {
        let (registry, mut receivers) = populated_registry(100, 0);
        let payload = json!({"id": 7, "path": "/maps/Cave"});
        b.iter(|| {
            black_box(registry.push(Audience::new(Subscription::FOLDERS, None), -40, black_box(&payload)));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });

    group.bench_function("push_map_50_admins_50_guests", |b| {
        let (registry, mut receivers) = populated_registry(50, 50);
        let payload = json!({"id": 1, "x": 5, "y": 5});
        b.iter(|| {
            let audience = Audience::new(Subscription::GUEST_MAP, None).on_map(1);
            black_box(registry.push(audience, -73, black_box(&payload)));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });

    group.finish();
}

fn bench_handle_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let hearth = rt.block_on(async {
        Hearth::open(Arc::new(MemoryStore::new()), "admin").await.unwrap()
    });
    let (admin, _rx) = hearth.connect(true);
    rt.block_on(async {
        let create = json!({"id": 1, "method": "maps.new", "params": {"path": "/Bench"}});
        hearth.handle_frame(&admin, &create.to_string()).await;
        let select = json!({"id": 2, "method": "maps.select", "params": {"id": 1}});
        hearth.handle_frame(&admin, &select.to_string()).await;
        let token = json!({"id": 3, "method": "maps.addToken", "params": {"path": "/Layer", "token": {"width": 1, "height": 1}}});
        hearth.handle_frame(&admin, &token.to_string()).await;
    });

    let mut group = c.benchmark_group("Request Handling");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_token", |b| {
        let frame = json!({"id": 4, "method": "maps.setToken", "params": {"id": 1, "x": 3}}).to_string();
        b.to_async(&rt)
            .iter(|| async { black_box(hearth.handle_frame(&admin, black_box(&frame)).await) })
    });

    group.bench_function("get_map", |b| {
        let frame = json!({"id": 5, "method": "maps.get", "params": {"id": 1}}).to_string();
        b.to_async(&rt)
            .iter(|| async { black_box(hearth.handle_frame(&admin, black_box(&frame)).await) })
    });

    group.finish();
}

criterion_group!(benches, bench_registry_fan_out, bench_handle_frame);
criterion_main!(benches);
