use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use quill_collab::broadcast::Room;
use quill_collab::config::EmissionPolicy;
use quill_collab::messages::{BroadcastMessage, FieldLock, LocalUser, PresencePayload};
use quill_collab::presence::PresenceAggregator;
use quill_collab::protocol::RelayFrame;
use quill_collab::transport::{Outbox, PresenceSnapshot};
use quill_collab::update::UpdateExchange;
use serde_json::json;
use std::collections::HashMap;
use std::hint::black_box;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

fn lock_payload() -> serde_json::Value {
    let now = Utc::now();
    BroadcastMessage::Locked(FieldLock {
        field_name: "title".into(),
        user_id: "u-1".into(),
        user_email: "ann@example.com".into(),
        locked_at: now,
        expires_at: now + chrono::Duration::seconds(30),
    })
    .to_payload()
    .unwrap()
}

fn snapshot(users: usize) -> PresenceSnapshot {
    (0..users)
        .map(|i| {
            let payload = PresencePayload {
                user_id: format!("u-{i}"),
                user_email: format!("user{i}@example.com"),
                last_seen: Utc::now(),
                current_field: (i % 3 == 0).then(|| "content".to_string()),
            };
            (format!("u-{i}"), vec![serde_json::to_value(payload).unwrap()])
        })
        .collect()
}

fn bench_frame_encode(c: &mut Criterion) {
    let conn = Uuid::new_v4();
    let payload = lock_payload();

    c.bench_function("frame_encode_field_locked", |b| {
        b.iter(|| {
            let frame = RelayFrame::broadcast(conn, "article:42:locks", "field_locked", black_box(&payload)).unwrap();
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = RelayFrame::broadcast(Uuid::new_v4(), "article:42:locks", "field_locked", &lock_payload()).unwrap();
    let encoded = frame.encode().unwrap();

    c.bench_function("frame_decode_field_locked", |b| {
        b.iter(|| {
            let frame = RelayFrame::decode(black_box(&encoded)).unwrap();
            black_box(frame.json_payload().unwrap());
        })
    });
}

fn bench_presence_state_100_users(c: &mut Criterion) {
    let snapshot = snapshot(100);

    c.bench_function("frame_presence_state_100_users", |b| {
        b.iter(|| {
            let frame = RelayFrame::presence_state(Uuid::nil(), "article:42:presence", black_box(&snapshot)).unwrap();
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_threshold_typing(c: &mut Criterion) {
    let text: String = "The quick brown fox jumps over the lazy dog. ".repeat(4);
    let outbox = Outbox::offline();

    c.bench_function("threshold_typing_180_keystrokes", |b| {
        b.iter(|| {
            let mut updates = UpdateExchange::new(
                LocalUser::new("u-1", "ann@example.com"),
                EmissionPolicy::threshold(),
                HashMap::new(),
            );
            let now = Instant::now();
            let wall = Utc::now();
            let mut sent = 0;
            for end in 1..=text.len() {
                if updates.broadcast_field_update("title", json!(&text[..end]), now, wall, &outbox) {
                    sent += 1;
                }
            }
            black_box(sent);
        })
    });
}

fn bench_presence_sync_100_users(c: &mut Criterion) {
    let snapshot = snapshot(100);
    let mut presence = PresenceAggregator::new(
        LocalUser::new("u-0", "user0@example.com"),
        Duration::from_millis(300),
        Duration::from_secs(30),
    );

    c.bench_function("presence_sync_100_users", |b| {
        b.iter(|| {
            presence.on_sync(black_box(&snapshot));
            black_box(presence.editors_of("content"));
        })
    });
}

fn bench_room_fanout_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let room = Room::new("article:42:updates", 1024);
    let sender = Uuid::new_v4();
    let receivers: Vec<_> = rt.block_on(async {
        let mut receivers = Vec::new();
        for i in 0..100 {
            let (rx, _) = room.join(Uuid::new_v4(), format!("u-{i}")).await;
            receivers.push(rx);
        }
        receivers
    });
    let payload = json!({ "update": { "field_name": "title", "field_value": "Hello" } });

    c.bench_function("room_fanout_100_members", |b| {
        b.iter(|| {
            black_box(room.broadcast(sender, "field_updated", payload.clone()));
        })
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_presence_state_100_users,
    bench_threshold_typing,
    bench_presence_sync_100_users,
    bench_room_fanout_100_members,
);
criterion_main!(benches);
