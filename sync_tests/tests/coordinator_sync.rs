//! End-to-end coordinator tests: spawn → session → tick → packets.

use std::sync::Arc;

use sync_core::config::SyncConfig;
use sync_core::delta::{FieldFlags, SchemaBuilder, SyncSchema, SyncValue};
use sync_core::math::IVec2;
use sync_core::spatial::ObjectMetadata;
use sync_server::boundary::{
    decode_msg, CacheStore, ConnectionId, RecordingTransport, SendTarget, SyncMsg,
};
use sync_server::coordinator::{with_memory_boundaries, EngineCoordinator};

struct Player {
    position: IVec2,
    hp: i32,
}

fn player_schema() -> SyncSchema<Player> {
    SchemaBuilder::new("player")
        .field("position", FieldFlags::NONE, |p: &Player| p.position.into())
        .field("hp", FieldFlags::NONE, |p: &Player| p.hp.into())
        .build()
        .unwrap()
}

fn meta(id: &str, room: &str, x: i32, y: i32) -> ObjectMetadata {
    ObjectMetadata {
        instance_id: id.to_string(),
        room_id: room.to_string(),
        position: IVec2::new(x, y),
        kind: "player".to_string(),
    }
}

fn test_cfg() -> SyncConfig {
    let mut cfg = SyncConfig::default();
    cfg.interest_radius = 100;
    cfg.persist_every_secs = 0;
    cfg
}

fn setup() -> (EngineCoordinator, Arc<RecordingTransport>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let (mut coord, transport, _cache) = with_memory_boundaries(test_cfg()).unwrap();
    coord
        .register_kind(player_schema(), Some(|p: &mut Player, pos| p.position = pos))
        .unwrap();
    (coord, transport)
}

/// Deltas addressed to one connection, decoded.
fn deltas_for(
    transport: &RecordingTransport,
    conn: ConnectionId,
) -> Vec<sync_server::boundary::SyncPacket> {
    transport
        .take()
        .into_iter()
        .filter_map(|(target, payload)| match target {
            SendTarget::Connection(c) if c == conn => match decode_msg(&payload).unwrap() {
                SyncMsg::Delta(packet) => Some(packet),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn first_tick_sends_full_state_next_tick_sends_nothing() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();

    coord
        .spawn(
            meta("p1", "room1", 10, 10),
            Player {
                position: IVec2::new(10, 10),
                hp: 100,
            },
        )
        .await?;

    let conn = ConnectionId::new_unique();
    coord.session_open(conn, "room1", IVec2::new(0, 0));
    transport.take(); // discard the spawn announcement

    assert_eq!(coord.tick().await?, 1, "one packet for the one session");
    let packets = deltas_for(&transport, conn);
    assert_eq!(packets.len(), 1);
    let update = &packets[0].updates[0];
    assert_eq!(update.instance_id, "p1");
    assert_eq!(update.mask, 0b11, "first sync carries every field");

    // Nothing changed: the next tick must stay silent.
    assert_eq!(coord.tick().await?, 0);
    assert!(deltas_for(&transport, conn).is_empty());
    Ok(())
}

#[tokio::test]
async fn only_the_mutated_field_travels() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();
    coord
        .spawn(
            meta("p1", "room1", 10, 10),
            Player {
                position: IVec2::new(10, 10),
                hp: 100,
            },
        )
        .await?;
    let conn = ConnectionId::new_unique();
    coord.session_open(conn, "room1", IVec2::ZERO);
    coord.tick().await?;
    transport.take();

    coord.with_entity_mut("player", "p1", |p: &mut Player| p.hp = 60);
    coord.tick().await?;

    let packets = deltas_for(&transport, conn);
    assert_eq!(packets.len(), 1);
    let update = &packets[0].updates[0];
    assert_eq!(update.mask, 0b10, "hp sits at bit 1");
    assert_eq!(update.changed, vec![("hp".to_string(), SyncValue::Int(60))]);
    Ok(())
}

#[tokio::test]
async fn interest_is_scoped_by_room_and_radius() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();

    for (id, room, x, y) in [
        ("near", "room1", 15, 15),
        ("far", "room1", 900, 900),
        ("other_room", "room2", 16, 16),
    ] {
        coord
            .spawn(
                meta(id, room, x, y),
                Player {
                    position: IVec2::new(x, y),
                    hp: 100,
                },
            )
            .await?;
    }

    let conn = ConnectionId::new_unique();
    coord.session_open(conn, "room1", IVec2::new(15, 15));
    transport.take();
    coord.tick().await?;

    let packets = deltas_for(&transport, conn);
    assert_eq!(packets.len(), 1);
    let ids: Vec<&str> = packets[0]
        .updates
        .iter()
        .map(|u| u.instance_id.as_str())
        .collect();
    assert_eq!(ids, vec!["near"], "room2 and out-of-radius objects excluded");
    Ok(())
}

#[tokio::test]
async fn recipients_track_independent_histories() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();
    coord
        .spawn(
            meta("p1", "room1", 5, 5),
            Player {
                position: IVec2::new(5, 5),
                hp: 100,
            },
        )
        .await?;

    let alice = ConnectionId::new_unique();
    coord.session_open(alice, "room1", IVec2::ZERO);
    coord.tick().await?;
    transport.take();

    // Bob connects later; his first packet is a full resend while Alice
    // stays silent.
    let bob = ConnectionId::new_unique();
    coord.session_open(bob, "room1", IVec2::ZERO);
    coord.tick().await?;

    assert!(deltas_for(&transport, alice).is_empty());
    Ok(())
}

#[tokio::test]
async fn closed_sessions_get_a_full_resend_on_reconnect() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();
    coord
        .spawn(
            meta("p1", "room1", 5, 5),
            Player {
                position: IVec2::new(5, 5),
                hp: 100,
            },
        )
        .await?;

    let conn = ConnectionId::new_unique();
    coord.session_open(conn, "room1", IVec2::ZERO);
    coord.tick().await?;
    assert_eq!(coord.session_count(), 1);

    // Disconnect evicts the history with the session.
    assert!(coord.session_close(conn));
    assert_eq!(coord.session_count(), 0);

    coord.session_open(conn, "room1", IVec2::ZERO);
    transport.take();
    coord.tick().await?;
    let packets = deltas_for(&transport, conn);
    assert_eq!(packets[0].updates[0].mask, 0b11, "fresh history, full resend");
    Ok(())
}

#[tokio::test]
async fn push_now_syncs_without_a_tick() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();
    coord
        .spawn(
            meta("p1", "room1", 5, 5),
            Player {
                position: IVec2::new(5, 5),
                hp: 100,
            },
        )
        .await?;

    let conn = ConnectionId::new_unique();
    coord.session_open(conn, "room1", IVec2::ZERO);
    let spectator = ConnectionId::new_unique();
    coord.session_open(spectator, "room2", IVec2::ZERO);
    transport.take();

    // Direct mode: an incoming request mutates state and pushes at once.
    coord.with_entity_mut("player", "p1", |p: &mut Player| p.hp = 10);
    assert_eq!(coord.push_now("p1").await?, 1, "only the same-room session");

    let packets = deltas_for(&transport, conn);
    assert_eq!(packets.len(), 1);
    // First contact with this recipient: full state, not just hp.
    assert_eq!(packets[0].updates[0].mask, 0b11);

    assert_eq!(coord.push_now("ghost").await?, 0);
    Ok(())
}

#[tokio::test]
async fn movement_reindexes_before_deltas_are_computed() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();
    coord
        .spawn(
            meta("p1", "room1", 5, 5),
            Player {
                position: IVec2::new(5, 5),
                hp: 100,
            },
        )
        .await?;
    let conn = ConnectionId::new_unique();
    coord.session_open(conn, "room1", IVec2::ZERO);
    coord.tick().await?;
    transport.take();

    coord.move_object("p1", IVec2::new(50, 50))?;
    coord.tick().await?;

    let packets = deltas_for(&transport, conn);
    let update = &packets[0].updates[0];
    assert_eq!(update.mask, 0b01, "only position changed");
    assert_eq!(
        update.changed[0].1,
        SyncValue::Point(IVec2::new(50, 50)),
        "delta reads the post-move position"
    );
    Ok(())
}

#[tokio::test]
async fn despawn_announces_to_the_room() -> anyhow::Result<()> {
    let (mut coord, transport) = setup();
    coord
        .spawn(
            meta("p1", "room1", 5, 5),
            Player {
                position: IVec2::new(5, 5),
                hp: 100,
            },
        )
        .await?;
    transport.take();

    coord.despawn("p1").await?;
    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, SendTarget::Room("room1".to_string()));
    match decode_msg(&sent[0].1)? {
        SyncMsg::Removed { instance_id, .. } => assert_eq!(instance_id, "p1"),
        other => panic!("expected removal notice, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn persistence_cycle_saves_and_reloads_snapshots() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let mut cfg = test_cfg();
    // One-second cadence at 4 Hz: the sweep lands on the fourth tick.
    cfg.tick_hz = 4;
    cfg.persist_every_secs = 1;
    let (mut coord, _transport, cache) = with_memory_boundaries(cfg).unwrap();
    coord.register_kind(player_schema(), None)?;

    for i in 0..3 {
        coord
            .spawn(
                meta(&format!("p{i}"), "room1", i * 10, 0),
                Player {
                    position: IVec2::new(i * 10, 0),
                    hp: 100,
                },
            )
            .await?;
    }

    for _ in 0..4 {
        coord.tick().await?;
    }

    let (keys, _) = cache.scan("obj:player:", 0, 16).await?;
    assert_eq!(keys.len(), 3, "sweep persisted every live object");

    let mut saved = coord.load_saved("obj:player:").await?;
    saved.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    assert_eq!(saved.len(), 3);
    assert_eq!(saved[1].position, IVec2::new(10, 0));

    // Despawn clears the snapshot too.
    coord.despawn("p0").await?;
    let (keys, _) = cache.scan("obj:player:", 0, 16).await?;
    assert_eq!(keys.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_for_ticks_paces_the_loop() -> anyhow::Result<()> {
    let (mut coord, _transport) = setup();
    coord.run_for_ticks(3).await?;
    assert_eq!(coord.tick_count(), 3);
    Ok(())
}
