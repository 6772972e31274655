//! Standalone sync server binary.
//!
//! Usage:
//!   cargo run -p sync_server -- [--tick-hz 64] [--npcs 16] [--ticks 0] [--seed 1]
//!
//! Runs the engine coordinator on a fixed-timestep loop with a demo
//! population of NPCs on a random walk, one observer session, and a
//! logging transport. `--ticks 0` runs until interrupted.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use sync_core::config::SyncConfig;
use sync_core::cycle::CycleDescriptor;
use sync_core::delta::{FieldFlags, SchemaBuilder};
use sync_core::math::IVec2;
use sync_core::spatial::ObjectMetadata;
use sync_server::boundary::{ConnectionId, LogTransport, MemoryCache, RandomWalk};
use sync_server::coordinator::EngineCoordinator;

struct DemoArgs {
    cfg: SyncConfig,
    npcs: u32,
    ticks: u32,
    seed: u64,
}

/// A demo NPC with a couple of replicated stats.
struct Npc {
    position: IVec2,
    hp: i32,
    name: String,
}

fn parse_args() -> DemoArgs {
    let mut args_out = DemoArgs {
        cfg: SyncConfig::default(),
        npcs: 16,
        ticks: 0,
        seed: 1,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tick-hz" if i + 1 < args.len() => {
                args_out.cfg.tick_hz = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            "--npcs" if i + 1 < args.len() => {
                args_out.npcs = args[i + 1].parse().unwrap_or(16);
                i += 2;
            }
            "--ticks" if i + 1 < args.len() => {
                args_out.ticks = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                args_out.seed = args[i + 1].parse().unwrap_or(1);
                i += 2;
            }
            _ => i += 1,
        }
    }
    args_out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    info!(
        tick_hz = args.cfg.tick_hz,
        npcs = args.npcs,
        seed = args.seed,
        "starting sync server"
    );

    let mut placement = StdRng::seed_from_u64(args.seed);
    let mut walk = RandomWalk::new(args.seed.wrapping_add(1), 2);
    let mut spawn_points = Vec::new();
    for n in 0..args.npcs {
        let pos = IVec2::new(
            placement.gen_range(0..args.cfg.world_width),
            placement.gen_range(0..args.cfg.world_height),
        );
        let id = format!("npc-{n}");
        walk.drive("npc", id.clone(), pos);
        spawn_points.push((id, pos));
    }

    let mut coordinator = EngineCoordinator::new(
        args.cfg.clone(),
        Box::new(walk),
        Arc::new(MemoryCache::new()),
        Arc::new(LogTransport),
    )
    .context("create coordinator")?;

    let schema = SchemaBuilder::new("npc")
        .field("position", FieldFlags::NONE, |n: &Npc| n.position.into())
        .field("hp", FieldFlags::NONE, |n: &Npc| n.hp.into())
        .field("name", FieldFlags::NONE, |n: &Npc| n.name.clone().into())
        .build()?;
    coordinator.register_kind(schema, Some(|n: &mut Npc, p| n.position = p))?;

    for (id, pos) in spawn_points {
        coordinator
            .spawn(
                ObjectMetadata {
                    instance_id: id.clone(),
                    room_id: "lobby".to_string(),
                    position: pos,
                    kind: "npc".to_string(),
                },
                Npc {
                    position: pos,
                    hp: 100,
                    name: id,
                },
            )
            .await?;
    }

    // One observer in the middle of the world.
    let observer = ConnectionId::new_unique();
    coordinator.session_open(
        observer,
        "lobby",
        IVec2::new(args.cfg.world_width / 2, args.cfg.world_height / 2),
    );

    // A once-a-second heartbeat in the server log.
    let tick_hz = args.cfg.tick_hz;
    coordinator.register_cycle(
        "server",
        "heartbeat",
        CycleDescriptor::Frequency {
            rate: 1,
            unit: sync_core::cycle::RateUnit::Seconds,
        },
        Box::new(move |tick| {
            info!(tick, seconds = tick / tick_hz as u64, "heartbeat");
            Ok(())
        }),
    )?;

    if args.ticks > 0 {
        coordinator.run_for_ticks(args.ticks).await?;
        info!(ticks = args.ticks, "run complete");
        return Ok(());
    }

    let dt = Duration::from_secs_f64(1.0 / args.cfg.tick_hz as f64);
    let mut next = tokio::time::Instant::now();
    loop {
        next += dt;
        coordinator.tick().await?;
        tokio::time::sleep_until(next).await;
    }
}
