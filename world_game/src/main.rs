//! Standalone game process binary.
//!
//! Usage:
//!   cargo run -p world_game -- [--dispatcher 127.0.0.1:41000] [--tick-hz 30] [--aoi-distance 100]
//!
//! Registers a sample `Avatar` entity type, connects to the dispatcher and
//! runs the game loop. Real deployments register their own entity types
//! through [`world_game::EntityTypeRegistry`] before starting the service.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::info;

use world_game::{EntityBehavior, EntityCore, EntityTypeRegistry, GameService, RpcDescMap, RpcVisibility};
use world_shared::config::EngineConfig;
use world_shared::math::Vec3;
use world_shared::storage::MemoryStorage;

/// Sample boot entity: tracks a position and a level counter.
struct Avatar;

impl EntityBehavior for Avatar {
    fn on_init(&mut self, e: &mut EntityCore) {
        let mut attrs = e.attrs();
        if attrs.get_int("level").is_none() {
            attrs.set_int("level", 1);
        }
    }

    fn on_call(&mut self, e: &mut EntityCore, method: &str, args: &[Value]) -> anyhow::Result<()> {
        match method {
            "Move" => {
                let (x, z) = match (args.first(), args.get(1)) {
                    (Some(x), Some(z)) => (
                        x.as_f64().context("x not a number")? as f32,
                        z.as_f64().context("z not a number")? as f32,
                    ),
                    _ => anyhow::bail!("Move takes (x, z)"),
                };
                e.set_position(Vec3::new(x, 0.0, z));
                Ok(())
            }
            "LevelUp" => {
                let level = e.attrs().get_int("level").unwrap_or(1);
                e.attrs().set_int("level", level + 1);
                e.call_client("OnLevelUp", vec![Value::from(level + 1)]);
                Ok(())
            }
            other => anyhow::bail!("no such method {:?}", other),
        }
    }
}

fn parse_args() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dispatcher" if i + 1 < args.len() => {
                cfg.dispatcher_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(30);
                i += 2;
            }
            "--aoi-distance" if i + 1 < args.len() => {
                cfg.aoi_distance = args[i + 1].parse().unwrap_or(100.0);
                i += 2;
            }
            "--boot-entity" if i + 1 < args.len() => {
                cfg.boot_entity = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(dispatcher = %cfg.dispatcher_addr, tick_hz = cfg.tick_hz, "Starting game process");

    let mut registry = EntityTypeRegistry::new();
    registry.register(
        "Avatar",
        || Box::new(Avatar),
        RpcDescMap::new()
            .method("Move", RpcVisibility::OwnClient)
            .method("LevelUp", RpcVisibility::OwnClient),
    )?;

    let service = GameService::new(cfg, registry, Arc::new(MemoryStorage::new()))
        .context("create game service")?;
    service.run().await
}
