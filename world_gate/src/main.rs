//! Standalone gate process binary.
//!
//! Usage:
//!   cargo run -p world_gate -- [--dispatcher 127.0.0.1:41000] [--listen 127.0.0.1:42000]

use std::env;

use tracing::info;

use world_gate::GateService;
use world_shared::config::EngineConfig;

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
            "--listen" if i + 1 < args.len() => {
                cfg.gate_addr = args[i + 1].clone();
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
    info!(dispatcher = %cfg.dispatcher_addr, listen = %cfg.gate_addr, "Starting gate process");

    GateService::new(cfg).run().await
}
