//! Shared helpers for the integration tests.

use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;

use world_shared::packet::PacketPool;
use world_shared::proto::Conn;

/// Generous deadline for socket-based assertions.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A dispatcher stand-in: accepts connections from gates and game
/// processes and lets the test speak raw frames on them.
pub struct FakeDispatcher {
    listener: TcpListener,
    pool: PacketPool,
}

impl FakeDispatcher {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind fake dispatcher")?;
        Ok(Self {
            listener,
            pool: PacketPool::new(),
        })
    }

    pub fn addr(&self) -> String {
        self.listener
            .local_addr()
            .expect("listener has a local addr")
            .to_string()
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub async fn accept(&self) -> anyhow::Result<Conn> {
        let (stream, _) = self.listener.accept().await.context("accept")?;
        stream.set_nodelay(true).ok();
        Ok(Conn::new(stream))
    }
}
