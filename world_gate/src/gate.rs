//! Gate process service.
//!
//! The gate terminates client TCP connections and bridges them to the
//! dispatcher. Upstream it prefixes client calls with the connection's
//! client id; downstream it peels the client id off redirect messages and
//! relays the rest to that connection. The gate holds no entity state,
//! only the connection table and the filter-property trees.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use world_shared::config::EngineConfig;
use world_shared::dispatcher::{DispatcherClient, DispatcherDelegate};
use world_shared::ids::ClientId;
use world_shared::packet::{Packet, PacketPool};
use world_shared::proto::{self, MsgType};

use crate::filter::{FilterOp, FilterTrees};

struct ClientHandle {
    tx: mpsc::UnboundedSender<(MsgType, Packet)>,
}

struct GateShared {
    pool: PacketPool,
    dispatcher: Arc<DispatcherClient>,
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    filters: RwLock<FilterTrees>,
}

impl GateShared {
    /// Queues a frame for one client; false if the client is gone.
    async fn send_to_client(&self, client: ClientId, msg_type: MsgType, pkt: Packet) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&client) {
            Some(handle) => handle.tx.send((msg_type, pkt)).is_ok(),
            None => false,
        }
    }

    /// Tells the cluster a client is gone; used both on disconnect and
    /// when a server addresses a client this gate no longer has.
    async fn notify_client_gone(&self, client: ClientId) {
        let mut pkt = self.pool.get();
        pkt.append_client_id(client);
        self.dispatcher
            .send(proto::MT_NOTIFY_CLIENT_DISCONNECTED, pkt)
            .await;
    }
}

/// Dispatcher-side delegate for the gate.
struct GateDelegate {
    shared: Arc<GateShared>,
}

#[async_trait]
impl DispatcherDelegate for GateDelegate {
    async fn on_dispatcher_connected(&self, is_reconnect: bool) {
        if !is_reconnect {
            info!("dispatcher connected");
            return;
        }
        // The dispatcher lost its client table with the old connection.
        let clients: Vec<ClientId> = {
            let table = self.shared.clients.read().await;
            table.keys().copied().collect()
        };
        info!(clients = clients.len(), "dispatcher reconnected, re-announcing clients");
        for client in clients {
            let mut pkt = self.shared.pool.get();
            pkt.append_client_id(client);
            self.shared
                .dispatcher
                .send(proto::MT_NOTIFY_CLIENT_CONNECTED, pkt)
                .await;
        }
    }

    async fn on_dispatcher_packet(&self, msg_type: MsgType, pkt: Packet) {
        if let Err(e) = handle_dispatcher_packet(&self.shared, msg_type, pkt).await {
            warn!(msg_type, error = %e, "bad dispatcher packet dropped");
        }
    }

    async fn on_dispatcher_disconnected(&self) {
        warn!("dispatcher connection lost");
    }
}

async fn handle_dispatcher_packet(
    shared: &GateShared,
    msg_type: MsgType,
    mut pkt: Packet,
) -> anyhow::Result<()> {
    if proto::is_redirect_to_client(msg_type) {
        let client = pkt.read_client_id()?;
        let forward = shared.pool.get_with_payload(pkt.remaining());
        if !shared.send_to_client(client, msg_type, forward).await {
            debug!(%client, msg_type, "redirect to missing client, reconciling");
            shared.notify_client_gone(client).await;
        }
        return Ok(());
    }
    match msg_type {
        proto::MT_GATE_SET_CLIENT_FILTER_PROP => {
            let client = pkt.read_client_id()?;
            let key = pkt.read_str()?;
            let val = pkt.read_str()?;
            shared.filters.write().await.set(client, &key, &val);
        }
        proto::MT_GATE_CLEAR_CLIENT_FILTER_PROP => {
            let client = pkt.read_client_id()?;
            let key = pkt.read_str()?;
            shared.filters.write().await.clear(client, &key);
        }
        proto::MT_GATE_CALL_FILTERED_CLIENTS => {
            let key = pkt.read_str()?;
            let op_str = pkt.read_str()?;
            let val = pkt.read_str()?;
            let op = FilterOp::parse(&op_str)
                .with_context(|| format!("bad filter op {:?}", op_str))?;
            let targets = shared.filters.read().await.matching(&key, op, &val);
            debug!(key, op = op_str, val, targets = targets.len(), "filtered call");
            for client in targets {
                let forward = shared.pool.get_with_payload(pkt.remaining());
                shared
                    .send_to_client(client, proto::MT_CALL_CLIENT_METHOD, forward)
                    .await;
            }
        }
        other => anyhow::bail!("unknown message type {}", other),
    }
    Ok(())
}

/// One gate process.
pub struct GateService {
    cfg: EngineConfig,
    shared: Arc<GateShared>,
    listener: Option<TcpListener>,
}

/// Binds a gate on an ephemeral port; returns the service and its address.
pub async fn bind_ephemeral(dispatcher_addr: &str) -> anyhow::Result<(GateService, std::net::SocketAddr)> {
    let cfg = EngineConfig {
        dispatcher_addr: dispatcher_addr.to_string(),
        gate_addr: "127.0.0.1:0".to_string(),
        ..EngineConfig::default()
    };
    let mut gate = GateService::new(cfg);
    let addr = gate.bind().await?;
    Ok((gate, addr))
}

impl GateService {
    pub fn new(cfg: EngineConfig) -> Self {
        let pool = PacketPool::new();
        let dispatcher = DispatcherClient::new(&cfg.dispatcher_addr, pool.clone());
        Self {
            cfg,
            shared: Arc::new(GateShared {
                pool,
                dispatcher,
                clients: RwLock::new(HashMap::new()),
                filters: RwLock::new(FilterTrees::new()),
            }),
            listener: None,
        }
    }

    /// Binds the client listener; `run` binds lazily if this was skipped.
    pub async fn bind(&mut self) -> anyhow::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(&self.cfg.gate_addr)
            .await
            .with_context(|| format!("bind {}", self.cfg.gate_addr))?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Accepts client connections until the listener fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().expect("listener bound above");
        info!(addr = %listener.local_addr()?, "gate listening");

        self.shared.dispatcher.start(Arc::new(GateDelegate {
            shared: self.shared.clone(),
        }));

        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let client = ClientId::new_unique();
                debug!(%client, %peer, "client connected");
                if let Err(e) = serve_client(shared, stream, client).await {
                    debug!(%client, error = %e, "client connection closed");
                }
            });
        }
    }
}

async fn serve_client(
    shared: Arc<GateShared>,
    stream: TcpStream,
    client: ClientId,
) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    shared
        .clients
        .write()
        .await
        .insert(client, ClientHandle { tx });

    let mut pkt = shared.pool.get();
    pkt.append_client_id(client);
    shared
        .dispatcher
        .send(proto::MT_NOTIFY_CLIENT_CONNECTED, pkt)
        .await;

    let writer = tokio::spawn(client_writer(write_half, rx));
    let result = client_reader(&shared, read_half, client).await;

    // Teardown order: table first so no new frames are queued, then the
    // filter entries, then the cluster notification.
    shared.clients.write().await.remove(&client);
    shared.filters.write().await.remove_client(client);
    shared.notify_client_gone(client).await;
    writer.abort();
    result
}

async fn client_reader(
    shared: &GateShared,
    mut read_half: OwnedReadHalf,
    client: ClientId,
) -> anyhow::Result<()> {
    loop {
        let (msg_type, pkt) = proto::read_frame(&mut read_half, &shared.pool).await?;
        match msg_type {
            proto::MT_CALL_ENTITY_METHOD => {
                // Stamp the connection's identity; clients cannot forge it.
                let mut wrapped = shared.pool.get();
                wrapped.append_client_id(client);
                wrapped.append_raw(pkt.payload());
                shared
                    .dispatcher
                    .send(proto::MT_CALL_ENTITY_METHOD_FROM_CLIENT, wrapped)
                    .await;
            }
            other => {
                warn!(%client, msg_type = other, "client sent non-call message, dropped");
            }
        }
    }
}

async fn client_writer(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<(MsgType, Packet)>,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some((msg_type, pkt)) = rx.recv().await {
        if proto::write_frame(&mut writer, msg_type, pkt).await.is_err() {
            break;
        }
        // Flush once the burst is drained.
        if rx.is_empty() && writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.flush().await;
}
