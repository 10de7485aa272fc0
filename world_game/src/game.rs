//! Game process service: the single-mutator event loop.
//!
//! One loop owns the entity manager, spaces and timers; every inbound
//! packet, timer expiry and posted callback is applied there, so entity
//! state needs no locking. The dispatcher connection feeds the loop
//! through a bounded channel (back-pressure instead of unbounded growth),
//! attribute changes arrive on their own channel, and a fixed-rate tick
//! drives timers, the post queue and the periodic save sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use world_shared::config::EngineConfig;
use world_shared::dispatcher::{DispatcherClient, DispatcherDelegate};
use world_shared::ids::{ClientId, EntityId};
use world_shared::jobs::JobRunner;
use world_shared::packet::{Packet, PacketPool};
use world_shared::post::PostQueue;
use world_shared::proto::{self, MsgType};
use world_shared::storage::{EntityStorage, StorageQueue};

use crate::aoi::AoiEvent;
use crate::attr::{AttrChange, AttrSink};
use crate::entity::EntityManager;
use crate::registry::EntityTypeRegistry;
use crate::timer::TimerService;

/// Capacity of the inbound packet channel; the reader stalls when full.
const INBOUND_CAPACITY: usize = 1024;

enum Inbound {
    Packet(MsgType, Packet),
    Connected { is_reconnect: bool },
    Disconnected,
}

/// Dispatcher-side delegate: forwards everything into the game loop.
struct GameDelegate {
    tx: mpsc::Sender<Inbound>,
}

#[async_trait]
impl DispatcherDelegate for GameDelegate {
    async fn on_dispatcher_connected(&self, is_reconnect: bool) {
        let _ = self.tx.send(Inbound::Connected { is_reconnect }).await;
    }

    async fn on_dispatcher_packet(&self, msg_type: MsgType, pkt: Packet) {
        let _ = self.tx.send(Inbound::Packet(msg_type, pkt)).await;
    }

    async fn on_dispatcher_disconnected(&self) {
        let _ = self.tx.send(Inbound::Disconnected).await;
    }
}

/// One game process.
pub struct GameService {
    cfg: EngineConfig,
    pool: PacketPool,
    dispatcher: Arc<DispatcherClient>,
    manager: EntityManager,
    timers: TimerService,
    post: PostQueue,
    jobs: Arc<JobRunner>,
    storage_queue: StorageQueue,
    inbound_rx: mpsc::Receiver<Inbound>,
    inbound_tx: mpsc::Sender<Inbound>,
    attr_rx: mpsc::UnboundedReceiver<AttrChange>,
    /// Services this process declared, re-declared on reconnect.
    own_services: HashMap<String, EntityId>,
    /// Service name → entity, as announced by the dispatcher.
    known_services: HashMap<String, EntityId>,
}

impl GameService {
    /// Builds a game service. Fails fast if the configured boot entity
    /// type was not registered.
    pub fn new(
        cfg: EngineConfig,
        registry: EntityTypeRegistry,
        storage: Arc<dyn EntityStorage>,
    ) -> anyhow::Result<Self> {
        if !registry.is_registered(&cfg.boot_entity) {
            bail!("boot entity type {:?} is not registered", cfg.boot_entity);
        }
        let pool = PacketPool::new();
        let dispatcher = DispatcherClient::new(&cfg.dispatcher_addr, pool.clone());
        let (sink, attr_rx) = AttrSink::channel();
        let manager = EntityManager::new(registry, storage.clone(), sink, cfg.aoi_distance);
        let post = PostQueue::new();
        let jobs = Arc::new(JobRunner::new(post.clone()));
        let storage_queue = StorageQueue::start(storage, post.clone());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Ok(Self {
            cfg,
            pool,
            dispatcher,
            manager,
            timers: TimerService::new(),
            post,
            jobs,
            storage_queue,
            inbound_rx,
            inbound_tx,
            attr_rx,
            own_services: HashMap::new(),
            known_services: HashMap::new(),
        })
    }

    pub fn manager(&self) -> &EntityManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut EntityManager {
        &mut self.manager
    }

    pub fn timers_mut(&mut self) -> &mut TimerService {
        &mut self.timers
    }

    pub fn post_queue(&self) -> PostQueue {
        self.post.clone()
    }

    /// Worker groups for blocking work; callbacks re-enter the loop via
    /// the post queue on the next tick.
    pub fn job_runner(&self) -> Arc<JobRunner> {
        self.jobs.clone()
    }

    pub fn storage_queue(&self) -> &StorageQueue {
        &self.storage_queue
    }

    /// Declares `entity` as the provider of a named service, cluster-wide.
    pub async fn declare_service(&mut self, entity: EntityId, name: &str) {
        self.own_services.insert(name.to_string(), entity);
        let mut pkt = self.pool.get();
        pkt.append_entity_id(entity);
        pkt.append_str(name);
        self.dispatcher.send(proto::MT_DECLARE_SERVICE, pkt).await;
    }

    pub fn service_provider(&self, name: &str) -> Option<EntityId> {
        self.known_services.get(name).copied()
    }

    /// Runs the loop until the inbound channel closes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.dispatcher.start(Arc::new(GameDelegate {
            tx: self.inbound_tx.clone(),
        }));

        let tick_period = Duration::from_secs_f64(1.0 / self.cfg.tick_hz.max(1) as f64);
        let mut tick = tokio::time::interval(tick_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut save = tokio::time::interval(Duration::from_secs(self.cfg.save_interval_secs.max(1)));
        save.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        save.tick().await; // fires immediately otherwise

        info!(tick_hz = self.cfg.tick_hz, "game service running");
        loop {
            tokio::select! {
                inbound = self.inbound_rx.recv() => {
                    match inbound {
                        Some(Inbound::Packet(msg_type, pkt)) => {
                            if let Err(e) = self.handle_packet(msg_type, pkt).await {
                                if self.cfg.strict_proto {
                                    return Err(e.context("strict proto"));
                                }
                                warn!(msg_type, error = %e, "bad packet dropped");
                            }
                        }
                        Some(Inbound::Connected { is_reconnect }) => {
                            self.on_connected(is_reconnect).await;
                        }
                        Some(Inbound::Disconnected) => {
                            warn!("dispatcher connection lost");
                        }
                        None => {
                            info!("inbound channel closed, game loop exiting");
                            return Ok(());
                        }
                    }
                }
                Some(change) = self.attr_rx.recv() => {
                    self.forward_attr_change(change).await;
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = save.tick() => {
                    self.save_sweep();
                }
            }
        }
    }

    async fn on_connected(&mut self, is_reconnect: bool) {
        if is_reconnect {
            info!(services = self.own_services.len(), "dispatcher reconnected");
            // Dispatcher state is gone; re-announce what we provide.
            let declares: Vec<(String, EntityId)> = self
                .own_services
                .iter()
                .map(|(n, e)| (n.clone(), *e))
                .collect();
            for (name, entity) in declares {
                let mut pkt = self.pool.get();
                pkt.append_entity_id(entity);
                pkt.append_str(&name);
                self.dispatcher.send(proto::MT_DECLARE_SERVICE, pkt).await;
            }
        } else {
            info!("dispatcher connected");
        }
    }

    async fn handle_packet(&mut self, msg_type: MsgType, mut pkt: Packet) -> anyhow::Result<()> {
        match msg_type {
            proto::MT_CALL_ENTITY_METHOD => {
                let entity = pkt.read_entity_id()?;
                let method = pkt.read_str()?;
                let args: Vec<Value> = pkt.read_data()?;
                let events = self.manager.call_entity(entity, &method, &args, None);
                self.after_dispatch(entity, events).await;
            }
            proto::MT_CALL_ENTITY_METHOD_FROM_CLIENT => {
                let client = pkt.read_client_id()?;
                let entity = pkt.read_entity_id()?;
                let method = pkt.read_str()?;
                let args: Vec<Value> = pkt.read_data()?;
                let events = self.manager.call_entity(entity, &method, &args, Some(client));
                self.after_dispatch(entity, events).await;
            }
            proto::MT_CREATE_ENTITY_ANYWHERE => {
                let type_name = pkt.read_str()?;
                match self.manager.create_entity(&type_name, None).await {
                    Ok((id, events)) => {
                        self.after_dispatch(id, events).await;
                    }
                    Err(e) => error!(type_name, error = %e, "create entity failed"),
                }
            }
            proto::MT_LOAD_ENTITY_ANYWHERE => {
                let type_name = pkt.read_str()?;
                let entity = pkt.read_entity_id()?;
                if let Err(e) = self.manager.load_entity(&type_name, entity).await {
                    error!(type_name, %entity, error = %e, "load entity failed");
                }
            }
            proto::MT_DECLARE_SERVICE => {
                let entity = pkt.read_entity_id()?;
                let name = pkt.read_str()?;
                debug!(service = name, %entity, "service declared");
                self.known_services.insert(name, entity);
            }
            proto::MT_UNDECLARE_SERVICE => {
                let entity = pkt.read_entity_id()?;
                let name = pkt.read_str()?;
                if self.known_services.get(&name) == Some(&entity) {
                    self.known_services.remove(&name);
                }
            }
            proto::MT_NOTIFY_CLIENT_CONNECTED => {
                let client = pkt.read_client_id()?;
                self.on_client_connected(client).await?;
            }
            proto::MT_NOTIFY_CLIENT_DISCONNECTED => {
                let client = pkt.read_client_id()?;
                self.on_client_disconnected(client).await;
            }
            proto::MT_NOTIFY_ALL_SERVERS_CONNECTED => {
                info!("all servers connected");
            }
            other => {
                bail!("unknown message type {}", other);
            }
        }
        Ok(())
    }

    /// A fresh client gets a boot entity and sees it first.
    async fn on_client_connected(&mut self, client: ClientId) -> anyhow::Result<()> {
        // Gates re-announce live clients after a dispatcher reconnect; a
        // client that already has an entity keeps it and just gets its
        // snapshot again.
        if let Some(id) = self.manager.entity_of_client(client) {
            debug!(%client, entity = %id, "duplicate connect, resending snapshot");
            self.send_create_on_client(client, id).await;
            return Ok(());
        }
        let boot = self.cfg.boot_entity.clone();
        let (id, events) = self
            .manager
            .create_entity(&boot, None)
            .await
            .context("boot entity")?;
        self.manager.bind_client(id, client);
        self.send_create_on_client(client, id).await;
        self.after_dispatch(id, events).await;
        info!(%client, entity = %id, type_name = boot, "client bound to boot entity");
        Ok(())
    }

    async fn on_client_disconnected(&mut self, client: ClientId) {
        let Some(id) = self.manager.unbind_client(client) else {
            debug!(%client, "disconnect for unknown client");
            return;
        };
        // Final save, then tear the entity down.
        if let Some((type_name, _, doc)) = self.manager.client_view(id) {
            self.storage_queue.write(&type_name, id, doc);
        }
        let events = self.manager.destroy_entity(id, &mut self.timers);
        self.forward_aoi_events(&events).await;
        info!(%client, entity = %id, "client entity destroyed");
    }

    /// Flushes side effects of one dispatch: AOI transitions and queued
    /// client calls.
    async fn after_dispatch(&mut self, entity: EntityId, events: Vec<AoiEvent>) {
        self.forward_aoi_events(&events).await;
        for (client, method, args) in self.manager.take_client_calls(entity) {
            let mut pkt = self.pool.get();
            pkt.append_client_id(client);
            pkt.append_entity_id(entity);
            pkt.append_str(&method);
            if let Err(e) = pkt.append_data(&args) {
                warn!(%entity, method, error = %e, "client call args not serializable");
                continue;
            }
            self.dispatcher.send(proto::MT_CALL_CLIENT_METHOD, pkt).await;
        }
    }

    /// Turns mutual-interest transitions into per-client create/destroy
    /// notifications. Both sides of a pair are notified when owned.
    async fn forward_aoi_events(&mut self, events: &[AoiEvent]) {
        for ev in events {
            let (a, b, entered) = match *ev {
                AoiEvent::Enter(a, b) => (a, b, true),
                AoiEvent::Leave(a, b) => (a, b, false),
            };
            for (me, other) in [(a, b), (b, a)] {
                let Some(client) = self.manager.client_of(me) else {
                    continue;
                };
                if entered {
                    self.send_create_on_client(client, other).await;
                } else {
                    let mut pkt = self.pool.get();
                    pkt.append_client_id(client);
                    pkt.append_entity_id(other);
                    self.dispatcher
                        .send(proto::MT_DESTROY_ENTITY_ON_CLIENT, pkt)
                        .await;
                }
            }
        }
    }

    async fn send_create_on_client(&mut self, client: ClientId, entity: EntityId) {
        let Some((type_name, pos, doc)) = self.manager.client_view(entity) else {
            return;
        };
        let mut pkt = self.pool.get();
        pkt.append_client_id(client);
        pkt.append_entity_id(entity);
        pkt.append_str(&type_name);
        pkt.append_f32(pos.x);
        pkt.append_f32(pos.y);
        pkt.append_f32(pos.z);
        if let Err(e) = pkt.append_data(&doc) {
            warn!(%entity, error = %e, "entity snapshot not serializable");
            return;
        }
        self.dispatcher
            .send(proto::MT_CREATE_ENTITY_ON_CLIENT, pkt)
            .await;
    }

    /// Ships one attribute change to the owning client.
    async fn forward_attr_change(&mut self, change: AttrChange) {
        match change {
            AttrChange::Set {
                entity,
                client,
                path,
                value,
            } => {
                let mut pkt = self.pool.get();
                pkt.append_client_id(client);
                pkt.append_entity_id(entity);
                if pkt.append_data(&path).is_err() || pkt.append_data(&value).is_err() {
                    warn!(%entity, "attr change not serializable");
                    return;
                }
                self.dispatcher
                    .send(proto::MT_NOTIFY_ATTR_CHANGE_ON_CLIENT, pkt)
                    .await;
            }
            AttrChange::Del {
                entity,
                client,
                path,
            } => {
                let mut pkt = self.pool.get();
                pkt.append_client_id(client);
                pkt.append_entity_id(entity);
                if pkt.append_data(&path).is_err() {
                    warn!(%entity, "attr del not serializable");
                    return;
                }
                self.dispatcher
                    .send(proto::MT_NOTIFY_ATTR_DEL_ON_CLIENT, pkt)
                    .await;
            }
        }
    }

    /// One fixed-rate tick: expired timers, then posted callbacks.
    async fn tick(&mut self) {
        let fired = self.timers.due(Instant::now());
        for (entity, tag) in fired {
            let events = self.manager.dispatch_timer(entity, &tag);
            self.after_dispatch(entity, events).await;
        }
        self.post.drain();
        self.dispatcher.flush();
    }

    /// Enqueues every live entity for persistence; the storage queue
    /// retries failed writes until they stick.
    fn save_sweep(&mut self) {
        let docs = self.manager.save_docs();
        let count = docs.len();
        for (type_name, id, doc) in docs {
            self.storage_queue.write(&type_name, id, doc);
        }
        if count > 0 {
            debug!(entities = count, "save sweep enqueued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityBehavior, EntityCore};
    use crate::registry::RpcDescMap;
    use world_shared::storage::MemoryStorage;

    struct Blank;
    impl EntityBehavior for Blank {
        fn on_call(&mut self, _e: &mut EntityCore, _m: &str, _a: &[Value]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry_with(types: &[&str]) -> EntityTypeRegistry {
        let mut reg = EntityTypeRegistry::new();
        for &t in types {
            reg.register(t, || Box::new(Blank), RpcDescMap::new()).unwrap();
        }
        reg
    }

    #[tokio::test]
    async fn missing_boot_entity_fails_fast() {
        let cfg = EngineConfig::default(); // boot entity "Avatar"
        let err = GameService::new(cfg, registry_with(&["Monster"]), Arc::new(MemoryStorage::new()));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn registered_boot_entity_constructs() {
        let cfg = EngineConfig::default();
        let svc = GameService::new(cfg, registry_with(&["Avatar"]), Arc::new(MemoryStorage::new()));
        assert!(svc.is_ok());
    }
}
