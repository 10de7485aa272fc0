//! Entities and the entity manager.
//!
//! An entity is a core record (identity, position, client binding,
//! attribute tree) plus a behavior trait object supplying the lifecycle
//! hooks and method dispatch. The manager owns every live entity of one
//! game process; all mutation happens on that process's single loop, so
//! nothing here locks.
//!
//! Lifecycle: create → `on_init` → save on creation (an entity that fails
//! to persist is not created) → `on_created` → optional space enter.
//! Destroy: timers released, space left, `on_destroy`, unregistered.
//! Calls racing destruction are dropped with a warning; that is expected
//! traffic, not an error.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::Value;
use tracing::{debug, warn};

use world_shared::ids::{ClientId, EntityId};
use world_shared::math::Vec3;
use world_shared::storage::EntityStorage;

use crate::aoi::{AoiEvent, AoiHandle};
use crate::attr::{AttrSink, MapAttr, MapAttrRef};
use crate::registry::{EntityTypeRegistry, RpcVisibility};
use crate::space::{Space, NIL_SPACE_KIND};
use crate::timer::TimerService;

/// Per-type game logic. Hooks default to no-ops; only dispatch is required.
pub trait EntityBehavior: Send {
    fn on_init(&mut self, _e: &mut EntityCore) {}
    fn on_created(&mut self, _e: &mut EntityCore) {}
    fn on_destroy(&mut self, _e: &mut EntityCore) {}
    fn on_enter_space(&mut self, _e: &mut EntityCore, _space: EntityId) {}
    fn on_leave_space(&mut self, _e: &mut EntityCore, _space: EntityId) {}
    fn on_client_connected(&mut self, _e: &mut EntityCore) {}
    fn on_client_disconnected(&mut self, _e: &mut EntityCore) {}
    fn on_timer(&mut self, _e: &mut EntityCore, _tag: &str) {}

    /// Dispatches one RPC. Visibility was already checked by the manager.
    fn on_call(&mut self, e: &mut EntityCore, method: &str, args: &[Value])
        -> anyhow::Result<()>;
}

/// Engine-owned part of every entity.
pub struct EntityCore {
    id: EntityId,
    type_name: String,
    client: Option<ClientId>,
    space: EntityId,
    aoi_handle: Option<AoiHandle>,
    pos: Vec3,
    attrs: MapAttr,
    sink: AttrSink,
    pending_move: Option<Vec3>,
    pending_client_calls: Vec<(String, Vec<Value>)>,
}

impl EntityCore {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn client(&self) -> Option<ClientId> {
        self.client
    }

    pub fn space(&self) -> EntityId {
        self.space
    }

    pub fn position(&self) -> Vec3 {
        self.pos
    }

    /// Requests a move; the manager applies it through the AOI engine
    /// after the current hook returns.
    pub fn set_position(&mut self, pos: Vec3) {
        self.pending_move = Some(pos);
    }

    /// Queues a method call on the owning client, flushed after the
    /// current hook returns. Dropped if no client is bound by then.
    pub fn call_client(&mut self, method: &str, args: Vec<Value>) {
        self.pending_client_calls.push((method.to_string(), args));
    }

    /// Root view over the attribute tree; mutations notify the client.
    pub fn attrs(&mut self) -> MapAttrRef<'_> {
        MapAttrRef::root(&mut self.attrs, self.id, self.client, &self.sink)
    }

    /// Persisted document: the fully materialized attribute tree.
    pub fn save_doc(&self) -> Value {
        self.attrs.to_value()
    }
}

struct Entity {
    core: EntityCore,
    behavior: Box<dyn EntityBehavior>,
}

/// Registry of live entities plus the spaces they live in.
pub struct EntityManager {
    registry: EntityTypeRegistry,
    entities: HashMap<EntityId, Entity>,
    spaces: HashMap<EntityId, Space>,
    client_index: HashMap<ClientId, EntityId>,
    nil_space: EntityId,
    storage: Arc<dyn EntityStorage>,
    sink: AttrSink,
    aoi_distance: f32,
}

impl EntityManager {
    pub fn new(
        registry: EntityTypeRegistry,
        storage: Arc<dyn EntityStorage>,
        sink: AttrSink,
        aoi_distance: f32,
    ) -> Self {
        let nil_space = EntityId::new_unique();
        let mut spaces = HashMap::new();
        spaces.insert(nil_space, Space::new(nil_space, NIL_SPACE_KIND, aoi_distance));
        Self {
            registry,
            entities: HashMap::new(),
            spaces,
            client_index: HashMap::new(),
            nil_space,
            storage,
            sink,
            aoi_distance,
        }
    }

    pub fn registry(&self) -> &EntityTypeRegistry {
        &self.registry
    }

    pub fn nil_space(&self) -> EntityId {
        self.nil_space
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn type_of(&self, id: EntityId) -> Option<&str> {
        self.entities.get(&id).map(|e| e.core.type_name())
    }

    pub fn position_of(&self, id: EntityId) -> Option<Vec3> {
        self.entities.get(&id).map(|e| e.core.position())
    }

    pub fn client_of(&self, id: EntityId) -> Option<ClientId> {
        self.entities.get(&id).and_then(|e| e.core.client())
    }

    pub fn entity_of_client(&self, client: ClientId) -> Option<EntityId> {
        self.client_index.get(&client).copied()
    }

    pub fn space(&self, id: EntityId) -> Option<&Space> {
        self.spaces.get(&id)
    }

    /// Attribute view for engine-level edits (tests, loaders).
    pub fn attrs_of(&mut self, id: EntityId) -> Option<MapAttrRef<'_>> {
        self.entities.get_mut(&id).map(|e| e.core.attrs())
    }

    /// Snapshot sent to a client gaining interest in an entity.
    pub fn client_view(&self, id: EntityId) -> Option<(String, Vec3, Value)> {
        self.entities
            .get(&id)
            .map(|e| (e.core.type_name.clone(), e.core.pos, e.core.save_doc()))
    }

    /// Drains calls an entity queued for its owning client. Calls queued
    /// while no client is bound are discarded.
    pub fn take_client_calls(&mut self, id: EntityId) -> Vec<(ClientId, String, Vec<Value>)> {
        let Some(ent) = self.entities.get_mut(&id) else {
            return Vec::new();
        };
        let calls = std::mem::take(&mut ent.core.pending_client_calls);
        match ent.core.client {
            Some(client) => calls
                .into_iter()
                .map(|(m, args)| (client, m, args))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Documents for the periodic save sweep.
    pub fn save_docs(&self) -> Vec<(String, EntityId, Value)> {
        self.entities
            .values()
            .map(|e| (e.core.type_name.clone(), e.core.id, e.core.save_doc()))
            .collect()
    }

    // ─── spaces ───

    pub fn create_space(&mut self, kind: i32) -> EntityId {
        let id = EntityId::new_unique();
        self.spaces.insert(id, Space::new(id, kind, self.aoi_distance));
        debug!(space = %id, kind, "space created");
        id
    }

    /// Destroys a space, evicting members to the nil space.
    pub fn destroy_space(&mut self, id: EntityId) -> Vec<AoiEvent> {
        if id == self.nil_space {
            warn!("refusing to destroy the nil space");
            return Vec::new();
        }
        let members: Vec<EntityId> = match self.spaces.get(&id) {
            Some(s) => s.members().iter().copied().collect(),
            None => return Vec::new(),
        };
        let mut events = Vec::new();
        for m in members {
            events.extend(self.move_to_space(m, self.nil_space));
        }
        self.spaces.remove(&id);
        events
    }

    // ─── entity lifecycle ───

    /// Creates an entity: init, save-on-creation, created hook, then the
    /// optional space enter. A persist failure aborts creation.
    pub async fn create_entity(
        &mut self,
        type_name: &str,
        space: Option<EntityId>,
    ) -> anyhow::Result<(EntityId, Vec<AoiEvent>)> {
        let mut behavior = self
            .registry
            .instantiate(type_name)
            .with_context(|| format!("unknown entity type {:?}", type_name))?;
        let id = EntityId::new_unique();
        let mut core = EntityCore {
            id,
            type_name: type_name.to_string(),
            client: None,
            space: self.nil_space,
            aoi_handle: None,
            pos: Vec3::ZERO,
            attrs: MapAttr::new(),
            sink: self.sink.clone(),
            pending_move: None,
            pending_client_calls: Vec::new(),
        };
        behavior.on_init(&mut core);

        // Save on creation: not durable, not created.
        let doc = core.save_doc();
        self.storage
            .write(type_name, id, doc)
            .await
            .context("save on creation")?;

        let pos = core.pos;
        self.entities.insert(id, Entity { core, behavior });
        if let Some(sp) = self.spaces.get_mut(&self.nil_space) {
            sp.enter(id, pos);
        }

        if let Some(ent) = self.entities.get_mut(&id) {
            ent.behavior.on_created(&mut ent.core);
        }
        self.apply_pending_move(id);

        let mut events = Vec::new();
        if let Some(space_id) = space {
            events = self.move_to_space(id, space_id);
        }
        debug!(entity = %id, type_name, "entity created");
        Ok((id, events))
    }

    /// Instantiates a persisted entity from storage.
    pub async fn load_entity(&mut self, type_name: &str, id: EntityId) -> anyhow::Result<()> {
        if self.entities.contains_key(&id) {
            bail!("entity {} already live", id);
        }
        let doc = self
            .storage
            .read(type_name, id)
            .await
            .context("load entity")?
            .with_context(|| format!("no persisted {} {}", type_name, id))?;

        let mut behavior = self
            .registry
            .instantiate(type_name)
            .with_context(|| format!("unknown entity type {:?}", type_name))?;
        let mut core = EntityCore {
            id,
            type_name: type_name.to_string(),
            client: None,
            space: self.nil_space,
            aoi_handle: None,
            pos: Vec3::ZERO,
            attrs: MapAttr::new(),
            sink: self.sink.clone(),
            pending_move: None,
            pending_client_calls: Vec::new(),
        };
        behavior.on_init(&mut core);
        core.attrs = MapAttr::from_document(&doc); // persisted state wins

        let pos = core.pos;
        self.entities.insert(id, Entity { core, behavior });
        if let Some(sp) = self.spaces.get_mut(&self.nil_space) {
            sp.enter(id, pos);
        }
        if let Some(ent) = self.entities.get_mut(&id) {
            ent.behavior.on_created(&mut ent.core);
        }
        self.apply_pending_move(id);
        debug!(entity = %id, type_name, "entity loaded");
        Ok(())
    }

    /// Destroys an entity: timers, space, destroy hook, registry.
    pub fn destroy_entity(&mut self, id: EntityId, timers: &mut TimerService) -> Vec<AoiEvent> {
        let Some(mut ent) = self.entities.remove(&id) else {
            warn!(entity = %id, "destroy of unknown entity dropped");
            return Vec::new();
        };
        timers.cancel_entity(id);

        let events = match self.spaces.get_mut(&ent.core.space) {
            Some(sp) => sp.leave(id, ent.core.aoi_handle),
            None => Vec::new(),
        };
        ent.core.aoi_handle = None;

        if let Some(client) = ent.core.client {
            self.client_index.remove(&client);
        }
        ent.behavior.on_destroy(&mut ent.core);
        debug!(entity = %id, type_name = %ent.core.type_name, "entity destroyed");
        events
    }

    // ─── space membership ───

    /// Moves an entity into a space (leaving its current one first).
    pub fn move_to_space(&mut self, id: EntityId, space_id: EntityId) -> Vec<AoiEvent> {
        let Some(ent) = self.entities.get_mut(&id) else {
            warn!(entity = %id, "space enter for unknown entity dropped");
            return Vec::new();
        };
        if ent.core.space == space_id {
            return Vec::new();
        }
        if !self.spaces.contains_key(&space_id) {
            warn!(entity = %id, space = %space_id, "enter of unknown space dropped");
            return Vec::new();
        }

        let mut events = Vec::new();
        let old_space = ent.core.space;
        let pos = ent.core.pos;
        let old_handle = ent.core.aoi_handle.take();

        if let Some(sp) = self.spaces.get_mut(&old_space) {
            events.extend(sp.leave(id, old_handle));
        }
        let sp = self.spaces.get_mut(&space_id).expect("space checked above");
        let (handle, enters) = sp.enter(id, pos);
        events.extend(enters);

        let ent = self.entities.get_mut(&id).expect("entity checked above");
        ent.core.space = space_id;
        ent.core.aoi_handle = handle;
        if old_space != self.nil_space {
            ent.behavior.on_leave_space(&mut ent.core, old_space);
        }
        if space_id != self.nil_space {
            ent.behavior.on_enter_space(&mut ent.core, space_id);
        }
        self.apply_pending_move_into(&mut events, id);
        events
    }

    /// Sends an entity back to the nil space.
    pub fn leave_space(&mut self, id: EntityId) -> Vec<AoiEvent> {
        self.move_to_space(id, self.nil_space)
    }

    /// Repositions an entity inside its current space.
    pub fn move_entity(&mut self, id: EntityId, pos: Vec3) -> Vec<AoiEvent> {
        let Some(ent) = self.entities.get_mut(&id) else {
            warn!(entity = %id, "move of unknown entity dropped");
            return Vec::new();
        };
        ent.core.pos = pos;
        let space = ent.core.space;
        let handle = ent.core.aoi_handle;
        match (self.spaces.get_mut(&space), handle) {
            (Some(sp), Some(h)) => sp.move_member(h, pos),
            _ => Vec::new(),
        }
    }

    // ─── client binding ───

    /// Binds a client connection to an entity.
    pub fn bind_client(&mut self, id: EntityId, client: ClientId) {
        if let Some(ent) = self.entities.get_mut(&id) {
            ent.core.client = Some(client);
            self.client_index.insert(client, id);
            ent.behavior.on_client_connected(&mut ent.core);
        }
    }

    /// Unbinds on client disconnect; returns the entity that lost it.
    pub fn unbind_client(&mut self, client: ClientId) -> Option<EntityId> {
        let id = self.client_index.remove(&client)?;
        if let Some(ent) = self.entities.get_mut(&id) {
            ent.core.client = None;
            ent.behavior.on_client_disconnected(&mut ent.core);
        }
        Some(id)
    }

    // ─── dispatch ───

    /// Dispatches one RPC; a missing entity or failed visibility check is
    /// logged and dropped (calls race destruction under normal operation).
    pub fn call_entity(
        &mut self,
        id: EntityId,
        method: &str,
        args: &[Value],
        from_client: Option<ClientId>,
    ) -> Vec<AoiEvent> {
        let Some(ent) = self.entities.get_mut(&id) else {
            warn!(entity = %id, method, "call to missing entity dropped");
            return Vec::new();
        };

        if let Some(caller) = from_client {
            let vis = self
                .registry
                .rpc_visibility(&ent.core.type_name, method);
            let allowed = match vis {
                Some(RpcVisibility::AllClients) => true,
                Some(RpcVisibility::OwnClient) => ent.core.client == Some(caller),
                Some(RpcVisibility::ServerOnly) | None => false,
            };
            if !allowed {
                warn!(entity = %id, method, client = %caller, "client call rejected");
                return Vec::new();
            }
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            ent.behavior.on_call(&mut ent.core, method, args)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(entity = %id, method, error = %e, "entity call failed"),
            Err(_) => warn!(entity = %id, method, "entity call panicked"),
        }
        self.pending_move_events(id)
    }

    /// Fires one timer on an entity; stale timers are ignored.
    pub fn dispatch_timer(&mut self, id: EntityId, tag: &str) -> Vec<AoiEvent> {
        let Some(ent) = self.entities.get_mut(&id) else {
            return Vec::new();
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            ent.behavior.on_timer(&mut ent.core, tag);
        }));
        if outcome.is_err() {
            warn!(entity = %id, tag, "timer callback panicked");
        }
        self.pending_move_events(id)
    }

    fn pending_move_events(&mut self, id: EntityId) -> Vec<AoiEvent> {
        let mut events = Vec::new();
        self.apply_pending_move_into(&mut events, id);
        events
    }

    // Nil-space variant: moves in the nil space produce no AOI events.
    fn apply_pending_move(&mut self, id: EntityId) {
        let mut events = Vec::new();
        self.apply_pending_move_into(&mut events, id);
    }

    fn apply_pending_move_into(&mut self, events: &mut Vec<AoiEvent>, id: EntityId) {
        let pending = self
            .entities
            .get_mut(&id)
            .and_then(|e| e.core.pending_move.take());
        if let Some(pos) = pending {
            events.extend(self.move_entity(id, pos));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RpcDescMap;
    use world_shared::storage::MemoryStorage;

    struct Counter;

    impl EntityBehavior for Counter {
        fn on_init(&mut self, e: &mut EntityCore) {
            e.attrs().set_int("hits", 0);
        }

        fn on_call(&mut self, e: &mut EntityCore, method: &str, _args: &[Value])
            -> anyhow::Result<()>
        {
            match method {
                "Hit" => {
                    let hits = e.attrs().get_int("hits").unwrap_or(0);
                    e.attrs().set_int("hits", hits + 1);
                    Ok(())
                }
                "Boom" => panic!("boom"),
                other => bail!("no such method {:?}", other),
            }
        }
    }

    fn manager() -> EntityManager {
        let mut reg = EntityTypeRegistry::new();
        reg.register(
            "Counter",
            || Box::new(Counter),
            RpcDescMap::new().method("Hit", RpcVisibility::OwnClient),
        )
        .unwrap();
        let (sink, _rx) = AttrSink::channel();
        EntityManager::new(reg, Arc::new(MemoryStorage::new()), sink, 100.0)
    }

    #[tokio::test]
    async fn create_saves_before_registering() {
        let mut m = manager();
        let (id, events) = m.create_entity("Counter", None).await.unwrap();
        assert!(events.is_empty());
        assert!(m.has_entity(id));
        assert_eq!(m.attrs_of(id).unwrap().get_int("hits"), Some(0));
    }

    #[tokio::test]
    async fn client_call_requires_ownership() {
        let mut m = manager();
        let (id, _) = m.create_entity("Counter", None).await.unwrap();
        let owner = ClientId::new_unique();
        let stranger = ClientId::new_unique();
        m.bind_client(id, owner);

        m.call_entity(id, "Hit", &[], Some(stranger));
        assert_eq!(m.attrs_of(id).unwrap().get_int("hits"), Some(0));

        m.call_entity(id, "Hit", &[], Some(owner));
        assert_eq!(m.attrs_of(id).unwrap().get_int("hits"), Some(1));
    }

    #[tokio::test]
    async fn panicking_call_leaves_entity_live() {
        let mut m = manager();
        let (id, _) = m.create_entity("Counter", None).await.unwrap();
        m.call_entity(id, "Boom", &[], None);
        assert!(m.has_entity(id));
        m.call_entity(id, "Hit", &[], None);
        assert_eq!(m.attrs_of(id).unwrap().get_int("hits"), Some(1));
    }

    #[tokio::test]
    async fn destroy_releases_timers_and_space() {
        let mut m = manager();
        let mut timers = TimerService::new();
        let space = m.create_space(1);
        let (id, _) = m.create_entity("Counter", Some(space)).await.unwrap();
        timers.add(id, "tick", std::time::Duration::from_secs(60), None);

        m.destroy_entity(id, &mut timers);
        assert!(!m.has_entity(id));
        assert!(timers.is_empty());
        assert!(!m.space(space).unwrap().contains(id));
    }
}
