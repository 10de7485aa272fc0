//! Storage and KVDB boundary.
//!
//! The engine never talks to a concrete backend; it consumes these traits
//! through an async request queue. Responses come back through the
//! `PostQueue`, so results are applied on the owning loop.
//!
//! Policy (deliberate asymmetry):
//! - Writes are retried indefinitely with a fixed backoff. A lost save is
//!   worse than a stalled save.
//! - Read/list/exists failures are surfaced once to the caller's callback
//!   and not retried here.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ids::EntityId;
use crate::post::PostQueue;

/// Fixed backoff between save retries.
pub const SAVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Persisted-entity backend (filesystem, mongo, redis... all external).
#[async_trait]
pub trait EntityStorage: Send + Sync {
    async fn write(&self, type_name: &str, id: EntityId, data: Value) -> anyhow::Result<()>;
    async fn read(&self, type_name: &str, id: EntityId) -> anyhow::Result<Option<Value>>;
    async fn list(&self, type_name: &str) -> anyhow::Result<Vec<EntityId>>;
    async fn exists(&self, type_name: &str, id: EntityId) -> anyhow::Result<bool>;
}

/// Key-value backend for cross-process discovery data.
#[async_trait]
pub trait Kvdb: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn put(&self, key: &str, val: &str) -> anyhow::Result<()>;
    /// Keys in `[begin, end)`, ordered.
    async fn get_range(&self, begin: &str, end: &str) -> anyhow::Result<Vec<(String, String)>>;
    /// Puts only if absent; returns the pre-existing value if there was one.
    async fn get_or_put(&self, key: &str, val: &str) -> anyhow::Result<Option<String>>;
}

/// In-memory reference backend; also the test double.
#[derive(Default)]
pub struct MemoryStorage {
    docs: Mutex<HashMap<(String, EntityId), Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStorage for MemoryStorage {
    async fn write(&self, type_name: &str, id: EntityId, data: Value) -> anyhow::Result<()> {
        self.docs
            .lock()
            .expect("storage poisoned")
            .insert((type_name.to_string(), id), data);
        Ok(())
    }

    async fn read(&self, type_name: &str, id: EntityId) -> anyhow::Result<Option<Value>> {
        Ok(self
            .docs
            .lock()
            .expect("storage poisoned")
            .get(&(type_name.to_string(), id))
            .cloned())
    }

    async fn list(&self, type_name: &str) -> anyhow::Result<Vec<EntityId>> {
        let docs = self.docs.lock().expect("storage poisoned");
        let mut ids: Vec<EntityId> = docs
            .keys()
            .filter(|(t, _)| t == type_name)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, type_name: &str, id: EntityId) -> anyhow::Result<bool> {
        Ok(self
            .docs
            .lock()
            .expect("storage poisoned")
            .contains_key(&(type_name.to_string(), id)))
    }
}

/// In-memory KVDB reference backend.
#[derive(Default)]
pub struct MemoryKvdb {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvdb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kvdb for MemoryKvdb {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().expect("kvdb poisoned").get(key).cloned())
    }

    async fn put(&self, key: &str, val: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("kvdb poisoned")
            .insert(key.to_string(), val.to_string());
        Ok(())
    }

    async fn get_range(&self, begin: &str, end: &str) -> anyhow::Result<Vec<(String, String)>> {
        let entries = self.entries.lock().expect("kvdb poisoned");
        Ok(entries
            .range(begin.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_or_put(&self, key: &str, val: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().expect("kvdb poisoned");
        if let Some(existing) = entries.get(key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(key.to_string(), val.to_string());
        Ok(None)
    }
}

type ReadCallback = Box<dyn FnOnce(anyhow::Result<Option<Value>>) + Send>;
type ListCallback = Box<dyn FnOnce(anyhow::Result<Vec<EntityId>>) + Send>;
type ExistsCallback = Box<dyn FnOnce(anyhow::Result<bool>) + Send>;

enum Op {
    Write {
        type_name: String,
        id: EntityId,
        data: Value,
    },
    Read {
        type_name: String,
        id: EntityId,
        cb: ReadCallback,
    },
    List {
        type_name: String,
        cb: ListCallback,
    },
    Exists {
        type_name: String,
        id: EntityId,
        cb: ExistsCallback,
    },
}

/// Thread-safe FIFO of storage operations with one dedicated worker task.
#[derive(Clone)]
pub struct StorageQueue {
    tx: mpsc::UnboundedSender<Op>,
}

impl StorageQueue {
    pub fn start(storage: Arc<dyn EntityStorage>, post: PostQueue) -> Self {
        Self::start_with_retry_delay(storage, post, SAVE_RETRY_DELAY)
    }

    pub fn start_with_retry_delay(
        storage: Arc<dyn EntityStorage>,
        post: PostQueue,
        retry_delay: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Op>();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    Op::Write {
                        type_name,
                        id,
                        data,
                    } => loop {
                        match storage.write(&type_name, id, data.clone()).await {
                            Ok(()) => {
                                debug!(%id, type_name, "entity saved");
                                break;
                            }
                            Err(e) => {
                                warn!(%id, type_name, error = %e, "save failed, retrying");
                                tokio::time::sleep(retry_delay).await;
                            }
                        }
                    },
                    Op::Read { type_name, id, cb } => {
                        let res = storage.read(&type_name, id).await;
                        post.post(move || cb(res));
                    }
                    Op::List { type_name, cb } => {
                        let res = storage.list(&type_name).await;
                        post.post(move || cb(res));
                    }
                    Op::Exists { type_name, id, cb } => {
                        let res = storage.exists(&type_name, id).await;
                        post.post(move || cb(res));
                    }
                }
            }
            debug!("storage queue drained");
        });
        Self { tx }
    }

    /// Queues a save. Saves are retried until they succeed.
    pub fn write(&self, type_name: &str, id: EntityId, data: Value) {
        let _ = self.tx.send(Op::Write {
            type_name: type_name.to_string(),
            id,
            data,
        });
    }

    pub fn read(
        &self,
        type_name: &str,
        id: EntityId,
        cb: impl FnOnce(anyhow::Result<Option<Value>>) + Send + 'static,
    ) {
        let _ = self.tx.send(Op::Read {
            type_name: type_name.to_string(),
            id,
            cb: Box::new(cb),
        });
    }

    pub fn list(
        &self,
        type_name: &str,
        cb: impl FnOnce(anyhow::Result<Vec<EntityId>>) + Send + 'static,
    ) {
        let _ = self.tx.send(Op::List {
            type_name: type_name.to_string(),
            cb: Box::new(cb),
        });
    }

    pub fn exists(
        &self,
        type_name: &str,
        id: EntityId,
        cb: impl FnOnce(anyhow::Result<bool>) + Send + 'static,
    ) {
        let _ = self.tx.send(Op::Exists {
            type_name: type_name.to_string(),
            id,
            cb: Box::new(cb),
        });
    }
}
