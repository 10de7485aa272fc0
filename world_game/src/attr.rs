//! Dynamic attribute trees (MapAttr/ListAttr).
//!
//! Every entity carries a recursive attribute tree. Mutations go through
//! path-tracking views rooted at the entity; each mutation synchronously
//! emits a change record carrying the full path from the root and the new
//! value, fully materialized as `serde_json::Value` at that moment. The
//! game loop turns change records into client notifications.
//!
//! Sub-tree attachment is single-owner by construction: `set`/`push`
//! consume the value, so attaching a node that is already attached cannot
//! be written. `pop`/`take` detach and hand the sub-tree back for legal
//! re-attachment.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use world_shared::ids::{ClientId, EntityId};

/// One step of a path from the attribute root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSeg {
    Key(String),
    Index(u64),
}

/// Change record emitted on every mutation of a client-owned entity.
#[derive(Debug)]
pub enum AttrChange {
    Set {
        entity: EntityId,
        client: ClientId,
        /// Root path including the mutated key/index.
        path: Vec<PathSeg>,
        /// Fully materialized new value.
        value: Value,
    },
    Del {
        entity: EntityId,
        client: ClientId,
        path: Vec<PathSeg>,
    },
}

/// Sending side of the change stream; cheap to clone per entity.
#[derive(Clone)]
pub struct AttrSink {
    tx: mpsc::UnboundedSender<AttrChange>,
}

impl AttrSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AttrChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, change: AttrChange) {
        let _ = self.tx.send(change);
    }
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrVal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(MapAttr),
    List(ListAttr),
}

impl AttrVal {
    /// Materializes into a plain JSON value (recursively, never lazy).
    pub fn to_value(&self) -> Value {
        match self {
            AttrVal::Null => Value::Null,
            AttrVal::Bool(b) => json!(b),
            AttrVal::Int(i) => json!(i),
            AttrVal::Float(f) => json!(f),
            AttrVal::Str(s) => json!(s),
            AttrVal::Map(m) => m.to_value(),
            AttrVal::List(l) => l.to_value(),
        }
    }

    /// Rebuilds an attribute value from a persisted document.
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Null => AttrVal::Null,
            Value::Bool(b) => AttrVal::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttrVal::Int(i)
                } else {
                    AttrVal::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => AttrVal::Str(s.clone()),
            Value::Object(obj) => {
                let mut m = MapAttr::default();
                for (k, v) in obj {
                    m.entries.insert(k.clone(), AttrVal::from_value(v));
                }
                AttrVal::Map(m)
            }
            Value::Array(items) => {
                let mut l = ListAttr::default();
                for v in items {
                    l.items.push(AttrVal::from_value(v));
                }
                AttrVal::List(l)
            }
        }
    }
}

/// String-keyed attribute node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapAttr {
    entries: HashMap<String, AttrVal>,
}

impl MapAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::with_capacity(self.entries.len());
        for (k, v) in &self.entries {
            obj.insert(k.clone(), v.to_value());
        }
        Value::Object(obj)
    }

    pub fn from_document(doc: &Value) -> Self {
        match AttrVal::from_value(doc) {
            AttrVal::Map(m) => m,
            _ => MapAttr::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&AttrVal> {
        self.entries.get(key)
    }
}

/// Index-keyed attribute node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListAttr {
    items: Vec<AttrVal>,
}

impl ListAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.items.iter().map(AttrVal::to_value).collect())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&AttrVal> {
        self.items.get(i)
    }
}

/// Mutation context shared by all views over one entity's tree.
#[derive(Clone, Copy)]
struct AttrCtx<'a> {
    entity: EntityId,
    client: Option<ClientId>,
    sink: &'a AttrSink,
}

impl AttrCtx<'_> {
    fn notify_set(&self, path: Vec<PathSeg>, value: Value) {
        if let Some(client) = self.client {
            self.sink.emit(AttrChange::Set {
                entity: self.entity,
                client,
                path,
                value,
            });
        }
    }

    fn notify_del(&self, path: Vec<PathSeg>) {
        if let Some(client) = self.client {
            self.sink.emit(AttrChange::Del {
                entity: self.entity,
                client,
                path,
            });
        }
    }
}

/// Mutable view over a map node; knows its path from the root.
pub struct MapAttrRef<'a> {
    node: &'a mut MapAttr,
    path: Vec<PathSeg>,
    ctx: AttrCtx<'a>,
}

impl<'a> MapAttrRef<'a> {
    pub(crate) fn root(
        node: &'a mut MapAttr,
        entity: EntityId,
        client: Option<ClientId>,
        sink: &'a AttrSink,
    ) -> Self {
        Self {
            node,
            path: Vec::new(),
            ctx: AttrCtx {
                entity,
                client,
                sink,
            },
        }
    }

    fn child_path(&self, seg: PathSeg) -> Vec<PathSeg> {
        let mut p = self.path.clone();
        p.push(seg);
        p
    }

    /// Replaces the value under `key`. The value is consumed.
    pub fn set(&mut self, key: &str, val: AttrVal) {
        let materialized = val.to_value();
        self.node.entries.insert(key.to_string(), val);
        self.ctx
            .notify_set(self.child_path(PathSeg::Key(key.to_string())), materialized);
    }

    pub fn set_int(&mut self, key: &str, v: i64) {
        self.set(key, AttrVal::Int(v));
    }

    pub fn set_float(&mut self, key: &str, v: f64) {
        self.set(key, AttrVal::Float(v));
    }

    pub fn set_str(&mut self, key: &str, v: &str) {
        self.set(key, AttrVal::Str(v.to_string()));
    }

    pub fn set_bool(&mut self, key: &str, v: bool) {
        self.set(key, AttrVal::Bool(v));
    }

    /// Removes `key`, emitting a deletion record. Returns the detached value.
    pub fn del(&mut self, key: &str) -> Option<AttrVal> {
        let removed = self.node.entries.remove(key);
        if removed.is_some() {
            self.ctx
                .notify_del(self.child_path(PathSeg::Key(key.to_string())));
        }
        removed
    }

    /// Detaches the value under `key` without a deletion record; the
    /// sub-tree may be re-attached elsewhere.
    pub fn take(&mut self, key: &str) -> Option<AttrVal> {
        self.node.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&AttrVal> {
        self.node.entries.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.node.entries.get(key) {
            Some(AttrVal::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.node.entries.get(key) {
            Some(AttrVal::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Descends into the map under `key`.
    pub fn map(&mut self, key: &str) -> Option<MapAttrRef<'_>> {
        let path = self.child_path(PathSeg::Key(key.to_string()));
        match self.node.entries.get_mut(key) {
            Some(AttrVal::Map(m)) => Some(MapAttrRef {
                node: m,
                path,
                ctx: self.ctx,
            }),
            _ => None,
        }
    }

    /// Descends into the list under `key`.
    pub fn list(&mut self, key: &str) -> Option<ListAttrRef<'_>> {
        let path = self.child_path(PathSeg::Key(key.to_string()));
        match self.node.entries.get_mut(key) {
            Some(AttrVal::List(l)) => Some(ListAttrRef {
                node: l,
                path,
                ctx: self.ctx,
            }),
            _ => None,
        }
    }
}

/// Mutable view over a list node.
pub struct ListAttrRef<'a> {
    node: &'a mut ListAttr,
    path: Vec<PathSeg>,
    ctx: AttrCtx<'a>,
}

impl ListAttrRef<'_> {
    fn child_path(&self, i: usize) -> Vec<PathSeg> {
        let mut p = self.path.clone();
        p.push(PathSeg::Index(i as u64));
        p
    }

    pub fn len(&self) -> usize {
        self.node.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node.items.is_empty()
    }

    /// Appends a value at the tail.
    pub fn push(&mut self, val: AttrVal) {
        let materialized = val.to_value();
        self.node.items.push(val);
        self.ctx
            .notify_set(self.child_path(self.node.items.len() - 1), materialized);
    }

    /// Removes and returns the tail value.
    pub fn pop(&mut self) -> Option<AttrVal> {
        let popped = self.node.items.pop();
        if popped.is_some() {
            self.ctx.notify_del(self.child_path(self.node.items.len()));
        }
        popped
    }

    /// Replaces the value at `i`; out of range is a caller error.
    pub fn set_index(&mut self, i: usize, val: AttrVal) -> anyhow::Result<()> {
        if i >= self.node.items.len() {
            anyhow::bail!("list index {} out of range {}", i, self.node.items.len());
        }
        let materialized = val.to_value();
        self.node.items[i] = val;
        self.ctx.notify_set(self.child_path(i), materialized);
        Ok(())
    }

    pub fn get(&self, i: usize) -> Option<&AttrVal> {
        self.node.items.get(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_view<'a>(
        node: &'a mut MapAttr,
        sink: &'a AttrSink,
        entity: EntityId,
        client: Option<ClientId>,
    ) -> MapAttrRef<'a> {
        MapAttrRef::root(node, entity, client, sink)
    }

    #[test]
    fn set_emits_full_path_and_materialized_value() {
        let (sink, mut rx) = AttrSink::channel();
        let entity = EntityId::new_unique();
        let client = ClientId::new_unique();
        let mut root = MapAttr::new();

        let mut view = root_view(&mut root, &sink, entity, Some(client));
        view.set("bag", AttrVal::Map(MapAttr::new()));
        let mut bag = view.map("bag").unwrap();
        bag.set("gold", AttrVal::Int(7));

        // First record: the (empty) sub-map itself.
        match rx.try_recv().unwrap() {
            AttrChange::Set { path, value, .. } => {
                assert_eq!(path, vec![PathSeg::Key("bag".into())]);
                assert_eq!(value, json!({}));
            }
            other => panic!("unexpected change {:?}", other),
        }
        // Second: nested key with the root path.
        match rx.try_recv().unwrap() {
            AttrChange::Set { path, value, .. } => {
                assert_eq!(
                    path,
                    vec![PathSeg::Key("bag".into()), PathSeg::Key("gold".into())]
                );
                assert_eq!(value, json!(7));
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn no_client_means_no_records() {
        let (sink, mut rx) = AttrSink::channel();
        let mut root = MapAttr::new();
        let mut view = root_view(&mut root, &sink, EntityId::new_unique(), None);
        view.set_int("hp", 10);
        assert!(rx.try_recv().is_err());
        assert_eq!(root.get("hp"), Some(&AttrVal::Int(10)));
    }

    #[test]
    fn list_push_pop_paths() {
        let (sink, mut rx) = AttrSink::channel();
        let entity = EntityId::new_unique();
        let client = ClientId::new_unique();
        let mut root = MapAttr::new();

        let mut view = root_view(&mut root, &sink, entity, Some(client));
        view.set("log", AttrVal::List(ListAttr::new()));
        let mut log = view.list("log").unwrap();
        log.push(AttrVal::Str("born".into()));
        assert_eq!(log.len(), 1);
        assert!(log.pop().is_some());

        rx.try_recv().unwrap(); // "log" itself
        match rx.try_recv().unwrap() {
            AttrChange::Set { path, .. } => {
                assert_eq!(path, vec![PathSeg::Key("log".into()), PathSeg::Index(0)]);
            }
            other => panic!("unexpected change {:?}", other),
        }
        match rx.try_recv().unwrap() {
            AttrChange::Del { path, .. } => {
                assert_eq!(path, vec![PathSeg::Key("log".into()), PathSeg::Index(0)]);
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn document_roundtrip() {
        let mut root = MapAttr::new();
        let (sink, _rx) = AttrSink::channel();
        let mut view = root_view(&mut root, &sink, EntityId::new_unique(), None);
        view.set_int("hp", 3);
        view.set("tags", AttrVal::List(ListAttr::new()));
        view.list("tags").unwrap().push(AttrVal::Str("npc".into()));

        let doc = root.to_value();
        let back = MapAttr::from_document(&doc);
        assert_eq!(back.to_value(), doc);
    }
}
