//! Client filter properties.
//!
//! Each connected client carries a small set of string properties set by
//! game servers (level, area, channel). The gate indexes them in ordered
//! trees so a filtered broadcast resolves to a client set without scanning
//! every connection.

use std::collections::{BTreeMap, HashMap, HashSet};

use world_shared::ids::ClientId;

/// Comparison applied to a filter property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    /// Parses the wire spelling (`=`, `!=`, `<`, `<=`, `>`, `>=`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            _ => None,
        }
    }
}

/// Ordered per-key indexes over client filter properties.
#[derive(Default)]
pub struct FilterTrees {
    /// key → value → clients holding that value.
    trees: HashMap<String, BTreeMap<String, HashSet<ClientId>>>,
    /// client → its current properties, for cheap removal.
    by_client: HashMap<ClientId, HashMap<String, String>>,
}

impl FilterTrees {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one property, replacing any previous value under the key.
    pub fn set(&mut self, client: ClientId, key: &str, val: &str) {
        self.clear(client, key);
        self.trees
            .entry(key.to_string())
            .or_default()
            .entry(val.to_string())
            .or_default()
            .insert(client);
        self.by_client
            .entry(client)
            .or_default()
            .insert(key.to_string(), val.to_string());
    }

    /// Clears one property of one client.
    pub fn clear(&mut self, client: ClientId, key: &str) {
        let Some(props) = self.by_client.get_mut(&client) else {
            return;
        };
        let Some(old) = props.remove(key) else {
            return;
        };
        if props.is_empty() {
            self.by_client.remove(&client);
        }
        if let Some(tree) = self.trees.get_mut(key) {
            if let Some(set) = tree.get_mut(&old) {
                set.remove(&client);
                if set.is_empty() {
                    tree.remove(&old);
                }
            }
            if tree.is_empty() {
                self.trees.remove(key);
            }
        }
    }

    /// Drops every property of a disconnecting client.
    pub fn remove_client(&mut self, client: ClientId) {
        let Some(props) = self.by_client.remove(&client) else {
            return;
        };
        for (key, val) in props {
            if let Some(tree) = self.trees.get_mut(&key) {
                if let Some(set) = tree.get_mut(&val) {
                    set.remove(&client);
                    if set.is_empty() {
                        tree.remove(&val);
                    }
                }
                if tree.is_empty() {
                    self.trees.remove(&key);
                }
            }
        }
    }

    pub fn get(&self, client: ClientId, key: &str) -> Option<&str> {
        self.by_client.get(&client)?.get(key).map(String::as_str)
    }

    /// Clients whose property under `key` compares true against `val`.
    /// String ordering; clients without the property never match.
    pub fn matching(&self, key: &str, op: FilterOp, val: &str) -> Vec<ClientId> {
        let Some(tree) = self.trees.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut collect = |set: &HashSet<ClientId>| out.extend(set.iter().copied());
        use std::ops::Bound::{Excluded, Included, Unbounded};
        match op {
            FilterOp::Eq => {
                if let Some(set) = tree.get(val) {
                    collect(set);
                }
            }
            FilterOp::Ne => {
                for (v, set) in tree {
                    if v != val {
                        collect(set);
                    }
                }
            }
            FilterOp::Lt => {
                for (_, set) in tree.range::<str, _>((Unbounded, Excluded(val))) {
                    collect(set);
                }
            }
            FilterOp::Lte => {
                for (_, set) in tree.range::<str, _>((Unbounded, Included(val))) {
                    collect(set);
                }
            }
            FilterOp::Gt => {
                for (_, set) in tree.range::<str, _>((Excluded(val), Unbounded)) {
                    collect(set);
                }
            }
            FilterOp::Gte => {
                for (_, set) in tree.range::<str, _>((Included(val), Unbounded)) {
                    collect(set);
                }
            }
        }
        out
    }
}
