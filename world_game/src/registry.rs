//! Entity type registry and RPC descriptors.
//!
//! Each entity type is registered once with a behavior factory and an
//! explicit per-method visibility table. Visibility is declared, not
//! inferred: there is no reflection over method names, and the table is a
//! plain enum checkable at the call site.

use std::collections::HashMap;

use anyhow::bail;

use crate::entity::EntityBehavior;

/// Who may invoke an entity method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcVisibility {
    /// Other servers only.
    ServerOnly,
    /// Servers plus the entity's owning client.
    OwnClient,
    /// Servers plus any client with interest in the entity.
    AllClients,
}

/// Method-name → visibility table for one entity type.
#[derive(Debug, Clone, Default)]
pub struct RpcDescMap {
    methods: HashMap<String, RpcVisibility>,
}

impl RpcDescMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: &str, visibility: RpcVisibility) -> Self {
        self.methods.insert(name.to_string(), visibility);
        self
    }

    pub fn visibility(&self, name: &str) -> Option<RpcVisibility> {
        self.methods.get(name).copied()
    }
}

pub type BehaviorFactory = Box<dyn Fn() -> Box<dyn EntityBehavior> + Send>;

struct EntityTypeDesc {
    factory: BehaviorFactory,
    rpcs: RpcDescMap,
}

/// Registry of entity types, owned by the game service (never global).
#[derive(Default)]
pub struct EntityTypeRegistry {
    types: HashMap<String, EntityTypeDesc>,
}

impl EntityTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type. Must be called exactly once per type name before
    /// any instance is created; a duplicate is an error and the first
    /// registration stays in force.
    pub fn register(
        &mut self,
        type_name: &str,
        factory: impl Fn() -> Box<dyn EntityBehavior> + Send + 'static,
        rpcs: RpcDescMap,
    ) -> anyhow::Result<()> {
        if self.types.contains_key(type_name) {
            bail!("entity type {:?} already registered", type_name);
        }
        self.types.insert(
            type_name.to_string(),
            EntityTypeDesc {
                factory: Box::new(factory),
                rpcs,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn instantiate(&self, type_name: &str) -> Option<Box<dyn EntityBehavior>> {
        self.types.get(type_name).map(|d| (d.factory)())
    }

    pub fn rpc_visibility(&self, type_name: &str, method: &str) -> Option<RpcVisibility> {
        self.types.get(type_name)?.rpcs.visibility(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityCore;

    struct Husk;
    impl EntityBehavior for Husk {
        fn on_call(
            &mut self,
            _e: &mut EntityCore,
            _method: &str,
            _args: &[serde_json::Value],
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut reg = EntityTypeRegistry::new();
        let first = RpcDescMap::new().method("Ping", RpcVisibility::OwnClient);
        reg.register("Avatar", || Box::new(Husk), first).unwrap();
        assert!(reg
            .register("Avatar", || Box::new(Husk), RpcDescMap::new())
            .is_err());
        // First registration stays in force.
        assert_eq!(
            reg.rpc_visibility("Avatar", "Ping"),
            Some(RpcVisibility::OwnClient)
        );
    }
}
