//! `world_game`
//!
//! Game-process runtime:
//! - Entity types, behaviors and the entity manager
//! - Spaces with sweep-list area-of-interest tracking
//! - Synchronized attribute trees
//! - Timers, dispatched from the fixed game tick
//! - The single-mutator game loop fed by the dispatcher connection
//!
//! Concurrency model: one loop per process owns all entity state. Blocking
//! work goes through job groups or the storage queue and re-enters the
//! loop as posted callbacks.

pub mod aoi;
pub mod attr;
pub mod entity;
pub mod game;
pub mod registry;
pub mod space;
pub mod timer;

pub use entity::{EntityBehavior, EntityCore, EntityManager};
pub use game::GameService;
pub use registry::{EntityTypeRegistry, RpcDescMap, RpcVisibility};
