//! `world_shared`
//!
//! Shared libraries used by the gate and game processes.
//!
//! Design goals:
//! - Single-loop mutation model: entity state is only ever touched by one
//!   logical event loop per process; everything here either feeds that loop
//!   (post queue, job runner, dispatcher delegate) or is safe to share.
//! - Explicit, positional wire encoding (no self-describing schema).
//! - Traits at the storage/kvdb boundary for backend injection.
//! - No `unsafe`.

pub mod config;
pub mod dispatcher;
pub mod ids;
pub mod jobs;
pub mod math;
pub mod packet;
pub mod post;
pub mod proto;
pub mod storage;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::ids::*;
    pub use crate::math::*;
    pub use crate::packet::*;
    pub use crate::proto::*;
}
