//! `world_gate`
//!
//! Gate-process runtime:
//! - Accepts client TCP connections and assigns client ids
//! - Bridges client calls to the dispatcher, stamped with identity
//! - Relays redirect messages from servers to the addressed client
//! - Maintains client filter-property trees for filtered broadcasts

pub mod filter;
pub mod gate;

pub use gate::{bind_ephemeral, GateService};
