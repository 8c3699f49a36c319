//! Castwave relay control plane.
//!
//! Keeps the set of active relays synchronised with two desired-state
//! inputs -- the static configuration and the master server's streamlist --
//! starting and stopping relay workers without races, waking on-demand
//! relays when local demand exists, and maintaining the peer table used to
//! redirect overflow listeners:
//! - Relay records, reconciliation and the supervising lifecycle
//! - Per-relay worker tasks pulling the upstream stream
//! - Periodic master streamlist polling
//! - Slave host registry for listener redirects
//! - The one-second control loop tying it together

pub mod control;
pub mod http;
pub mod master;
pub mod mounts;
pub mod pipeline;
pub mod relay;
pub mod slaves;
pub mod supervisor;

mod reconcile;
mod worker;

pub use control::{ControlFlags, RelaySystem, RelaySystemHandle};
pub use relay::{RelayConfig, RelayOrigin, RelayRecord};
pub use supervisor::{RelayContext, RelaySupervisor};
