//! matchd: match allocator and fleet controller.
//!
//! Receives match requests, assigns each to a worker VM, and continuously
//! reconciles the VM pool with the cloud provider: launching capacity when
//! the fleet runs hot, terminating idle or unreachable VMs, and keeping a
//! warm minimum pool for fast match start.

pub mod api;
pub mod cloud;
pub mod config;
pub mod fleet;
pub mod matches;
pub mod registry;
pub mod scenes;
pub mod state;
pub mod worker;

pub use config::Config;
pub use fleet::{FleetController, Reconciler};
pub use state::AppState;
