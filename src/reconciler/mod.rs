//! Declared-versus-live reconciliation
//!
//! Server reconciliation decides per server whether to run the first-boot
//! sequence or a refresh; the fleet orchestrator drives all servers of a
//! group and then reconciles the group's load balancers against whatever
//! servers completed their sequence.

use std::path::PathBuf;

mod fleet;
mod load_balancer;
mod server;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod fleet_test;
#[cfg(test)]
mod server_test;

pub use fleet::{
    BalancerOutcome, BalancerStatus, FleetOrchestrator, LaunchReport, ServerAction, ServerOutcome,
    ServerStatus,
};
pub use load_balancer::{LoadBalancerReconciler, MemberServer};
pub use server::ServerReconciler;

/// Provider-registered key pair created for one launch batch and deleted
/// once every missing server has been started
#[derive(Clone, Debug)]
pub struct TemporaryKeyPair {
    pub name: String,
    /// Private key material on disk, mode 0600
    pub key_path: PathBuf,
}
