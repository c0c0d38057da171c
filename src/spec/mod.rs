//! Declared data model: servers, load balancers and fleet groups
//!
//! Specs are immutable once built. Builders validate eagerly so that
//! configuration errors surface before any remote call is made.

mod group;
mod load_balancer;
mod server;

pub use group::{FleetGroup, FleetGroupBuilder};
pub use load_balancer::{
    default_listeners, HealthCheckConfig, Listener, LoadBalancerSpec, LoadBalancerSpecBuilder,
    Protocol, StickyCookiePolicy,
};
pub use server::{
    DiskDevice, ImageRef, InstanceState, LiveServerState, ServerSpec, ServerSpecBuilder,
};
