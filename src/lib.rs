//! fleetborn: declarative fleet lifecycle orchestration
//!
//! A fleet file declares a group of servers (zone, instance type, image,
//! volumes, addresses) and load balancers. One `launch` run drives the live
//! fleet to that declaration: missing servers are started through a
//! strictly ordered first-boot sequence, running ones are refreshed, and
//! balancers, DNS aliases and trust-store entries are reconciled against
//! whatever came up. Host keys are admitted only after three independent
//! fingerprint sources agree.

pub mod clients;
pub mod config;
pub mod constants;
pub mod error;
pub mod reconciler;
pub mod retry;
pub mod spec;
pub mod ssh;
pub mod trust;
pub mod wait;

pub use crate::error::{Error, Result};
