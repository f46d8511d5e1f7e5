//! Everything that talks to worker agents over the network.
//!
//! - **Control calls**: [`rpc::WorkerRpc`] issues `/ping`, `/executeJob`
//!   and `/killJob` to a worker's address
//! - **Health probing**: [`HealthProber`] keeps each worker's Online/Offline
//!   state current on a timer
//!
//! # Reachability
//!
//! The default probe is a bare TCP connect to the worker's port. It says
//! nothing about whether the control endpoint is healthy. Probing with a
//! full `/ping` is available through [`ProbeStrategy::Rpc`](crate::config::ProbeStrategy)
//! but is off by default: under load it reported connection resets on
//! workers that were fine.

pub mod prober;
pub mod rpc;

pub use prober::{tcp_reachable, HealthProber, ProbeReport};
pub use rpc::{HttpWorkerRpc, RpcError, WorkerRpc};
