//! # azd-app
//!
//! Local development supervisor: reads an `azure.yaml` manifest, starts
//! every declared service as a managed child process with assigned ports,
//! ingests logs, probes health, and exposes the running set over a loopback
//! HTTP dashboard plus a cross-invocation service registry.
//!
//! ## Architecture
//!
//! - **Supervisor** — owns a run's services: plan, start, readiness,
//!   steady-state tasks, ordered shutdown
//! - **PortBroker** — loopback port allocation with per-run claims
//! - **LogBuffer** — bounded per-service ring with streaming fan-out
//! - **Registry** — `.azure/services.json`, shared by every CLI invocation
//! - **Dashboard** — HTTP facade over a running supervisor
//! - **Controller** — what every non-`run` subcommand talks through

pub mod controller;
pub mod dashboard;
pub mod error;
pub mod graph;
pub mod health;
pub mod logbuf;
pub mod logfile;
pub mod logfilter;
pub mod manifest;
pub mod ports;
pub mod registry;
pub mod runner;
pub mod state;
pub mod supervisor;
