//! Library surface for the DocDB operator: re-exports the modules `main`
//! and `bin/crdgen` drive, and nothing else. Kept thin deliberately so the
//! CRD-generation binary can depend on just the `crd` module without
//! pulling in the controller runtime.

pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod objects;
pub mod projector;
pub mod replication;
pub mod switchover;
pub mod telemetry;
pub mod tls;
pub mod token;
pub mod topology;
