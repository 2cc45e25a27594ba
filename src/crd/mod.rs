//! Kubernetes object type definitions: the DocDB-CR this operator owns, and
//! typed mirrors of the external CRDs it produces or reads.

pub mod certmanager;
pub mod docdb;
pub mod multicluster;
pub mod pgcluster;

pub use docdb::{DocDb, DocDbSpec, DocDbStatus};
