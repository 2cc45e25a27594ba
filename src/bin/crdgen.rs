//! Prints the CRD manifests this operator owns as YAML documents on
//! stdout. Usage: `cargo run --bin crdgen | kubectl apply -f -`.
//!
//! Only the `DocDb` CRD is generated here: `PgCluster`, `Certificate`,
//! `Issuer`, `ServiceExport` and `MultiClusterService` are owned by other
//! controllers and this operator only ever reads or writes instances of
//! them, never their schema.

use kube::CustomResourceExt;

fn main() {
    let crd = docdb_operator::crd::docdb::DocDb::crd();
    print!("{}", serde_yaml::to_string(&crd).unwrap());
}
