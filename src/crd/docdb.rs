//! The DocDB-CR: the single user-authored custom resource this operator
//! reconciles.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static DOCDB_FINALIZER: &str = "docdbs.db.example.com";

/// Generates the Kubernetes wrapper struct `DocDb` from this spec/status
/// pair. Mirrors the CRD-generation hook used throughout the kube-rs
/// operator ecosystem: `cargo run --bin crdgen | kubectl apply -f -`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "DocDb",
    group = "db.example.com",
    version = "preview",
    namespaced,
    shortname = "ddb"
)]
#[kube(status = "DocDbStatus")]
#[serde(rename_all = "camelCase")]
pub struct DocDbSpec {
    #[serde(default = "default_node_count")]
    pub node_count: i32,
    #[serde(default = "default_instances_per_node")]
    pub instances_per_node: i32,
    pub image: String,
    #[serde(default = "default_gateway_image")]
    pub gateway_image: String,
    pub storage: StorageSpec,
    pub credentials_secret_name: String,
    #[serde(default = "default_sidecar_plugin_name")]
    pub sidecar_plugin_name: String,
    #[serde(default)]
    pub expose: ExposeSpec,
    #[serde(default)]
    pub tls: TlsSpec,
    pub bootstrap: Option<BootstrapSpec>,
    pub timeouts: Option<TimeoutsSpec>,
    pub log_level: Option<String>,
    pub replication: Option<ReplicationSpec>,
}

fn default_node_count() -> i32 {
    1
}
fn default_instances_per_node() -> i32 {
    1
}
fn default_gateway_image() -> String {
    "docdb/gateway:latest".to_string()
}
fn default_sidecar_plugin_name() -> String {
    "docdb-gateway".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub size: String,
    pub class_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ExposeType {
    #[default]
    None,
    ClusterIp,
    LoadBalancer,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposeSpec {
    #[serde(rename = "type")]
    pub type_: ExposeType,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum TlsMode {
    #[default]
    Disabled,
    SelfSigned,
    CertManager,
    Provided,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default)]
    pub mode: TlsMode,
    pub cert_manager: Option<CertManagerTlsSpec>,
    pub provided: Option<ProvidedTlsSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerTlsSpec {
    pub issuer_ref: IssuerRef,
    pub secret_name: Option<String>,
    #[serde(default)]
    pub dns_names: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    pub kind: Option<String>,
    pub group: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvidedTlsSpec {
    pub secret_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    pub recovery: Option<RecoverySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySpec {
    pub backup_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutsSpec {
    pub stop_delay_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    pub primary: String,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub high_availability: bool,
    #[serde(default)]
    pub cross_cluster_transport: CrossClusterTransport,
    pub wal_replica_plugin_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub name: String,
    pub environment: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum CrossClusterTransport {
    #[default]
    Local,
    MultiCluster,
}

/// The status object of `DocDb`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocDbStatus {
    pub phase: Option<String>,
    pub connection_string: Option<String>,
    #[serde(default)]
    pub tls: TlsStatus,
    pub target_local_primary: Option<String>,
    pub local_primary: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsStatus {
    #[serde(default)]
    pub ready: bool,
    pub secret_name: Option<String>,
    pub message: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expose_type_defaults_to_none() {
        let expose = ExposeSpec::default();
        assert_eq!(expose.type_, ExposeType::None);
    }

    #[test]
    fn tls_mode_defaults_to_disabled() {
        assert_eq!(TlsSpec::default().mode, TlsMode::Disabled);
    }
}
