//! A typed mirror of the PG-Cluster custom resource produced by this
//! operator and owned by the upstream managed-Postgres operator. This
//! crate only ever reads and writes through this type; it never runs the
//! PG-Cluster's own reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[cfg_attr(test, derive(PartialEq))]
#[kube(
    kind = "PgCluster",
    group = "postgresql.example.com",
    version = "v1",
    namespaced,
    shortname = "pgc"
)]
#[kube(status = "PgClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct PgClusterSpec {
    pub instances: i32,
    pub image: String,
    pub storage: PgStorage,
    #[serde(default)]
    pub inherited_metadata: InheritedMetadata,
    #[serde(default)]
    pub plugins: Vec<PluginConfiguration>,
    #[serde(default)]
    pub postgresql: PostgresqlConfig,
    pub postgres_uid: i64,
    pub postgres_gid: i64,
    pub stop_delay: Option<i32>,
    pub bootstrap: Bootstrap,
    pub backup: Option<ClusterBackup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_clusters: Option<Vec<ExternalCluster>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_cluster: Option<ReplicaClusterConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_services: Option<Vec<ManagedService>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationConf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgStorage {
    pub size: String,
    pub storage_class: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InheritedMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfiguration {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlConfig {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub pg_hba: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Bootstrap {
    /// Fresh cluster: run `postInitSql` after `initdb`.
    InitDb { post_init_sql: Vec<String> },
    /// Restore from an existing backup.
    Recovery { backup_name: String },
    /// Stream a base backup from another PG-Cluster's external-cluster
    /// entry (used for Replica role bootstrap, see the replication
    /// projector).
    PgBaseBackup { source: String },
}

impl Default for Bootstrap {
    fn default() -> Self {
        Bootstrap::InitDb {
            post_init_sql: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBackup {
    pub target: String,
    pub volume_snapshot: Option<VolumeSnapshotBackup>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotBackup {
    pub owner_reference: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCluster {
    pub name: String,
    pub host: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaClusterConf {
    pub source: String,
    pub primary: String,
    #[serde(rename = "self")]
    pub self_: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedService {
    pub name: String,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConf {
    pub physical_slot_name: Option<String>,
    pub synchronous: Option<SynchronousReplicaConfig>,
    #[serde(default)]
    pub synchronize_slots: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynchronousReplicaConfig {
    pub method: String,
    pub number: i32,
    pub standby_names_pre: Vec<String>,
}

/// The status object of `PgCluster`, as published by the upstream
/// managed-Postgres operator. This operator only ever reads it (except for
/// the optimistic-lock status patch issued by the switchover driver).
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterStatus {
    pub phase: Option<String>,
    pub current_primary: Option<String>,
    pub target_primary: Option<String>,
    pub target_primary_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<PgClusterCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PgClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
}
