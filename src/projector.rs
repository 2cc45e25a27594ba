//! Projects a `DocDb` spec into the PG-Cluster it owns. Grounded on the
//! `cnpg_cluster_from_cdb` family of functions in the wider operator
//! corpus, which assembles a single `ClusterSpec` out of a handful of
//! independent concerns (storage, bootstrap, plugin sidecar, runtime
//! parameters) and applies it with a forced server-side patch.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;

use crate::crd::docdb::{BootstrapSpec, DocDb, TlsStatus};
use crate::crd::pgcluster::{
    Bootstrap, ClusterBackup, InheritedMetadata, PgCluster, PgClusterSpec, PgStorage,
    PluginConfiguration, PostgresqlConfig, VolumeSnapshotBackup,
};
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "docdb-operator";
const POSTGRES_UID: i64 = 26;
const POSTGRES_GID: i64 = 26;
const CRON_DATABASE_NAME: &str = "docdb_cron";

/// Builds the desired `PgClusterSpec` for `doc`, naming the PG-Cluster
/// `pg_cluster_name` (the caller decides the name: the replication
/// projector renames it to local identity when this cluster is itself a
/// replication participant, per I5).
pub fn pg_cluster_from_docdb(
    doc: &DocDb,
    tls: &TlsStatus,
) -> PgClusterSpec {
    let mut plugins = vec![gateway_plugin(doc, tls)];
    plugins.retain(|p: &PluginConfiguration| !p.name.is_empty());

    PgClusterSpec {
        instances: doc.spec.instances_per_node.max(1),
        image: doc.spec.image.clone(),
        storage: PgStorage {
            size: doc.spec.storage.size.clone(),
            storage_class: doc.spec.storage.class_name.clone(),
        },
        inherited_metadata: InheritedMetadata {
            labels: default_labels(doc),
        },
        plugins,
        postgresql: PostgresqlConfig {
            parameters: default_postgres_parameters(doc),
            pg_hba: default_pg_hba(),
        },
        postgres_uid: POSTGRES_UID,
        postgres_gid: POSTGRES_GID,
        stop_delay: doc
            .spec
            .timeouts
            .as_ref()
            .and_then(|t| t.stop_delay_seconds),
        bootstrap: bootstrap_policy(doc.spec.bootstrap.as_ref()),
        backup: Some(ClusterBackup {
            target: "primary".to_string(),
            volume_snapshot: Some(VolumeSnapshotBackup {
                owner_reference: "backup".to_string(),
            }),
        }),
        external_clusters: None,
        replica_cluster: None,
        managed_services: None,
        replication: None,
    }
}

/// The sidecar plugin entry fronting the gateway. Its `gatewayTLSSecret`
/// parameter is only present once TLS is ready (I4): while a Certificate
/// is still issuing, the plugin must come up without a secret reference
/// that does not exist yet rather than crash-loop waiting on it.
fn gateway_plugin(doc: &DocDb, tls: &TlsStatus) -> PluginConfiguration {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "credentialsSecretName".to_string(),
        doc.spec.credentials_secret_name.clone(),
    );
    parameters.insert("gatewayImage".to_string(), doc.spec.gateway_image.clone());
    if tls.ready {
        if let Some(secret_name) = &tls.secret_name {
            parameters.insert("gatewayTLSSecret".to_string(), secret_name.clone());
        }
    }
    PluginConfiguration {
        name: doc.spec.sidecar_plugin_name.clone(),
        enabled: true,
        parameters,
    }
}

/// Mandatory inherited labels (4.D): every Pod the PG-Cluster owns carries
/// `app` (the `DocDb` name) and starts out tagged `replica-role=primary` —
/// the replication projector overrides the latter to `replica` for Replica
/// role before this spec is applied.
fn default_labels(doc: &DocDb) -> BTreeMap<String, String> {
    maplit::btreemap! {
        "app.kubernetes.io/managed-by".to_string() => "docdb-operator".to_string(),
        "docdb.example.com/instance".to_string() => doc.name_any(),
        "app".to_string() => doc.name_any(),
        "replica-role".to_string() => "primary".to_string(),
    }
}

/// Mandatory Postgres runtime parameters (4.D): replication slot/sender
/// headroom sized for the replication topology plus an idle worker, and a
/// dedicated database the gateway's cron jobs run against.
fn default_postgres_parameters(doc: &DocDb) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("max_replication_slots".to_string(), "10".to_string());
    params.insert("max_wal_senders".to_string(), "10".to_string());
    params.insert("cron.database_name".to_string(), CRON_DATABASE_NAME.to_string());
    if let Some(level) = &doc.spec.log_level {
        params.insert("log_min_messages".to_string(), level.clone());
    }
    params
}

/// `pg_hba.conf` entries covering replication and client traffic (4.D):
/// replication connections from any pod in the cluster's Service network,
/// and password-authenticated client connections from anywhere else.
fn default_pg_hba() -> Vec<String> {
    vec![
        "hostssl replication streaming_replica all cert".to_string(),
        "hostssl all all all scram-sha-256".to_string(),
    ]
}

fn bootstrap_policy(spec: Option<&BootstrapSpec>) -> Bootstrap {
    match spec.and_then(|b| b.recovery.as_ref()) {
        Some(recovery) => Bootstrap::Recovery {
            backup_name: recovery.backup_name.clone(),
        },
        None => Bootstrap::InitDb {
            post_init_sql: default_post_init_sql(),
        },
    }
}

/// Statements run once after `initdb` on a fresh cluster (4.D): install the
/// extension cascade the gateway plugin depends on, then create and
/// privilege the administrative role it connects as.
fn default_post_init_sql() -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS documentdb CASCADE;".to_string(),
        "CREATE ROLE docdb_admin WITH LOGIN CREATEROLE CREATEDB;".to_string(),
        "GRANT documentdb_admin_role TO docdb_admin;".to_string(),
        "GRANT ALL PRIVILEGES ON DATABASE postgres TO docdb_admin;".to_string(),
    ]
}

pub fn owner_reference(doc: &DocDb) -> OwnerReference {
    OwnerReference {
        api_version: "db.example.com/preview".to_string(),
        kind: "DocDb".to_string(),
        name: doc.name_any(),
        uid: doc.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Applies `spec` as the PG-Cluster named `name`, owned by `doc`. Used
/// directly for single-cluster deployments; the replication projector
/// calls this too after mutating the spec for Primary/Replica role.
pub async fn apply(
    client: &kube::Client,
    ns: &str,
    name: &str,
    doc: &DocDb,
    spec: PgClusterSpec,
) -> Result<PgCluster> {
    let api: Api<PgCluster> = Api::namespaced(client.clone(), ns);
    let desired = PgCluster {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner_reference(doc)]),
            ..Default::default()
        },
        spec,
        status: None,
    };
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&desired))
        .await
        .map_err(Error::KubeError)?;
    api.get(name).await.map_err(Error::KubeError)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::docdb::{DocDbSpec, StorageSpec};
    use kube::Resource;

    fn base_doc() -> DocDb {
        let mut doc = DocDb::new("docs", DocDbSpec {
            node_count: 3,
            instances_per_node: 2,
            image: "docdb/server:1.0".into(),
            gateway_image: "docdb/gateway:1.0".into(),
            storage: StorageSpec {
                size: "10Gi".into(),
                class_name: None,
            },
            credentials_secret_name: "docs-creds".into(),
            sidecar_plugin_name: "docdb-gateway".into(),
            expose: Default::default(),
            tls: Default::default(),
            bootstrap: None,
            timeouts: None,
            log_level: None,
            replication: None,
        });
        doc.meta_mut().namespace = Some("default".into());
        doc
    }

    #[test]
    fn instance_count_is_instances_per_node() {
        let doc = base_doc();
        let spec = pg_cluster_from_docdb(&doc, &TlsStatus::default());
        assert_eq!(spec.instances, 2);
    }

    #[test]
    fn backup_is_always_configured() {
        let doc = base_doc();
        let spec = pg_cluster_from_docdb(&doc, &TlsStatus::default());
        let backup = spec.backup.expect("backup must always be set");
        assert_eq!(backup.target, "primary");
        assert_eq!(
            backup.volume_snapshot.unwrap().owner_reference,
            "backup"
        );
    }

    #[test]
    fn default_labels_include_app_and_replica_role() {
        let doc = base_doc();
        let spec = pg_cluster_from_docdb(&doc, &TlsStatus::default());
        assert_eq!(
            spec.inherited_metadata.labels.get("app"),
            Some(&"docs".to_string())
        );
        assert_eq!(
            spec.inherited_metadata.labels.get("replica-role"),
            Some(&"primary".to_string())
        );
    }

    #[test]
    fn default_postgres_parameters_include_replication_headroom() {
        let doc = base_doc();
        let spec = pg_cluster_from_docdb(&doc, &TlsStatus::default());
        assert_eq!(
            spec.postgresql.parameters.get("max_replication_slots"),
            Some(&"10".to_string())
        );
        assert_eq!(
            spec.postgresql.parameters.get("max_wal_senders"),
            Some(&"10".to_string())
        );
        assert!(!spec.postgresql.pg_hba.is_empty());
    }

    #[test]
    fn gateway_plugin_omits_tls_secret_until_ready() {
        let doc = base_doc();
        let spec = pg_cluster_from_docdb(&doc, &TlsStatus::default());
        assert!(!spec.plugins[0].parameters.contains_key("gatewayTLSSecret"));
    }

    #[test]
    fn gateway_plugin_includes_tls_secret_once_ready() {
        let doc = base_doc();
        let tls = TlsStatus {
            ready: true,
            secret_name: Some("docs-gateway-tls".into()),
            message: None,
        };
        let spec = pg_cluster_from_docdb(&doc, &tls);
        assert_eq!(
            spec.plugins[0].parameters.get("gatewayTLSSecret"),
            Some(&"docs-gateway-tls".to_string())
        );
    }

    #[test]
    fn bootstrap_defaults_to_init_db_with_post_init_sql() {
        match bootstrap_policy(None) {
            Bootstrap::InitDb { post_init_sql } => assert!(!post_init_sql.is_empty()),
            other => panic!("expected InitDb, got {other:?}"),
        }
    }

    #[test]
    fn bootstrap_uses_recovery_when_configured() {
        let spec = BootstrapSpec {
            recovery: Some(crate::crd::docdb::RecoverySpec {
                backup_name: "nightly-1".into(),
            }),
        };
        match bootstrap_policy(Some(&spec)) {
            Bootstrap::Recovery { backup_name } => assert_eq!(backup_name, "nightly-1"),
            other => panic!("expected Recovery, got {other:?}"),
        }
    }
}
