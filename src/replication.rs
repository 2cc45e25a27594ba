//! Multi-cluster replication projection: the mutations layered on top of
//! the base PG-Cluster spec (see `projector`) when a `DocDb` carries a
//! `replication` block. Keeps the same "build a spec value, `apply` it"
//! shape as `projector`, just with an extra step in between.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::Api;

use crate::crd::docdb::{CrossClusterTransport, DocDb, ReplicationSpec};
use crate::crd::multicluster::{MultiClusterService, MultiClusterServiceSpec, ServiceExport, ServiceExportSpec, ServiceImportRef};
use crate::crd::pgcluster::{
    Bootstrap, ExternalCluster, ManagedService, PgClusterSpec, ReplicaClusterConf, ReplicationConf,
    SynchronousReplicaConfig,
};
use crate::error::Result;
use crate::objects;
use crate::topology::{peer_object_name, Role};

/// The WAL-replica physical slot name (4.E): fixed, not derived per-cluster,
/// since exactly one physical slot exists per Primary regardless of which
/// cluster holds the role.
const WAL_REPLICA_SLOT_NAME: &str = "wal_replica";

/// The name this cluster gives its *own* PG-Cluster object. Per I5, once a
/// `DocDb` is replicated the PG-Cluster is named after local identity
/// rather than the `DocDb` name directly, so that every participant's
/// PG-Cluster has a distinct name even though they all reconcile from
/// copies of the same `DocDb` spec replicated to each cluster.
pub fn own_pg_cluster_name(docdb_name: &str, role: Role, local: &str) -> String {
    match role {
        Role::Single => docdb_name.to_string(),
        Role::Primary | Role::Replica | Role::Unassigned => local.to_string(),
    }
}

/// DNS host a peer's front-door service is reachable at. `Local` transport
/// assumes flat cluster networking (plain in-cluster Service DNS); a
/// `MultiCluster` transport resolves through the multi-cluster networking
/// primitive's derived DNS name instead.
fn peer_host(local: &str, peer: &str, namespace: &str, transport: &CrossClusterTransport) -> String {
    let svc_name = peer_object_name(local, peer, namespace);
    match transport {
        CrossClusterTransport::Local => format!("{svc_name}.{namespace}.svc.cluster.local"),
        CrossClusterTransport::MultiCluster => {
            format!("{svc_name}.{namespace}.svc.clusterset.local")
        }
    }
}

fn external_cluster_for_peer(
    local: &str,
    peer: &str,
    namespace: &str,
    transport: &CrossClusterTransport,
) -> ExternalCluster {
    ExternalCluster {
        name: peer_object_name(local, peer, namespace),
        host: peer_host(local, peer, namespace, transport),
    }
}

/// The local read-write service DNS name this cluster's own PG-Cluster is
/// reachable at, used for the `self` entry in `externalClusters` (4.E).
fn self_service_dns(pg_cluster_name: &str, namespace: &str) -> String {
    format!("{pg_cluster_name}-rw.{namespace}.svc.cluster.local")
}

/// Layers replication-specific fields onto a base spec already built by
/// `projector::pg_cluster_from_docdb`. `role` must not be
/// [`Role::Single`] or [`Role::Unassigned`] — callers are expected to skip
/// this step entirely in those cases (see `controller`).
pub fn apply_replication(
    mut spec: PgClusterSpec,
    repl: &ReplicationSpec,
    role: Role,
    local: &str,
    namespace: &str,
) -> PgClusterSpec {
    let peers: Vec<&str> = repl
        .participants
        .iter()
        .map(|p| p.name.as_str())
        .filter(|name| *name != local)
        .collect();

    let mut external_clusters: Vec<ExternalCluster> = vec![ExternalCluster {
        name: local.to_string(),
        host: self_service_dns(local, namespace),
    }];
    external_clusters.extend(
        peers
            .iter()
            .map(|peer| external_cluster_for_peer(local, peer, namespace, &repl.cross_cluster_transport)),
    );
    spec.external_clusters = Some(external_clusters);

    match role {
        Role::Primary => apply_primary(spec, repl, local),
        Role::Replica => apply_replica(spec, repl, local, namespace),
        Role::Single | Role::Unassigned => spec,
    }
}

fn apply_primary(mut spec: PgClusterSpec, repl: &ReplicationSpec, local: &str) -> PgClusterSpec {
    spec.inherited_metadata
        .labels
        .insert("replica-role".to_string(), "primary".to_string());
    if repl.high_availability {
        spec.instances = spec.instances.max(2);
        let required = repl.participants.len() as i32 + 1;
        spec.replication = Some(ReplicationConf {
            physical_slot_name: Some(WAL_REPLICA_SLOT_NAME.to_string()),
            synchronous: Some(SynchronousReplicaConfig {
                method: "any".to_string(),
                number: required,
                standby_names_pre: repl
                    .participants
                    .iter()
                    .filter(|p| p.name != local)
                    .map(|p| p.name.clone())
                    .collect(),
            }),
            synchronize_slots: true,
        });
        if let Some(plugin_name) = &repl.wal_replica_plugin_name {
            spec.plugins.push(crate::crd::pgcluster::PluginConfiguration {
                name: plugin_name.clone(),
                enabled: true,
                parameters: Default::default(),
            });
        }
    }
    spec
}

fn apply_replica(
    mut spec: PgClusterSpec,
    repl: &ReplicationSpec,
    local: &str,
    namespace: &str,
) -> PgClusterSpec {
    spec.inherited_metadata
        .labels
        .insert("replica-role".to_string(), "replica".to_string());

    let primary_external_name =
        external_cluster_for_peer(local, &repl.primary, namespace, &repl.cross_cluster_transport).name;
    spec.bootstrap = Bootstrap::PgBaseBackup {
        source: primary_external_name.clone(),
    };
    spec.replica_cluster = Some(ReplicaClusterConf {
        source: primary_external_name,
        primary: repl.primary.clone(),
        self_: local.to_string(),
    });
    if let Some(plugin_name) = &repl.wal_replica_plugin_name {
        spec.plugins.push(crate::crd::pgcluster::PluginConfiguration {
            name: plugin_name.clone(),
            enabled: true,
            parameters: Default::default(),
        });
    }
    spec
}

/// `managedServices` entries this cluster publishes for its peers to
/// discover, only meaningful under `MultiCluster` transport where a
/// `ServiceExport`/`MultiClusterService` pair is also created for each.
pub fn managed_services_for(repl: &ReplicationSpec, local: &str, namespace: &str) -> Vec<ManagedService> {
    if repl.cross_cluster_transport != CrossClusterTransport::MultiCluster {
        return Vec::new();
    }
    repl.participants
        .iter()
        .map(|p| p.name.as_str())
        .filter(|name| *name != local)
        .map(|peer| ManagedService {
            name: peer_object_name(local, peer, namespace),
            selector: Default::default(),
        })
        .collect()
}

/// Actually creates the `ServiceExport`/`MultiClusterService` objects the
/// `MultiCluster` transport needs for each peer's per-peer name (4.E): the
/// PG-Cluster spec's `managedServices` entry only asks the upstream
/// operator to publish a Service under that name, it does not itself make
/// that Service reachable across clusters.
pub async fn ensure_multicluster_objects(
    client: &kube::Client,
    ns: &str,
    repl: &ReplicationSpec,
    local: &str,
    owner: OwnerReference,
) -> Result<()> {
    if repl.cross_cluster_transport != CrossClusterTransport::MultiCluster {
        return Ok(());
    }
    for service_name in managed_services_for(repl, local, ns).into_iter().map(|m| m.name) {
        let exports: Api<ServiceExport> = Api::namespaced(client.clone(), ns);
        let export = ServiceExport {
            metadata: ObjectMeta {
                name: Some(service_name.clone()),
                namespace: Some(ns.to_string()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: ServiceExportSpec {},
        };
        objects::create_or_idempotent_create_service_export(&exports, export).await?;

        let imports: Api<MultiClusterService> = Api::namespaced(client.clone(), ns);
        let import = MultiClusterService {
            metadata: ObjectMeta {
                name: Some(service_name.clone()),
                namespace: Some(ns.to_string()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: MultiClusterServiceSpec {
                service_import: ServiceImportRef {
                    name: service_name,
                    namespace: ns.to_string(),
                },
            },
        };
        objects::create_or_idempotent_create_multicluster_service(&imports, import).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::docdb::{DocDbSpec, Participant, StorageSpec};

    fn doc_with_replication(repl: ReplicationSpec) -> DocDb {
        DocDb::new(
            "docs",
            DocDbSpec {
                node_count: 1,
                instances_per_node: 1,
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
                replication: Some(repl),
            },
        )
    }

    fn repl(primary: &str, participants: &[&str], ha: bool) -> ReplicationSpec {
        ReplicationSpec {
            primary: primary.to_string(),
            participants: participants
                .iter()
                .map(|p| Participant {
                    name: p.to_string(),
                    environment: None,
                })
                .collect(),
            high_availability: ha,
            cross_cluster_transport: CrossClusterTransport::Local,
            wal_replica_plugin_name: None,
        }
    }

    #[test]
    fn own_name_uses_local_identity_when_replicating() {
        assert_eq!(own_pg_cluster_name("docs", Role::Primary, "us-east"), "us-east");
        assert_eq!(own_pg_cluster_name("docs", Role::Single, "us-east"), "docs");
    }

    #[test]
    fn primary_with_ha_sets_replication_slot_and_sync() {
        let r = repl("us-east", &["us-east", "us-west"], true);
        let doc = doc_with_replication(r.clone());
        let base = crate::projector::pg_cluster_from_docdb(&doc, &Default::default());
        let spec = apply_replication(base, &r, Role::Primary, "us-east", "default");
        let conf = spec.replication.expect("replication conf set");
        assert_eq!(conf.physical_slot_name.as_deref(), Some("wal_replica"));
        let sync = conf.synchronous.expect("synchronous conf set");
        assert_eq!(sync.number, 3);
    }

    #[test]
    fn primary_without_ha_skips_replication_conf() {
        let r = repl("us-east", &["us-east", "us-west"], false);
        let doc = doc_with_replication(r.clone());
        let base = crate::projector::pg_cluster_from_docdb(&doc, &Default::default());
        let spec = apply_replication(base, &r, Role::Primary, "us-east", "default");
        assert!(spec.replication.is_none());
    }

    #[test]
    fn replica_bootstraps_from_primary_peer() {
        let r = repl("us-east", &["us-east", "us-west"], true);
        let doc = doc_with_replication(r.clone());
        let base = crate::projector::pg_cluster_from_docdb(&doc, &Default::default());
        let spec = apply_replication(base, &r, Role::Replica, "us-west", "default");
        match spec.bootstrap {
            Bootstrap::PgBaseBackup { source } => {
                assert!(source.contains("us-east"));
            }
            other => panic!("expected PgBaseBackup, got {other:?}"),
        }
        let replica_cluster = spec.replica_cluster.expect("replicaCluster set");
        assert_eq!(replica_cluster.self_, "us-west");
        assert_eq!(replica_cluster.primary, "us-east");
        assert_eq!(
            spec.inherited_metadata.labels.get("replica-role"),
            Some(&"replica".to_string())
        );
    }

    #[test]
    fn external_clusters_include_self_and_exclude_self_from_peers() {
        let r = repl("us-east", &["us-east", "us-west", "eu-central"], false);
        let doc = doc_with_replication(r.clone());
        let base = crate::projector::pg_cluster_from_docdb(&doc, &Default::default());
        let spec = apply_replication(base, &r, Role::Primary, "us-east", "default");
        let names: Vec<_> = spec
            .external_clusters
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"us-east".to_string()));
        assert!(names.contains(&"us-west".to_string()));
        assert!(names.contains(&"eu-central".to_string()));
    }

    #[test]
    fn managed_services_empty_for_local_transport() {
        let r = repl("us-east", &["us-east", "us-west"], false);
        assert!(managed_services_for(&r, "us-east", "default").is_empty());
    }

    #[test]
    fn managed_services_present_for_multicluster_transport() {
        let mut r = repl("us-east", &["us-east", "us-west"], false);
        r.cross_cluster_transport = CrossClusterTransport::MultiCluster;
        let services = managed_services_for(&r, "us-east", "default");
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "us-east-us-west");
    }
}
