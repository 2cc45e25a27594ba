//! The top-level reconciler: wires the leaf modules together into the
//! per-`DocDb` reconcile sequence and owns the `Controller` run loop.
//!
//! Grounded on the `Context`/`State`/`Diagnostics` split and
//! `Controller::new(...).shutdown_on_signal().run(...)` pattern used
//! throughout the wider operator corpus (CoreDB, NeonCluster), with one
//! addition: reconciles across all `DocDb` objects are serialized behind a
//! single process-wide mutex, since the replication projector reads and
//! writes identity-scoped cross-object state (promotion tokens, switchover
//! requests) that is not safe to interleave.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec, Role, RoleBinding, Secret, ServiceAccount};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::{watcher, Controller};
use kube::{Resource, ResourceExt};
use prometheus::Registry;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::docdb::{CrossClusterTransport, DocDb, DocDbStatus, ReplicationSpec, DOCDB_FINALIZER};
use crate::crd::pgcluster::PgCluster;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::objects;
use crate::projector;
use crate::replication;
use crate::switchover;
use crate::telemetry;
use crate::tls;
use crate::topology::{self, Role as ReplicationRole};

const FIELD_MANAGER: &str = "docdb-operator";

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: kube::Client,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub local_identity: String,
    pub config: RunConfig,
    /// Serializes reconciles across all `DocDb` objects. See the module
    /// doc comment for why this can't just be per-object.
    pub reconcile_lock: Mutex<()>,
}

/// Operator-wide tunables, sourced from CLI flags in `main`.
#[derive(Clone, Copy, Debug)]
pub struct RunConfig {
    pub requeue_short: Duration,
    pub requeue_long: Duration,
    pub poll_interval: Duration,
    pub token_fetch_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            requeue_short: Duration::from_secs(10),
            requeue_long: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            token_fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "docdb-operator".into(),
        }
    }
}

impl Diagnostics {
    fn recorder(&self, client: kube::Client, reference: k8s_openapi::api::core::v1::ObjectReference) -> Recorder {
        Recorder::new(client, self.reporter.clone(), reference)
    }
}

/// Top-level operator state: the metrics registry plus a read side for the
/// `/healthz` and `/metrics` endpoints served out-of-band by `main`.
#[derive(Clone, Default)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: Registry,
}

impl State {
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub async fn last_event(&self) -> DateTime<Utc> {
        self.diagnostics.read().await.last_event
    }

    fn to_context(&self, client: kube::Client, local_identity: String, config: RunConfig) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
            local_identity,
            config,
            reconcile_lock: Mutex::new(()),
        })
    }
}

#[instrument(skip(ctx, doc), fields(trace_id = %telemetry::get_trace_id()))]
async fn reconcile(doc: Arc<DocDb>, ctx: Arc<Context>) -> Result<Action> {
    let _permit = ctx.reconcile_lock.lock().await;
    let _timer = ctx.metrics.count_and_measure(doc.namespace().as_deref().unwrap_or("default"));
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = doc.namespace().ok_or_else(|| Error::UserMisconfig("DocDb must be namespaced".into()))?;
    let docdb_api: Api<DocDb> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&docdb_api, DOCDB_FINALIZER, doc, |event| async {
        match event {
            Finalizer::Apply(doc) => apply(&doc, &ctx, &ns).await,
            Finalizer::Cleanup(doc) => cleanup(&doc, &ctx, &ns).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[instrument(skip(doc, ctx))]
async fn apply(doc: &DocDb, ctx: &Context, ns: &str) -> Result<Action> {
    info!(docdb = %doc.name_any(), "reconciling");

    let role = topology::classify_role(doc.spec.replication.as_ref(), &ctx.local_identity);
    if let Some(repl) = &doc.spec.replication {
        topology::validate_participants(repl)?;
    }
    if matches!(role, ReplicationRole::Unassigned) {
        debug!(docdb = %doc.name_any(), "this cluster is not a participant, skipping object reconciliation");
        return Ok(Action::requeue(ctx.config.requeue_long));
    }

    let front_door_name = format!("documentdb-service-{}", doc.name_any());
    let front_door_ip = ensure_front_door_service(ctx, doc, ns, &front_door_name).await?;
    ensure_rbac(ctx, doc, ns).await?;

    let tls_status = tls::reconcile(&ctx.client, doc, &front_door_name).await?;

    let mut pg_spec = projector::pg_cluster_from_docdb(doc, &tls_status);
    let pg_cluster_name = match (role, &doc.spec.replication) {
        (ReplicationRole::Primary | ReplicationRole::Replica, Some(repl)) => {
            pg_spec = replication::apply_replication(pg_spec, repl, role, &ctx.local_identity, ns);
            pg_spec.managed_services = {
                let services = replication::managed_services_for(repl, &ctx.local_identity, ns);
                (!services.is_empty()).then_some(services)
            };
            replication::ensure_multicluster_objects(
                &ctx.client,
                ns,
                repl,
                &ctx.local_identity,
                projector::owner_reference(doc),
            )
            .await?;
            replication::own_pg_cluster_name(&doc.name_any(), role, &ctx.local_identity)
        }
        _ => doc.name_any(),
    };

    let existing_pg_cluster = get_pg_cluster(ctx, ns, &pg_cluster_name).await?;
    let pg_cluster = projector::apply(&ctx.client, ns, &pg_cluster_name, doc, pg_spec).await?;

    if let (ReplicationRole::Primary | ReplicationRole::Replica, Some(repl)) = (role, &doc.spec.replication) {
        maybe_exchange_promotion_token(ctx, doc, ns, repl, role, existing_pg_cluster.as_ref()).await?;
    }

    let healthy = pg_cluster.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(HEALTHY_PHASE);
    if healthy && matches!(role, ReplicationRole::Single | ReplicationRole::Primary) {
        ensure_document_admin_grant_job(ctx, doc, ns).await?;
    }

    let local_primary = if let (ReplicationRole::Primary, Some(_)) = (role, &doc.spec.replication) {
        maybe_drive_switchover(ctx, doc, ns, &pg_cluster_name, &pg_cluster).await?
    } else {
        doc.status.as_ref().and_then(|s| s.local_primary.clone())
    };

    let status = build_status(ctx, doc, ns, &tls_status, &pg_cluster, front_door_ip, local_primary).await?;
    publish_status(ctx, doc, ns, status).await?;

    Ok(Action::requeue(ctx.config.poll_interval))
}

/// The CloudNativePG-style phase string gating both the connection string
/// and the document-admin grant Job (4.H steps 8-9).
const HEALTHY_PHASE: &str = "Cluster in healthy state";

/// Runs once per `DocDb`, idempotent via a fixed Job name: grants the
/// document-admin role to the physical-replication role so the gateway's
/// admin connection can read the streaming-replication user's objects
/// (4.H step 9). `AlreadyExists` is tolerated so this is safe to call on
/// every healthy-Primary reconcile.
async fn ensure_document_admin_grant_job(ctx: &Context, doc: &DocDb, ns: &str) -> Result<()> {
    let name = format!("{}-document-admin-grant", doc.name_any());
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    let job = Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![projector::owner_reference(doc)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "grant".to_string(),
                        image: Some(doc.spec.image.clone()),
                        command: Some(vec![
                            "psql".to_string(),
                            "-c".to_string(),
                            "GRANT documentdb_admin_role TO streaming_replica;".to_string(),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            backoff_limit: Some(3),
            ..Default::default()
        }),
        status: None,
    };
    objects::create_or_idempotent_create_job(&api, job).await
}

async fn get_pg_cluster(ctx: &Context, ns: &str, name: &str) -> Result<Option<PgCluster>> {
    let api: Api<PgCluster> = Api::namespaced(ctx.client.clone(), ns);
    match api.get(name).await {
        Ok(cluster) => Ok(Some(cluster)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Component F: the cross-cluster promotion-token handoff. Separate from
/// the within-cluster switchover driver (component G) below — this module
/// never touches `PgCluster.status.targetPrimary`, it only publishes and
/// observes the token that gates an incoming primary's promotion.
///
/// A Replica always (re-)publishes its own demote token; the write is
/// idempotent and only ever consumed by a peer that is actually promoting.
/// A Primary applies the ordering rule (4.F): it may promote immediately if
/// the PG-Cluster did not previously replicate from another participant
/// (fresh bootstrap, or the old primary already dropped out of
/// `participants`), otherwise it must first observe a token from the
/// participant its own PG-Cluster spec most recently named as `source`.
async fn maybe_exchange_promotion_token(
    ctx: &Context,
    doc: &DocDb,
    ns: &str,
    repl: &ReplicationSpec,
    role: ReplicationRole,
    existing_pg_cluster: Option<&PgCluster>,
) -> Result<()> {
    let owner = projector::owner_reference(doc);
    match role {
        ReplicationRole::Replica => {
            let token = format!("{}-{}", doc.name_any(), ctx.local_identity);
            match repl.cross_cluster_transport {
                CrossClusterTransport::Local => {
                    crate::token::publish_local(&ctx.client, ns, owner, &token).await
                }
                CrossClusterTransport::MultiCluster => {
                    crate::token::publish_multicluster(&ctx.client, ns, owner, &token).await
                }
            }
        }
        ReplicationRole::Primary => {
            let previous_source = existing_pg_cluster
                .and_then(|c| c.spec.replica_cluster.as_ref())
                .map(|rc| rc.primary.clone());
            let Some(previous_primary) = previous_source else {
                return Ok(());
            };
            if previous_primary == ctx.local_identity {
                return Ok(());
            }
            if !repl.participants.iter().any(|p| p.name == previous_primary) {
                debug!(docdb = %doc.name_any(), previous_primary = %previous_primary, "old primary no longer a participant, forced promote");
                return Ok(());
            }
            let observed = match repl.cross_cluster_transport {
                CrossClusterTransport::Local => crate::token::fetch_local(&ctx.client, ns).await?,
                CrossClusterTransport::MultiCluster => {
                    crate::token::fetch_multicluster(&ctx.client, ns, owner, ctx.config.token_fetch_timeout).await?
                }
            };
            debug!(docdb = %doc.name_any(), previous_primary = %previous_primary, token = %observed, "observed promotion token from outgoing primary");
            Ok(())
        }
        ReplicationRole::Single | ReplicationRole::Unassigned => Ok(()),
    }
}

/// Component G: the within-cluster switchover driver (4.G). Triggered when
/// `doc.status.targetLocalPrimary` names a Pod other than the one the local
/// PG-Cluster currently reports as primary; only runs while this cluster
/// holds the Primary role, and only once the requested Pod actually exists
/// in this namespace. Returns the `status.localPrimary` value to publish
/// this pass: the previous value until the switchover completes, then the
/// newly-converged primary.
async fn maybe_drive_switchover(
    ctx: &Context,
    doc: &DocDb,
    ns: &str,
    pg_cluster_name: &str,
    pg_cluster: &PgCluster,
) -> Result<Option<String>> {
    let local_primary = doc.status.as_ref().and_then(|s| s.local_primary.clone());
    let target = doc.status.as_ref().and_then(|s| s.target_local_primary.clone());

    let Some(target) = target else {
        return Ok(local_primary);
    };
    let current_target = pg_cluster.status.as_ref().and_then(|s| s.target_primary.clone());
    if current_target.as_deref() == Some(target.as_str()) {
        if switchover::is_complete(pg_cluster, &target) {
            return Ok(Some(target));
        }
        return Ok(local_primary);
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    if !objects::pod_exists(&pods, &target).await? {
        warn!(docdb = %doc.name_any(), target = %target, "switchover target Pod does not exist yet, not requesting promotion");
        return Ok(local_primary);
    }

    switchover::request_switchover(&ctx.client, ns, pg_cluster_name, &target).await?;
    Ok(local_primary)
}

async fn cleanup(doc: &DocDb, ctx: &Context, ns: &str) -> Result<Action> {
    info!(docdb = %doc.name_any(), "cleaning up");
    let recorder = {
        let diag = ctx.diagnostics.read().await;
        diag.recorder(ctx.client.clone(), doc.object_ref(&()))
    };
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: "Deleting".into(),
            note: Some(format!("deleting resources owned by {}", doc.name_any())),
            action: "Deleting".into(),
            secondary: None,
        })
        .await
        .map_err(Error::KubeError)?;

    if let Some(repl) = &doc.spec.replication {
        if repl.cross_cluster_transport == CrossClusterTransport::MultiCluster {
            crate::token::teardown_multicluster(&ctx.client, ns).await?;
        }
    }
    // PgCluster, the front-door Service, Certificate/Issuer and RBAC
    // objects all carry an owner reference back to this DocDb and are
    // garbage-collected by the API server; only the cross-cluster token
    // transport above needs an explicit teardown here.
    Ok(Action::await_change())
}

/// Upserts the front-door Service (4.H step 3) and returns its resolved
/// ingress address. Propagates `NotReadyYet` while the address is still
/// unassigned, which the reconciler's error policy turns into a short
/// requeue rather than a long one.
async fn ensure_front_door_service(ctx: &Context, doc: &DocDb, ns: &str, name: &str) -> Result<Option<String>> {
    if doc.spec.expose.type_ == crate::crd::docdb::ExposeType::None {
        return Ok(None);
    }
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
    let svc_type = match doc.spec.expose.type_ {
        crate::crd::docdb::ExposeType::ClusterIp => "ClusterIP",
        crate::crd::docdb::ExposeType::LoadBalancer => "LoadBalancer",
        crate::crd::docdb::ExposeType::None => unreachable!(),
    };
    let mut selector = std::collections::BTreeMap::new();
    selector.insert("cnpg.io/cluster".to_string(), doc.name_any());
    selector.insert("cnpg.io/instanceRole".to_string(), "primary".to_string());

    let svc = Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![projector::owner_reference(doc)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(svc_type.to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: 10260,
                target_port: Some(IntOrString::Int(10260)),
                name: Some("documentdb".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    };
    let created = objects::upsert_service(&api, svc).await?;
    Ok(Some(objects::ensure_external_ip(&created)?))
}

/// A minimal RBAC footprint granting the gateway sidecar read access to its
/// own credentials secret. Named exactly after the `DocDb` (S6), created
/// once and left alone on subsequent reconciles; spec changes here are
/// intentionally not diffed since the role's permissions are fixed
/// regardless of `DocDb` contents.
async fn ensure_rbac(ctx: &Context, doc: &DocDb, ns: &str) -> Result<()> {
    let name = doc.name_any();
    let owner = projector::owner_reference(doc);

    let sa_api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), ns);
    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        ..Default::default()
    };
    objects::create_or_idempotent_create_service_account(&sa_api, sa).await?;

    let role_api: Api<Role> = Api::namespaced(ctx.client.clone(), ns);
    let role = Role {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        rules: Some(vec![k8s_openapi::api::rbac::v1::PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![doc.spec.credentials_secret_name.clone()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
    };
    objects::create_or_idempotent_create_role(&role_api, role).await?;

    let rb_api: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), ns);
    let rb = RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        role_ref: k8s_openapi::api::rbac::v1::RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![k8s_openapi::api::rbac::v1::Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(ns.to_string()),
            ..Default::default()
        }]),
    };
    objects::create_or_idempotent_create_role_binding(&rb_api, rb).await
}

async fn build_status(
    ctx: &Context,
    doc: &DocDb,
    ns: &str,
    tls_status: &crate::crd::docdb::TlsStatus,
    pg_cluster: &PgCluster,
    front_door_ip: Option<String>,
    local_primary: Option<String>,
) -> Result<DocDbStatus> {
    let phase = match pg_cluster.status.as_ref().and_then(|s| s.phase.clone()) {
        Some(phase) => phase,
        None => "Pending".to_string(),
    };

    let connection_string = match &front_door_ip {
        Some(host) => Some(connection_string(ctx, ns, doc, host, tls_status.ready).await?),
        None => None,
    };

    Ok(DocDbStatus {
        phase: Some(phase),
        connection_string,
        tls: tls_status.clone(),
        target_local_primary: doc.status.as_ref().and_then(|s| s.target_local_primary.clone()),
        local_primary,
    })
}

/// `<scheme>://<user>:<pass>@<host>:10260/?tls=true&replicaSet=rs0&...`
/// (4.F environment contract); the `tls=true` flag is present only once
/// gateway TLS has actually converged, never just because a TLS mode is
/// configured.
async fn connection_string(ctx: &Context, ns: &str, doc: &DocDb, host: &str, tls_ready: bool) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let secret = objects::get_secret(&secrets, &doc.spec.credentials_secret_name)
        .await?
        .ok_or_else(|| {
            Error::UserMisconfig(format!(
                "credentials secret {:?} does not exist",
                doc.spec.credentials_secret_name
            ))
        })?;
    let data = secret.data.unwrap_or_default();
    let username = secret_field(&data, "username")?;
    let password = secret_field(&data, "password")?;

    let tls_query = if tls_ready { "tls=true&" } else { "" };
    Ok(format!(
        "mongodb://{username}:{password}@{host}:10260/?{tls_query}replicaSet=rs0&readPreference=primary"
    ))
}

fn secret_field(data: &std::collections::BTreeMap<String, k8s_openapi::ByteString>, key: &str) -> Result<String> {
    data.get(key)
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .ok_or_else(|| Error::UserMisconfig(format!("credentials secret is missing key {key:?}")))
}

async fn publish_status(ctx: &Context, doc: &DocDb, ns: &str, status: DocDbStatus) -> Result<()> {
    let api: Api<DocDb> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({ "status": status });
    api.patch_status(&doc.name_any(), &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

fn error_policy(doc: Arc<DocDb>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(docdb = %doc.name_any(), error = %error, "reconcile failed");
    ctx.metrics
        .reconcile_failure(doc.namespace().as_deref().unwrap_or("default"), &doc.name_any(), error);
    if error.is_transient() {
        Action::requeue(ctx.config.requeue_short)
    } else {
        // USER-MISCONFIG / FATAL-INVARIANT: requeue slowly so a later spec
        // edit is still picked up without hot-looping against an error the
        // user cannot fix by waiting.
        Action::requeue(ctx.config.requeue_long)
    }
}

/// Runs the controller loop until the process receives a shutdown signal.
pub async fn run(state: State, client: kube::Client, local_identity: String, config: RunConfig) {
    let docdb = Api::<DocDb>::all(client.clone());
    if let Err(e) = docdb.list(&Default::default()).await {
        error!("failed to list DocDb CRD, is it installed? {e}");
        std::process::exit(1);
    }

    let ctx = state.to_context(client.clone(), local_identity, config);
    Controller::new(docdb, watcher::Config::default())
        .owns(Api::<PgCluster>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
