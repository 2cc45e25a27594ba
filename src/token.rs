//! Promotion-token exchange between replication participants (4.F).
//!
//! A promotion token is a small opaque string the outgoing primary writes
//! once it has stopped accepting writes, which the incoming primary must
//! observe before it is allowed to promote. There is exactly one token
//! artifact per namespace (not one per peer): `Local` transport writes it
//! to a fixed-name `ConfigMap` both clusters can see directly; `MultiCluster`
//! transport additionally serves it over HTTP through a throwaway Pod +
//! Service + `ServiceExport`, since there is no shared namespace to write
//! into across clusters.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Pod, PodSpec, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;

use crate::crd::multicluster::{MultiClusterService, MultiClusterServiceSpec, ServiceExport, ServiceExportSpec, ServiceImportRef};
use crate::error::{Error, Result};
use crate::objects;

const CONFIGMAP_NAME: &str = "promotion-token";
const TOKEN_KEY: &str = "payload";

fn configmap_name() -> &'static str {
    CONFIGMAP_NAME
}

/// Writes `token` for this cluster's peers to read. Idempotent: calling it
/// again with the same token is a no-op write.
pub async fn publish_local(
    client: &kube::Client,
    ns: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    token: &str,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    let mut data = BTreeMap::new();
    data.insert(TOKEN_KEY.to_string(), token.to_string());
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name().to_string()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    objects::upsert_configmap(&api, cm).await
}

/// Reads the token published in this namespace through `Local` transport.
/// Returns `NotReadyYet` until the ConfigMap exists and carries a non-empty
/// value, which is the expected state while the outgoing primary is still
/// draining.
pub async fn fetch_local(client: &kube::Client, ns: &str) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    let cm = objects::get_configmap(&api, configmap_name())
        .await?
        .ok_or_else(|| Error::NotReadyYet("promotion-token ConfigMap not published yet".into()))?;
    cm.data
        .and_then(|d| d.get(TOKEN_KEY).cloned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::NotReadyYet("promotion-token ConfigMap has no payload yet".into()))
}

/// True iff the promotion-token ConfigMap exists but its `payload` is still
/// empty: published by a demoting peer but not yet filled in.
pub async fn token_update_required(client: &kube::Client, ns: &str) -> Result<bool> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    let cm = objects::get_configmap(&api, configmap_name()).await?;
    Ok(match cm {
        Some(cm) => cm
            .data
            .and_then(|d| d.get(TOKEN_KEY).cloned())
            .map(|v| v.is_empty())
            .unwrap_or(true),
        None => false,
    })
}

/// Runs the `MultiCluster` transport's serving side: writes the same
/// ConfigMap `Local` transport would, then fronts it with a Pod that serves
/// the token over plain HTTP from a `payload`-mounted ConfigMap volume, a
/// Service, and a `ServiceExport` so a peer cluster can resolve it through
/// the multi-cluster networking primitive's derived DNS.
pub async fn publish_multicluster(
    client: &kube::Client,
    ns: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    token: &str,
) -> Result<()> {
    publish_local(client, ns, owner.clone(), token).await?;

    let name = configmap_name().to_string();
    let labels = BTreeMap::from([("docdb.example.com/token-server".to_string(), name.clone())]);

    let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner.clone()]),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![Volume {
                name: "payload".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "token-server".to_string(),
                image: Some("docdb/token-server:latest".to_string()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "payload".to_string(),
                    mount_path: "/payload".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                    container_port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    };
    objects::create_or_idempotent_create_pod(&pods, pod).await?;

    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    let svc = Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(80)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    };
    objects::upsert_service(&services, svc).await?;

    let exports: Api<ServiceExport> = Api::namespaced(client.clone(), ns);
    let export = ServiceExport {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: ServiceExportSpec {},
    };
    objects::create_or_idempotent_create_service_export(&exports, export).await
}

/// Fetches the peer's token over the multi-cluster networking primitive's
/// derived DNS name, first importing the peer's `promotion-token` Service
/// via a `MultiClusterService`. Any connection failure (DNS not yet
/// propagated, connection refused because the peer's Pod is still starting)
/// is treated as `NotReadyYet` rather than a hard HTTP error, since both are
/// expected transient states during a switchover.
pub async fn fetch_multicluster(
    client: &kube::Client,
    ns: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    timeout: Duration,
) -> Result<String> {
    let name = configmap_name().to_string();
    let imports: Api<MultiClusterService> = Api::namespaced(client.clone(), ns);
    let import = MultiClusterService {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: MultiClusterServiceSpec {
            service_import: ServiceImportRef {
                name: name.clone(),
                namespace: ns.to_string(),
            },
        },
    };
    objects::create_or_idempotent_create_multicluster_service(&imports, import).await?;

    let host = format!("{name}.{ns}.svc.clusterset.local");
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(Error::HttpError)?;
    let resp = http
        .get(format!("http://{host}/payload"))
        .send()
        .await
        .map_err(|_| Error::NotReadyYet("promotion-token service not reachable yet".into()))?;
    resp.error_for_status_ref()
        .map_err(|_| Error::NotReadyYet("promotion-token service returned an error status".into()))?;
    resp.text().await.map_err(Error::HttpError)
}

/// Tears down the throwaway token-serving objects once a promotion has
/// completed and the token is no longer needed.
pub async fn teardown_multicluster(client: &kube::Client, ns: &str) -> Result<()> {
    let name = configmap_name().to_string();
    let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    let exports: Api<ServiceExport> = Api::namespaced(client.clone(), ns);
    objects::delete(&pods, &name).await?;
    objects::delete(&services, &name).await?;
    objects::delete(&exports, &name).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn configmap_name_is_fixed() {
        assert_eq!(configmap_name(), "promotion-token");
    }
}
