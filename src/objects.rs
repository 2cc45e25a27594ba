//! Idempotent create-or-update and delete helpers for the handful of
//! Kubernetes object kinds the reconciler manages directly. No in-process
//! caching happens here beyond what the ambient `kube::Client` reflector
//! cache already provides.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Pod, Role, RoleBinding, Secret, Service, ServiceAccount,
};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Resource;

use crate::crd::multicluster::{MultiClusterService, ServiceExport};
use crate::error::{Error, Result};

/// Creates `desired` if absent, otherwise returns the object that is
/// already there. CoreDB/NeonCluster in the wider operator corpus use this
/// "get_opt, then create" shape in preference to a server-side apply when
/// the object's desired state is only meaningful at creation time (RBAC,
/// Services fronting a fixed selector).
pub async fn upsert_service(api: &Api<Service>, desired: Service) -> Result<Service> {
    let name = desired.meta().name.clone().expect("Service must be named");
    match api.get(&name).await {
        Ok(existing) => Ok(existing),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            api.create(&PostParams::default(), &desired).await.map_err(Error::KubeError)
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Reads the externally-visible address of a Service created by
/// [`upsert_service`]. For `ClusterIP` services this is `spec.clusterIP`;
/// for `LoadBalancer` services it is the first ingress IP or hostname.
/// Returns `Error::NotReadyYet` when the address has not been assigned,
/// which the reconciler treats as "requeue short".
pub fn ensure_external_ip(svc: &Service) -> Result<String> {
    let spec = svc.spec.as_ref();
    let is_lb = spec
        .and_then(|s| s.type_.as_deref())
        .map(|t| t == "LoadBalancer")
        .unwrap_or(false);

    if is_lb {
        let ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first());
        match ingress.and_then(|i| i.ip.clone().or_else(|| i.hostname.clone())) {
            Some(addr) => Ok(addr),
            None => Err(Error::NotReadyYet(
                "waiting for LoadBalancer ingress address".into(),
            )),
        }
    } else {
        spec.and_then(|s| s.cluster_ip.clone())
            .filter(|ip| ip != "None")
            .ok_or_else(|| Error::NotReadyYet("waiting for ClusterIP assignment".into()))
    }
}

/// Creates `desired` and tolerates `AlreadyExists`; any other error is
/// propagated.
pub async fn create_or_idempotent_create_role(api: &Api<Role>, desired: Role) -> Result<()> {
    create_idempotent(api, desired).await
}

pub async fn create_or_idempotent_create_service_account(
    api: &Api<ServiceAccount>,
    desired: ServiceAccount,
) -> Result<()> {
    create_idempotent(api, desired).await
}

pub async fn create_or_idempotent_create_role_binding(
    api: &Api<RoleBinding>,
    desired: RoleBinding,
) -> Result<()> {
    create_idempotent(api, desired).await
}

pub async fn create_or_idempotent_create_configmap(
    api: &Api<ConfigMap>,
    desired: ConfigMap,
) -> Result<()> {
    create_idempotent(api, desired).await
}

pub async fn create_or_idempotent_create_pod(api: &Api<Pod>, desired: Pod) -> Result<()> {
    create_idempotent(api, desired).await
}

/// Creates a one-shot `Job` and tolerates `AlreadyExists`: the Job's name is
/// fixed per `DocDb` so re-issuing the grant on every healthy-Primary
/// reconcile is a no-op once it has run once.
pub async fn create_or_idempotent_create_job(api: &Api<Job>, desired: Job) -> Result<()> {
    create_idempotent(api, desired).await
}

pub async fn create_or_idempotent_create_service_export(
    api: &Api<ServiceExport>,
    desired: ServiceExport,
) -> Result<()> {
    create_idempotent(api, desired).await
}

pub async fn create_or_idempotent_create_multicluster_service(
    api: &Api<MultiClusterService>,
    desired: MultiClusterService,
) -> Result<()> {
    create_idempotent(api, desired).await
}

async fn create_idempotent<K>(api: &Api<K>, desired: K) -> Result<()>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), &desired).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Upserts a ConfigMap: creates it if absent, otherwise replaces its data.
/// Used by the promotion-token transport, where the same ConfigMap is
/// written by demote and read by promote across reconciles.
pub async fn upsert_configmap(api: &Api<ConfigMap>, desired: ConfigMap) -> Result<()> {
    let name = desired.meta().name.clone().expect("ConfigMap must be named");
    match api.get(&name).await {
        Ok(_) => {
            api.replace(&name, &PostParams::default(), &desired)
                .await
                .map_err(Error::KubeError)?;
            Ok(())
        }
        Err(kube::Error::Api(e) ) if e.code == 404 => create_idempotent(api, desired).await,
        Err(e) => Err(Error::KubeError(e)),
    }
}

pub async fn get_secret(api: &Api<Secret>, name: &str) -> Result<Option<Secret>> {
    match api.get(name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

pub async fn get_configmap(api: &Api<ConfigMap>, name: &str) -> Result<Option<ConfigMap>> {
    match api.get(name).await {
        Ok(cm) => Ok(Some(cm)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// True iff a Pod named `name` currently exists in this namespace. Used by
/// the switchover driver's precondition that a requested target Pod must
/// actually exist before a promotion is requested against it.
pub async fn pod_exists(api: &Api<Pod>, name: &str) -> Result<bool> {
    match api.get(name).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Deletes an object of kind `K` named `name`, tolerating `NotFound`.
pub async fn delete<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };

    fn lb_service(ip: Option<&str>, hostname: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: ip.map(str::to_string),
                        hostname: hostname.map(str::to_string),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn load_balancer_ip_ready() {
        let svc = lb_service(Some("1.2.3.4"), None);
        assert_eq!(ensure_external_ip(&svc).unwrap(), "1.2.3.4");
    }

    #[test]
    fn load_balancer_hostname_fallback() {
        let svc = lb_service(None, Some("lb.example.com"));
        assert_eq!(ensure_external_ip(&svc).unwrap(), "lb.example.com");
    }

    #[test]
    fn load_balancer_not_ready() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(ensure_external_ip(&svc), Err(Error::NotReadyYet(_))));
    }

    #[test]
    fn cluster_ip_ready() {
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.5".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ensure_external_ip(&svc).unwrap(), "10.0.0.5");
    }
}
