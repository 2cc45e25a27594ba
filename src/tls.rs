//! Gateway TLS provisioning: the `Disabled` / `SelfSigned` / `CertManager`
//! / `Provided` modes named by `DocDbSpec.tls.mode`.
//!
//! Grounded on the cert-manager `Certificate`/`Issuer` apply pattern used
//! throughout the wider operator corpus (create-the-Issuer-if-self-signed,
//! then apply a `Certificate` pointing at it, then poll its `Ready`
//! condition) and on this operator's own `objects::delete` idiom for
//! tearing down a mode's objects when the spec moves to a different mode.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;

use crate::crd::certmanager::{
    Certificate, CertificateSpec, Issuer, IssuerObjectRef, IssuerSpec, SelfSignedIssuer,
};
use crate::crd::docdb::{DocDb, TlsMode, TlsSpec, TlsStatus};
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "docdb-operator";

/// 90 days, expressed as a cert-manager Go-duration string.
const CERT_DURATION: &str = "2160h";
/// 15 days.
const CERT_RENEW_BEFORE: &str = "360h";

fn self_signed_issuer_name(docdb_name: &str) -> String {
    format!("{docdb_name}-gw-ss")
}

fn certificate_name(docdb_name: &str) -> String {
    format!("{docdb_name}-gw")
}

/// Derives the three service DNS forms a gateway `Service` resolves under
/// in-cluster (4.C/I2): the bare short name, `name.namespace`, and the fully
/// qualified `name.namespace.svc` form, in that order.
pub fn service_dns_names(service_name: &str, namespace: &str) -> [String; 3] {
    [
        service_name.to_string(),
        format!("{service_name}.{namespace}"),
        format!("{service_name}.{namespace}.svc"),
    ]
}

/// Dedups the DNS names a `Certificate` should carry (I2), preserving
/// insertion order with user-supplied names first: duplicates are dropped
/// but the first occurrence's position is kept, so re-applying the same
/// spec never produces a spurious diff purely from reordering.
pub fn dedup_dns_names(user_supplied: &[String], derived: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for name in user_supplied.iter().chain(derived.iter()) {
        if seen.insert(name.clone()) {
            names.push(name.clone());
        }
    }
    names
}

fn certificate_secret_name(docdb_name: &str, tls: &TlsSpec) -> String {
    tls.cert_manager
        .as_ref()
        .and_then(|cm| cm.secret_name.clone())
        .unwrap_or_else(|| format!("{docdb_name}-gw-tls"))
}

/// Reconciles the TLS objects for `doc`'s current mode and returns the
/// `status.tls` block that should be published this pass. Never returns
/// stale readiness: every call re-derives `ready` from the live
/// `Certificate`/`Secret` state rather than trusting the object's previous
/// status.
pub async fn reconcile(
    client: &kube::Client,
    doc: &DocDb,
    front_door_service_name: &str,
) -> Result<TlsStatus> {
    let ns = doc.namespace().ok_or_else(|| {
        Error::UserMisconfig("DocDb must be namespaced".into())
    })?;
    let owner = crate::projector::owner_reference(doc);
    let derived_names = service_dns_names(front_door_service_name, &ns);

    match doc.spec.tls.mode {
        TlsMode::Disabled => {
            teardown(client, &ns, doc.name_any().as_str()).await?;
            Ok(TlsStatus {
                ready: false,
                secret_name: None,
                message: None,
            })
        }
        TlsMode::Provided => {
            let secret_name = doc
                .spec
                .tls
                .provided
                .as_ref()
                .map(|p| p.secret_name.clone())
                .ok_or_else(|| {
                    Error::UserMisconfig("tls.mode=Provided requires tls.provided.secretName".into())
                })?;
            let secrets: Api<k8s_openapi::api::core::v1::Secret> = Api::namespaced(client.clone(), &ns);
            let secret = crate::objects::get_secret(&secrets, &secret_name).await?;
            let ready = secret
                .as_ref()
                .and_then(|s| s.data.as_ref())
                .map(|data| data.contains_key("tls.crt") && data.contains_key("tls.key"))
                .unwrap_or(false);
            Ok(TlsStatus {
                ready,
                secret_name: Some(secret_name),
                message: Some(if ready {
                    "using provided TLS secret".to_string()
                } else {
                    "waiting for provided TLS secret".to_string()
                }),
            })
        }
        TlsMode::SelfSigned => {
            ensure_self_signed_issuer(client, &ns, &doc.name_any(), &owner).await?;
            let secret_name = format!("{}-gw-tls", doc.name_any());
            let dns_names = dedup_dns_names(&[], &derived_names);
            let issuer_ref = IssuerObjectRef {
                name: self_signed_issuer_name(&doc.name_any()),
                kind: "Issuer".to_string(),
                group: "cert-manager.io".to_string(),
            };
            apply_certificate_and_status(client, &ns, doc, &secret_name, dns_names, issuer_ref, owner)
                .await
        }
        TlsMode::CertManager => {
            let cm_spec = doc.spec.tls.cert_manager.as_ref().ok_or_else(|| {
                Error::UserMisconfig("tls.mode=CertManager requires tls.certManager".into())
            })?;
            let secret_name = certificate_secret_name(&doc.name_any(), &doc.spec.tls);
            let dns_names = dedup_dns_names(&cm_spec.dns_names, &derived_names);
            let issuer_ref = IssuerObjectRef {
                name: cm_spec.issuer_ref.name.clone(),
                kind: cm_spec
                    .issuer_ref
                    .kind
                    .clone()
                    .unwrap_or_else(|| "Issuer".to_string()),
                group: cm_spec
                    .issuer_ref
                    .group
                    .clone()
                    .unwrap_or_else(|| "cert-manager.io".to_string()),
            };
            apply_certificate_and_status(client, &ns, doc, &secret_name, dns_names, issuer_ref, owner)
                .await
        }
    }
}

async fn ensure_self_signed_issuer(
    client: &kube::Client,
    ns: &str,
    docdb_name: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let name = self_signed_issuer_name(docdb_name);
    let api: Api<Issuer> = Api::namespaced(client.clone(), ns);
    let issuer = Issuer {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: IssuerSpec {
            self_signed: Some(SelfSignedIssuer {}),
        },
    };
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&issuer))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

async fn apply_certificate_and_status(
    client: &kube::Client,
    ns: &str,
    doc: &DocDb,
    secret_name: &str,
    dns_names: Vec<String>,
    issuer_ref: IssuerObjectRef,
    owner: OwnerReference,
) -> Result<TlsStatus> {
    let name = certificate_name(&doc.name_any());
    let certs: Api<Certificate> = Api::namespaced(client.clone(), ns);
    let desired = Certificate {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: CertificateSpec {
            secret_name: secret_name.to_string(),
            dns_names,
            duration: Some(CERT_DURATION.to_string()),
            renew_before: Some(CERT_RENEW_BEFORE.to_string()),
            usages: vec!["server auth".to_string(), "client auth".to_string()],
            issuer_ref,
        },
        status: None,
    };
    certs
        .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&desired))
        .await
        .map_err(Error::KubeError)?;

    let ready = match certs.get_status(&name).await {
        Ok(existing) => existing
            .status
            .map(|s| s.is_ready())
            .unwrap_or(false),
        Err(kube::Error::Api(e)) if e.code == 404 => false,
        Err(e) => return Err(Error::KubeError(e)),
    };

    Ok(TlsStatus {
        ready,
        secret_name: Some(secret_name.to_string()),
        message: Some(if ready {
            "gateway TLS ready".to_string()
        } else {
            "waiting for Certificate to become Ready".to_string()
        }),
    })
}

async fn teardown(client: &kube::Client, ns: &str, docdb_name: &str) -> Result<()> {
    let certs: Api<Certificate> = Api::namespaced(client.clone(), ns);
    crate::objects::delete(&certs, &certificate_name(docdb_name)).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dedup_keeps_user_supplied_first_in_insertion_order() {
        let names = dedup_dns_names(
            &["zeta.example.com".into(), "alpha.example.com".into()],
            &["documentdb-service-dd".into(), "documentdb-service-dd.default".into()],
        );
        assert_eq!(
            names,
            vec![
                "zeta.example.com".to_string(),
                "alpha.example.com".to_string(),
                "documentdb-service-dd".to_string(),
                "documentdb-service-dd.default".to_string(),
            ]
        );
    }

    #[test]
    fn dedup_drops_duplicate_keeping_first_occurrence() {
        let names = dedup_dns_names(
            &["documentdb-service-dd".into()],
            &["documentdb-service-dd".into(), "documentdb-service-dd.default".into()],
        );
        assert_eq!(
            names,
            vec!["documentdb-service-dd".to_string(), "documentdb-service-dd.default".to_string()]
        );
    }

    #[test]
    fn dedup_handles_no_user_supplied_names() {
        let names = dedup_dns_names(&[], &["documentdb-service-dd".into()]);
        assert_eq!(names, vec!["documentdb-service-dd".to_string()]);
    }

    #[test]
    fn service_dns_names_derives_three_forms() {
        let names = service_dns_names("documentdb-service-dd", "default");
        assert_eq!(
            names,
            [
                "documentdb-service-dd".to_string(),
                "documentdb-service-dd.default".to_string(),
                "documentdb-service-dd.default.svc".to_string(),
            ]
        );
    }
}
