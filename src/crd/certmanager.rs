//! Minimal mirrors of the `cert-manager.io` `Certificate` and `Issuer`
//! custom resources, covering only the fields the TLS controller needs to
//! read or write.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Certificate",
    group = "cert-manager.io",
    version = "v1",
    namespaced
)]
#[kube(status = "CertificateStatus")]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    #[serde(default)]
    pub dns_names: Vec<String>,
    pub duration: Option<String>,
    pub renew_before: Option<String>,
    #[serde(default)]
    pub usages: Vec<String>,
    pub issuer_ref: IssuerObjectRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct IssuerObjectRef {
    pub name: String,
    pub kind: String,
    pub group: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<CertificateCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub message: Option<String>,
}

impl CertificateStatus {
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Issuer",
    group = "cert-manager.io",
    version = "v1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    #[serde(default)]
    pub self_signed: Option<SelfSignedIssuer>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct SelfSignedIssuer {}
