//! Minimal mirrors of the multi-cluster networking primitive's
//! `ServiceExport` and `MultiClusterService` custom resources. The
//! operator only creates these and relies on the primitive's own
//! controller to wire up cross-cluster DNS.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ServiceExport",
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    namespaced
)]
pub struct ServiceExportSpec {}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "MultiClusterService",
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterServiceSpec {
    pub service_import: ServiceImportRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportRef {
    pub name: String,
    pub namespace: String,
}
