//! The switchover driver: moves primary role from one participant to
//! another by writing `PgCluster.status.targetPrimary` and watching for
//! the upstream managed-Postgres operator to converge `currentPrimary` to
//! match. Only the cluster currently holding the Primary role may initiate
//! one (I7); this module does not decide *when* to switch over, only how
//! to drive one that `replication.primary` in the `DocDb` spec already
//! names as having changed.

use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};

use crate::crd::pgcluster::PgCluster;
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "docdb-operator";

/// Patches the local PG-Cluster to request a promotion of `new_primary`
/// (4.G steps 1-3): sets `status.targetPrimary`, stamps
/// `status.targetPrimaryTimestamp` to now, and sets `status.phase` to
/// `Switchover`. A no-op if the PG-Cluster already targets it, so callers
/// can call this unconditionally on every reconcile pass while a switchover
/// is outstanding.
pub async fn request_switchover(
    client: &kube::Client,
    ns: &str,
    pg_cluster_name: &str,
    new_primary: &str,
) -> Result<()> {
    let api: Api<PgCluster> = Api::namespaced(client.clone(), ns);
    let current = api.get_status(pg_cluster_name).await.map_err(Error::KubeError)?;
    if current
        .status
        .as_ref()
        .and_then(|s| s.target_primary.as_deref())
        == Some(new_primary)
    {
        return Ok(());
    }

    let patch = serde_json::json!({
        "status": {
            "targetPrimary": new_primary,
            "targetPrimaryTimestamp": Utc::now(),
            "phase": "Switchover",
        }
    });
    api.patch_status(
        pg_cluster_name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// A switchover is complete once the upstream operator has converged
/// `currentPrimary` to the requested instance. Until then the caller
/// should keep requeuing rather than publish a new `DocDb.status`.
pub fn is_complete(pg_cluster: &PgCluster, expected_primary: &str) -> bool {
    pg_cluster
        .status
        .as_ref()
        .and_then(|s| s.current_primary.as_deref())
        == Some(expected_primary)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::pgcluster::PgClusterStatus;

    fn cluster_with_primary(current: Option<&str>) -> PgCluster {
        PgCluster {
            status: Some(PgClusterStatus {
                current_primary: current.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn incomplete_when_current_primary_does_not_match() {
        let cluster = cluster_with_primary(Some("us-east"));
        assert!(!is_complete(&cluster, "us-west"));
    }

    #[test]
    fn complete_once_current_primary_matches() {
        let cluster = cluster_with_primary(Some("us-west"));
        assert!(is_complete(&cluster, "us-west"));
    }

    #[test]
    fn incomplete_when_status_absent() {
        let cluster = PgCluster::default();
        assert!(!is_complete(&cluster, "us-west"));
    }
}
