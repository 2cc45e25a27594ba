//! Local-cluster identity resolution and replication-role classification.
//!
//! The operator process needs to know "which participant am I" before it
//! can decide whether a `DocDb` with a `replication` block describes this
//! cluster as Primary, Replica, or an uninvolved bystander. Identity is
//! read once from a `ConfigMap` that is expected to already exist
//! (provisioned by cluster bootstrap tooling, outside this operator's
//! scope) and cached for the lifetime of the process, mirroring the
//! teacher's pattern of resolving environment-level facts once in `main`
//! and threading them through `Context` rather than re-querying per
//! reconcile.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use tokio::sync::OnceCell;

use crate::crd::docdb::ReplicationSpec;
use crate::error::{Error, Result};

const IDENTITY_NAMESPACE: &str = "kube-system";
const IDENTITY_CONFIGMAP: &str = "cluster-name";
const IDENTITY_KEY: &str = "name";

static LOCAL_IDENTITY: OnceCell<String> = OnceCell::const_new();

/// Resolves and caches this process's cluster identity from
/// `kube-system/cluster-name`. Missing or malformed identity is a fatal
/// invariant: this operator cannot safely decide primary/replica role
/// without it, and restarting will not fix a missing ConfigMap, so the
/// process should exit rather than endlessly requeue.
pub async fn local_identity(client: &kube::Client) -> Result<String> {
    LOCAL_IDENTITY
        .get_or_try_init(|| async {
            let api: Api<ConfigMap> = Api::namespaced(client.clone(), IDENTITY_NAMESPACE);
            let cm = api
                .get(IDENTITY_CONFIGMAP)
                .await
                .map_err(|_| Error::FatalInvariant)?;
            cm.data
                .as_ref()
                .and_then(|d| d.get(IDENTITY_KEY))
                .cloned()
                .filter(|name| !name.is_empty())
                .ok_or(Error::FatalInvariant)
        })
        .await
        .cloned()
}

/// The role this cluster plays with respect to a given `DocDb`'s
/// replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No `replication` block: single-cluster deployment.
    Single,
    /// `replication.primary == local identity`.
    Primary,
    /// Local identity appears in `participants` but is not primary.
    Replica,
    /// `replication` is set but local identity is absent from
    /// `participants` — this cluster has nothing to do for this object.
    Unassigned,
}

pub fn classify_role(replication: Option<&ReplicationSpec>, local: &str) -> Role {
    let Some(repl) = replication else {
        return Role::Single;
    };
    if repl.primary == local {
        return Role::Primary;
    }
    if repl.participants.iter().any(|p| p.name == local) {
        return Role::Replica;
    }
    Role::Unassigned
}

/// Exactly-one-primary-in-participants invariant (I3): the configured
/// primary must itself be listed as a participant. Violations are a user
/// misconfiguration, not a transient condition.
pub fn validate_participants(repl: &ReplicationSpec) -> Result<()> {
    if !repl.participants.iter().any(|p| p.name == repl.primary) {
        return Err(Error::UserMisconfig(format!(
            "replication.primary {:?} is not listed in replication.participants",
            repl.primary
        )));
    }
    Ok(())
}

/// Kubernetes DNS-1035 label limit; per-peer names double as Service name
/// components and must stay under it.
const MAX_NAME_LEN: usize = 63;

/// Deterministic per-peer export/import object name, derived from
/// `{local, peer, namespace}` (4.B). Collision-free under truncation: when
/// the plain `{local}-{peer}` concatenation would exceed the DNS label
/// limit, it is truncated and a short hash of all three inputs (including
/// `namespace`, which the plain concatenation omits) is appended so two
/// different namespaces with identically-truncated local/peer names still
/// resolve to distinct object names.
pub fn peer_object_name(local: &str, peer: &str, namespace: &str) -> String {
    let base = format!("{local}-{peer}");
    if base.len() <= MAX_NAME_LEN {
        return base;
    }
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (local, peer, namespace).hash(&mut hasher);
    let suffix = format!("{:x}", hasher.finish());
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    format!("{}-{}", &base[..budget.min(base.len())], suffix)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::docdb::Participant;

    fn repl(primary: &str, participants: &[&str]) -> ReplicationSpec {
        ReplicationSpec {
            primary: primary.to_string(),
            participants: participants
                .iter()
                .map(|p| Participant {
                    name: p.to_string(),
                    environment: None,
                })
                .collect(),
            high_availability: false,
            cross_cluster_transport: Default::default(),
            wal_replica_plugin_name: None,
        }
    }

    #[test]
    fn no_replication_is_single() {
        assert_eq!(classify_role(None, "us-east"), Role::Single);
    }

    #[test]
    fn local_identity_matching_primary_is_primary() {
        let r = repl("us-east", &["us-east", "us-west"]);
        assert_eq!(classify_role(Some(&r), "us-east"), Role::Primary);
    }

    #[test]
    fn local_identity_in_participants_is_replica() {
        let r = repl("us-east", &["us-east", "us-west"]);
        assert_eq!(classify_role(Some(&r), "us-west"), Role::Replica);
    }

    #[test]
    fn local_identity_absent_is_unassigned() {
        let r = repl("us-east", &["us-east", "us-west"]);
        assert_eq!(classify_role(Some(&r), "eu-central"), Role::Unassigned);
    }

    #[test]
    fn validate_participants_rejects_missing_primary() {
        let r = repl("us-east", &["us-west"]);
        assert!(validate_participants(&r).is_err());
    }

    #[test]
    fn validate_participants_accepts_primary_listed() {
        let r = repl("us-east", &["us-east", "us-west"]);
        assert!(validate_participants(&r).is_ok());
    }

    #[test]
    fn peer_object_name_is_local_dash_peer_when_short() {
        assert_eq!(peer_object_name("us-east", "us-west", "default"), "us-east-us-west");
    }

    #[test]
    fn peer_object_name_truncates_and_hashes_when_too_long() {
        let local = "a".repeat(40);
        let peer = "b".repeat(40);
        let name = peer_object_name(&local, &peer, "default");
        assert!(name.len() <= MAX_NAME_LEN);
        let other_ns = peer_object_name(&local, &peer, "other");
        assert_ne!(name, other_ns);
    }
}
