//! Read-only cluster observation, plus the single cluster write
//!
//! Everything the controller learns from the Kubernetes API comes through
//! here: the statefulset's target revision and partition, the per-pod
//! controller revisions and container digests, and a self-subject access
//! review confirming the app was deployed with `--trust`. The only write is
//! the partition merge patch.

use crate::{Error, Result, UnitId};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    core::NamespaceResourceScope,
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

/// Pod label carrying the revision of the template that produced the pod
pub const CONTROLLER_REVISION_LABEL: &str = "controller-revision-hash";

/// Kubernetes interface for one application's statefulset and pods
#[derive(Clone)]
pub struct ClusterProbe {
    /// Kubernetes interface
    pub client: kube::Client,
    /// The Juju application name; also the statefulset name and pod label value
    pub app: String,
    /// Namespace of the app (if different than context namespace)
    pub namespace: Option<String>,
}

// helpers to do kube api queries
impl ClusterProbe {
    fn ns<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned,
    {
        if let Some(ns) = &self.namespace {
            Api::namespaced(self.client.clone(), ns)
        } else {
            Api::default_namespaced(self.client.clone())
        }
    }

    fn namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| self.client.default_namespace().to_string())
    }

    pub async fn statefulset(&self) -> Result<StatefulSetState> {
        let sts = self.ns::<StatefulSet>().get(&self.app).await.map_err(Error::Kube)?;
        StatefulSetState::try_from(sts)
    }

    /// All pods of the app, by the standard name label
    pub async fn pods(&self) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&format!("app.kubernetes.io/name={}", self.app));
        let pods = self.ns::<Pod>().list(&lp).await.map_err(Error::Kube)?;
        Ok(pods.items)
    }

    /// Whether this pod's service account may patch the statefulset
    ///
    /// Denied means the app was deployed without `--trust`; the controller
    /// must not proceed, since it could observe a refresh it cannot gate.
    pub async fn patch_allowed(&self) -> Result<bool> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some("apps".to_string()),
                    resource: Some("statefulsets".to_string()),
                    verb: Some("patch".to_string()),
                    namespace: Some(self.namespace()),
                    name: Some(self.app.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await.map_err(Error::Kube)?;
        let allowed = response.status.map(|s| s.allowed).unwrap_or(false);
        debug!("self subject access review for patch statefulset/{}: allowed={allowed}", self.app);
        Ok(allowed)
    }

    /// Patch `spec.updateStrategy.rollingUpdate.partition`
    pub async fn set_partition(&self, partition: u32) -> Result<()> {
        let patch = json!({
            "spec": {"updateStrategy": {"rollingUpdate": {"partition": partition}}}
        });
        self.ns::<StatefulSet>()
            .patch(&self.app, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::Kube)?;
        info!("set statefulset partition to {partition} for {}", self.app);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// statefulset inspection

/// The statefulset fields the refresh state machine runs on
#[derive(Debug, Clone)]
pub struct StatefulSetState {
    /// `status.updateRevision`: the revision `juju refresh` is rolling out
    pub update_revision: String,
    /// `spec.updateStrategy.rollingUpdate.partition`
    pub partition: u32,
    pub replicas: i32,
}

impl TryFrom<StatefulSet> for StatefulSetState {
    type Error = Error;

    fn try_from(sts: StatefulSet) -> Result<StatefulSetState> {
        let Some(status) = sts.status else {
            bail!("missing statefulset status");
        };
        let Some(update_revision) = status.update_revision else {
            bail!("statefulset status has no updateRevision");
        };
        // Juju always sets the partition on statefulsets it manages
        let partition = sts
            .spec
            .as_ref()
            .and_then(|spec| spec.update_strategy.as_ref())
            .and_then(|strategy| strategy.rolling_update.as_ref())
            .and_then(|rolling| rolling.partition);
        let Some(partition) = partition else {
            bail!("statefulset has no rollingUpdate partition");
        };
        Ok(StatefulSetState {
            update_revision,
            partition: u32::try_from(partition)
                .map_err(|_| Error::KubeInvariant(format!("negative partition {partition}")))?,
            replicas: status.replicas,
        })
    }
}

// ----------------------------------------------------------------------------
// pod inspection

/// The workload image a pod is actually running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    /// Image reference without the digest
    pub name: String,
    /// `sha256:`-prefixed digest
    pub digest: String,
}

impl ContainerImage {
    /// First 6 hex characters of the digest, for status lines
    pub fn short_digest(&self) -> &str {
        short_digest(&self.digest)
    }
}

pub(crate) fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(6)]
}

/// One pod's contribution to the refresh state, captured per event
#[derive(Debug, Clone)]
pub struct UnitSnapshot {
    pub unit: UnitId,
    /// The statefulset revision that produced this pod
    pub controller_revision: String,
    /// `None` until the workload container status reports an imageID
    pub image: Option<ContainerImage>,
}

/// Extract a [`UnitSnapshot`] from a pod
///
/// `workload_container` selects the container status to read the image from;
/// `None` falls back to the first reported status (used by the read-only
/// terminal tracker, which has no metadata.yaml to consult).
pub fn unit_snapshot(pod: &Pod, workload_container: Option<&str>) -> Result<UnitSnapshot> {
    let name = pod.name_any();
    let unit = UnitId::from_pod_name(&name)?;
    let Some(controller_revision) = pod.labels().get(CONTROLLER_REVISION_LABEL).cloned() else {
        return Err(Error::KubeInvariant(format!(
            "pod {name} is missing the {CONTROLLER_REVISION_LABEL} label"
        )));
    };
    let mut image = None;
    if let Some(status) = &pod.status {
        for cs in status.container_statuses.clone().unwrap_or_default() {
            let selected = match workload_container {
                Some(wanted) => cs.name == wanted,
                None => image.is_none(),
            };
            if selected && !cs.image_id.is_empty() {
                image = Some(split_image_id(&cs.image_id)?);
            }
        }
    }
    Ok(UnitSnapshot { unit, controller_revision, image })
}

fn split_image_id(image_id: &str) -> Result<ContainerImage> {
    let Some((name, digest)) = image_id.split_once('@') else {
        return Err(Error::KubeInvariant(format!(
            "container imageID {image_id:?} is not digest-pinned"
        )));
    };
    if !digest.starts_with("sha256:") {
        return Err(Error::KubeInvariant(format!(
            "container imageID digest {digest:?} must begin with \"sha256:\""
        )));
    }
    Ok(ContainerImage { name: name.to_string(), digest: digest.to_string() })
}
