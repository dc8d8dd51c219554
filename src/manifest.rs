//! Version manifests pinned into the charm bundle
//!
//! Three files ship with every charm revision:
//!
//! - `refresh_versions.toml` — the charm code version and the workload
//!   version it pins (plus snap pins on machine clouds)
//! - `metadata.yaml` — the workload OCI resource with a digest-pinned
//!   `upstream-source`, and the container that mounts it
//! - `.juju-charm` — the raw charm revision written by the deploy tooling

use crate::version::CharmVersion;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const REFRESH_VERSIONS_FILE: &str = "refresh_versions.toml";
pub const METADATA_FILE: &str = "metadata.yaml";
pub const CHARM_REVISION_FILE: &str = ".juju-charm";

/// Versions pinned by this charm revision (`refresh_versions.toml`)
#[derive(Debug, Clone)]
pub struct RefreshVersions {
    pub charm: CharmVersion,
    /// Human readable workload version, e.g. "14.11"
    pub workload: String,
    /// Snap pins; only present for machine-cloud charms
    pub snap: Option<SnapVersions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapVersions {
    pub name: String,
    /// Snap revision per architecture, e.g. `revisions.x86_64 = "20").`
    #[serde(default)]
    pub revisions: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawVersions {
    charm: String,
    workload: String,
    snap: Option<SnapVersions>,
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(default)]
    resources: BTreeMap<String, ResourceSpec>,
    #[serde(default)]
    containers: BTreeMap<String, ContainerSpec>,
}

#[derive(Deserialize)]
struct ResourceSpec {
    #[serde(rename = "upstream-source")]
    upstream_source: Option<String>,
}

#[derive(Deserialize)]
struct ContainerSpec {
    resource: Option<String>,
}

/// The workload container pinned by `metadata.yaml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadContainer {
    /// Key under `containers` whose `resource` is the charm's OCI resource;
    /// pod container statuses are matched against this name
    pub container_name: String,
    /// Image reference without the digest
    pub image_name: String,
    /// Pinned digest, `sha256:`-prefixed
    pub digest: String,
}

/// Everything the controller reads from the charm bundle, loaded once per event
#[derive(Debug, Clone)]
pub struct CharmManifests {
    pub versions: RefreshVersions,
    pub container: WorkloadContainer,
    /// Raw one-line content of `.juju-charm`
    pub charm_revision: String,
}

impl CharmManifests {
    pub fn load(charm_dir: &Path, oci_resource_name: &str) -> Result<Self> {
        let versions = load_versions(&charm_dir.join(REFRESH_VERSIONS_FILE))?;
        let container = load_container(&charm_dir.join(METADATA_FILE), oci_resource_name)?;
        let charm_revision = read_manifest(&charm_dir.join(CHARM_REVISION_FILE))?.trim().to_string();
        if charm_revision.is_empty() {
            return Err(Error::Manifest(format!("{CHARM_REVISION_FILE} is empty")));
        }
        Ok(Self { versions, container, charm_revision })
    }

    /// Numeric charm revision, from the trailing `-<n>` of `.juju-charm`
    pub fn revision_number(&self) -> Option<u64> {
        revision_number(&self.charm_revision)
    }
}

pub(crate) fn revision_number(raw: &str) -> Option<u64> {
    raw.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

fn read_manifest(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Manifest(format!("unable to read {}: {e}", path.display())))
}

fn load_versions(path: &Path) -> Result<RefreshVersions> {
    let raw: RawVersions = toml::from_str(&read_manifest(path)?)
        .map_err(|e| Error::Manifest(format!("invalid {}: {e}", path.display())))?;
    let charm = CharmVersion::parse(&raw.charm)
        .map_err(|e| Error::Manifest(format!("invalid charm version in {}: {e}", path.display())))?;
    Ok(RefreshVersions { charm, workload: raw.workload, snap: raw.snap })
}

fn load_container(path: &Path, oci_resource_name: &str) -> Result<WorkloadContainer> {
    let metadata: Metadata = serde_yaml::from_str(&read_manifest(path)?)
        .map_err(|e| Error::Manifest(format!("invalid {}: {e}", path.display())))?;
    let Some(resource) = metadata.resources.get(oci_resource_name) else {
        return Err(Error::Manifest(format!("resource {oci_resource_name:?} not found in {METADATA_FILE}")));
    };
    let Some(source) = &resource.upstream_source else {
        return Err(Error::Manifest(format!("resource {oci_resource_name:?} has no upstream-source")));
    };
    let Some((image_name, digest)) = source.split_once('@') else {
        return Err(Error::Manifest(format!(
            "upstream-source {source:?} for resource {oci_resource_name:?} is not pinned to a digest"
        )));
    };
    if !digest.starts_with("sha256:") {
        return Err(Error::Manifest(format!(
            "upstream-source digest {digest:?} for resource {oci_resource_name:?} must begin with \"sha256:\""
        )));
    }

    let mut matching = metadata
        .containers
        .iter()
        .filter(|(_, spec)| spec.resource.as_deref() == Some(oci_resource_name));
    let Some((container_name, _)) = matching.next() else {
        return Err(Error::Manifest(format!(
            "no container in {METADATA_FILE} uses resource {oci_resource_name:?}"
        )));
    };
    if matching.next().is_some() {
        return Err(Error::Manifest(format!(
            "multiple containers in {METADATA_FILE} use resource {oci_resource_name:?}; expected exactly one"
        )));
    }
    Ok(WorkloadContainer {
        container_name: container_name.clone(),
        image_name: image_name.to_string(),
        digest: digest.to_string(),
    })
}
