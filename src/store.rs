//! Durable refresh state
//!
//! Two stores with very different lifetimes:
//!
//! - the peer-relation databag, cluster-visible, with a per-unit section
//!   writable only by the owning unit and an app section writable only by
//!   the leader
//! - a per-pod local directory whose marker files mean "this event happened
//!   on this pod"; lost with the pod, which is the point
//!
//! Every cross-unit value that gates progress is qualified by a controller
//! revision hash; a stale entry from before the current `juju refresh` is
//! treated as absent.

use crate::version::CharmVersion;
use crate::{Error, Result, UnitId};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const PAUSE_AFTER_KEY: &str = "pause_after_unit_refresh_config";
pub const NEXT_UNIT_ALLOWED_KEY: &str =
    "next_unit_allowed_to_refresh_if_app_controller_revision_hash_equals";
pub const REFRESH_STARTED_KEY: &str = "refresh_started_if_app_controller_revision_hash_in";

const ORIGINAL_WORKLOAD_KEY: &str = "original_workload_version";
const ORIGINAL_CONTAINER_KEY: &str = "original_workload_container_version";
const ORIGINAL_CHARM_KEY: &str = "original_charm_version";
const ORIGINAL_CHARM_REVISION_KEY: &str = "original_charm_revision";

/// The narrow databag surface the embedding charm runtime provides
///
/// Writes are last-writer-wins per key. `app_set` must only be called on the
/// leader; the runtime enforces that, not this crate.
pub trait PeerRelation {
    /// All units currently in the relation, including this one
    fn unit_ids(&self) -> Vec<UnitId>;
    fn unit_get(&self, unit: &UnitId, key: &str) -> Option<String>;
    fn my_unit_get(&self, key: &str) -> Option<String>;
    fn my_unit_set(&mut self, key: &str, value: &str);
    fn app_get(&self, key: &str) -> Option<String>;
    fn app_set(&mut self, key: &str, value: &str);
}

/// Typed view over the peer-relation databag
pub struct Databag {
    relation: Box<dyn PeerRelation>,
}

impl Databag {
    pub fn new(relation: Box<dyn PeerRelation>) -> Self {
        Self { relation }
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.relation.unit_ids()
    }

    /// Raw `pause_after_unit_refresh` config as reported by `unit`
    pub fn pause_after_of(&self, unit: &UnitId) -> Option<String> {
        self.relation.unit_get(unit, PAUSE_AFTER_KEY)
    }

    pub fn record_own_pause_after(&mut self, raw: &str) {
        self.relation.my_unit_set(PAUSE_AFTER_KEY, raw);
    }

    /// The revision hash under which `unit` has allowed the next unit to refresh
    pub fn next_unit_allowed_hash(&self, unit: &UnitId) -> Option<String> {
        self.relation.unit_get(unit, NEXT_UNIT_ALLOWED_KEY)
    }

    pub fn own_next_unit_allowed_hash(&self) -> Option<String> {
        self.relation.my_unit_get(NEXT_UNIT_ALLOWED_KEY)
    }

    pub fn allow_next_unit(&mut self, revision: &str) {
        debug!("allowing next unit to refresh under revision {revision}");
        self.relation.my_unit_set(NEXT_UNIT_ALLOWED_KEY, revision);
    }

    /// Revision hashes for which `unit` has completed the refresh gate
    pub fn refresh_started_hashes(&self, unit: &UnitId) -> Vec<String> {
        let Some(raw) = self.relation.unit_get(unit, REFRESH_STARTED_KEY) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!("discarding malformed {REFRESH_STARTED_KEY} for {unit}: {e}");
                Vec::new()
            }
        }
    }

    /// Whether any unit has recorded the refresh gate passed under `revision`
    pub fn any_refresh_started(&self, revision: &str) -> bool {
        self.relation
            .unit_ids()
            .iter()
            .any(|unit| self.refresh_started_hashes(unit).iter().any(|h| h == revision))
    }

    pub fn record_own_refresh_started(&mut self, revision: &str) -> Result<()> {
        let mut hashes: Vec<String> = self
            .relation
            .my_unit_get(REFRESH_STARTED_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        if !hashes.iter().any(|h| h == revision) {
            hashes.push(revision.to_string());
        }
        let encoded = serde_json::to_string(&hashes).map_err(Error::Serialization)?;
        self.relation.my_unit_set(REFRESH_STARTED_KEY, &encoded);
        Ok(())
    }

    /// Versions to roll back to, written by the leader between refreshes
    pub fn original_versions(&self) -> Option<OriginalVersions> {
        let workload = self.relation.app_get(ORIGINAL_WORKLOAD_KEY)?;
        let workload_container = self.relation.app_get(ORIGINAL_CONTAINER_KEY)?;
        let charm_raw = self.relation.app_get(ORIGINAL_CHARM_KEY)?;
        let charm_revision = self.relation.app_get(ORIGINAL_CHARM_REVISION_KEY)?;
        let charm = match CharmVersion::parse(&charm_raw) {
            Ok(charm) => charm,
            Err(e) => {
                // pre-v3 databag or corruption; callers treat this as
                // "cannot auto-recover"
                warn!("stored {ORIGINAL_CHARM_KEY} {charm_raw:?} does not parse: {e}");
                return None;
            }
        };
        Some(OriginalVersions { workload, workload_container, charm, charm_revision })
    }

    pub fn record_original_versions(&mut self, versions: &OriginalVersions) {
        debug!("recording original versions: charm {}, workload {}", versions.charm, versions.workload);
        self.relation.app_set(ORIGINAL_WORKLOAD_KEY, &versions.workload);
        self.relation.app_set(ORIGINAL_CONTAINER_KEY, &versions.workload_container);
        self.relation.app_set(ORIGINAL_CHARM_KEY, &versions.charm.to_string());
        self.relation.app_set(ORIGINAL_CHARM_REVISION_KEY, &versions.charm_revision);
    }
}

/// The versions a rollback returns to
///
/// Written whenever no refresh is in progress; all fields non-empty once
/// written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalVersions {
    pub workload: String,
    /// Digest of the workload container before the refresh
    pub workload_container: String,
    pub charm: CharmVersion,
    /// Raw `.juju-charm` content before the refresh
    pub charm_revision: String,
}

impl OriginalVersions {
    /// The literal command that rolls the app back to these versions
    pub fn rollback_command(&self, app: &str, oci_resource: &str, image_name: &str) -> String {
        let resource = format!("--resource {oci_resource}={image_name}@{}", self.workload_container);
        match crate::manifest::revision_number(&self.charm_revision) {
            Some(revision) => format!("juju refresh {app} --revision {revision} {resource}"),
            None => format!("juju refresh {app} --path <original charm> {resource}"),
        }
    }
}

const TEARING_DOWN_MARKER: &str = "kubernetes_unit_tearing_down";
const REFRESH_STARTED_MARKER: &str = "kubernetes_refresh_started";

/// Per-pod marker files under `.charm_refresh_v3/`
///
/// Presence means the event happened on this pod. The directory dies with
/// the pod, so a refreshed (= replaced) pod starts clean.
pub struct LocalState {
    dir: PathBuf,
}

impl LocalState {
    /// Conventional directory name, relative to the charm working directory
    pub const DIR: &'static str = ".charm_refresh_v3";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn touch(&self, marker: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(Error::Io)?;
        fs::write(self.dir.join(marker), b"").map_err(Error::Io)
    }

    /// Record that this unit saw itself depart the relation (scale down)
    pub fn mark_tearing_down(&self) -> Result<()> {
        self.touch(TEARING_DOWN_MARKER)
    }

    pub fn tearing_down(&self) -> bool {
        self.dir.join(TEARING_DOWN_MARKER).exists()
    }

    /// Record that the refresh gate passed on this pod
    pub fn mark_refresh_started(&self) -> Result<()> {
        self.touch(REFRESH_STARTED_MARKER)
    }

    pub fn refresh_started(&self) -> bool {
        self.dir.join(REFRESH_STARTED_MARKER).exists()
    }
}

/// In-memory [`PeerRelation`] for unit tests (this crate's and embedding charms')
#[derive(Debug, Clone)]
pub struct InMemoryRelation {
    own: UnitId,
    units: BTreeMap<UnitId, BTreeMap<String, String>>,
    app: BTreeMap<String, String>,
}

impl InMemoryRelation {
    pub fn new(own: UnitId) -> Self {
        let mut units = BTreeMap::new();
        units.insert(own.clone(), BTreeMap::new());
        Self { own, units, app: BTreeMap::new() }
    }

    /// Add a peer unit, or seed any unit's databag with a key
    pub fn seed_unit(&mut self, unit: UnitId, key: &str, value: &str) {
        self.units.entry(unit).or_default().insert(key.to_string(), value.to_string());
    }

    pub fn add_unit(&mut self, unit: UnitId) {
        self.units.entry(unit).or_default();
    }
}

impl PeerRelation for InMemoryRelation {
    fn unit_ids(&self) -> Vec<UnitId> {
        self.units.keys().cloned().collect()
    }

    fn unit_get(&self, unit: &UnitId, key: &str) -> Option<String> {
        self.units.get(unit)?.get(key).cloned()
    }

    fn my_unit_get(&self, key: &str) -> Option<String> {
        self.unit_get(&self.own, key)
    }

    fn my_unit_set(&mut self, key: &str, value: &str) {
        let own = self.own.clone();
        self.seed_unit(own, key, value);
    }

    fn app_get(&self, key: &str) -> Option<String> {
        self.app.get(key).cloned()
    }

    fn app_set(&mut self, key: &str, value: &str) {
        self.app.insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(n: u32) -> UnitId {
        UnitId::new("postgresql-k8s", n)
    }

    fn bag() -> Databag {
        Databag::new(Box::new(InMemoryRelation::new(unit(2))))
    }

    #[test]
    fn pause_after_round_trips_per_unit() {
        let mut bag = bag();
        assert_eq!(bag.pause_after_of(&unit(2)), None);
        bag.record_own_pause_after("first");
        assert_eq!(bag.pause_after_of(&unit(2)).as_deref(), Some("first"));
    }

    #[test]
    fn refresh_started_accumulates_without_duplicates() {
        let mut bag = bag();
        bag.record_own_refresh_started("rev-b").unwrap();
        bag.record_own_refresh_started("rev-b").unwrap();
        bag.record_own_refresh_started("rev-c").unwrap();
        assert_eq!(bag.refresh_started_hashes(&unit(2)), vec!["rev-b", "rev-c"]);
        assert!(bag.any_refresh_started("rev-b"));
        assert!(!bag.any_refresh_started("rev-d"));
    }

    #[test]
    fn malformed_refresh_started_reads_as_empty() {
        let mut relation = InMemoryRelation::new(unit(2));
        relation.seed_unit(unit(2), REFRESH_STARTED_KEY, "not json");
        let bag = Databag::new(Box::new(relation));
        assert!(bag.refresh_started_hashes(&unit(2)).is_empty());
    }

    #[test]
    fn original_versions_round_trip() {
        let mut bag = bag();
        assert_eq!(bag.original_versions(), None);
        let versions = OriginalVersions {
            workload: "14.11".to_string(),
            workload_container: "sha256:1a2b3c4d5e6f".to_string(),
            charm: CharmVersion::parse("14/1.12.0").unwrap(),
            charm_revision: "ch:amd64/jammy/postgresql-k8s-363".to_string(),
        };
        bag.record_original_versions(&versions);
        assert_eq!(bag.original_versions(), Some(versions));
    }

    #[test]
    fn unparseable_original_charm_reads_as_absent() {
        let mut bag = bag();
        let versions = OriginalVersions {
            workload: "14.11".to_string(),
            workload_container: "sha256:1a2b3c4d5e6f".to_string(),
            charm: CharmVersion::parse("14/1.12.0").unwrap(),
            charm_revision: "rev-363".to_string(),
        };
        bag.record_original_versions(&versions);
        bag.relation.app_set(ORIGINAL_CHARM_KEY, "not-a-version");
        assert_eq!(bag.original_versions(), None);
    }

    #[test]
    fn rollback_command_uses_numeric_revision() {
        let versions = OriginalVersions {
            workload: "14.11".to_string(),
            workload_container: "sha256:1a2b3c".to_string(),
            charm: CharmVersion::parse("14/1.12.0").unwrap(),
            charm_revision: "ch:amd64/jammy/postgresql-k8s-363".to_string(),
        };
        assert_eq!(
            versions.rollback_command("postgresql-k8s", "postgresql-image", "ghcr.io/canonical/pg"),
            "juju refresh postgresql-k8s --revision 363 \
             --resource postgresql-image=ghcr.io/canonical/pg@sha256:1a2b3c"
        );
    }

    #[test]
    fn local_markers() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalState::new(dir.path().join(LocalState::DIR));
        assert!(!local.tearing_down());
        assert!(!local.refresh_started());
        local.mark_tearing_down().unwrap();
        local.mark_refresh_started().unwrap();
        assert!(local.tearing_down());
        assert!(local.refresh_started());
        // marking twice is fine
        local.mark_tearing_down().unwrap();
    }
}
