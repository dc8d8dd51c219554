//! User-facing status composition
//!
//! Statuses are returned, never imposed: the charm adopts the
//! higher-priority ones verbatim and may use the low-priority unit summary
//! when nothing else applies.

use crate::detect::{ClusterView, PauseAfter};
use crate::manifest::CharmManifests;
use crate::probe::short_digest;
use crate::UnitId;
use std::fmt;

/// Juju-style status value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Active(String),
    Maintenance(String),
    Blocked(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Active(msg) => write!(f, "active: {msg}"),
            Status::Maintenance(msg) => write!(f, "maintenance: {msg}"),
            Status::Blocked(msg) => write!(f, "blocked: {msg}"),
        }
    }
}

/// Statuses produced by one controller invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSet {
    /// App status with higher priority than any other app status in the charm
    pub app_higher: Option<Status>,
    /// Unit status with higher priority than any other unit status in the charm
    pub unit_higher: Option<Status>,
    /// Unit status to use when no other unit status has a message to display
    pub unit_lower: Option<Status>,
}

/// Tier-1 leader-app block when the app was deployed without `--trust`
pub(crate) fn trust_missing(app: &str) -> Status {
    Status::Blocked(format!(
        "Run `juju trust {app} --scope=cluster`. Needed to manage the refresh of {app}"
    ))
}

/// Why the rollout is not currently lowering the partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RolloutHold {
    /// Advancing normally
    Progressing,
    /// A refreshed unit has not confirmed health yet (automatic; retried)
    AwaitingHealth(UnitId),
    /// Paused by `pause_after_unit_refresh`; the user must resume
    AwaitingResume,
    /// The first-unit gate has not recorded started for this revision
    GateUnresolved(UnitId),
}

pub(crate) struct ReportInput<'a> {
    pub app: &'a str,
    pub workload_name: &'a str,
    pub unit: &'a UnitId,
    pub leader: bool,
    pub view: &'a ClusterView,
    pub in_progress: bool,
    pub pause_after: PauseAfter,
    /// Blocked unit-status message from the gate, when it failed on this unit
    pub gate_block: Option<&'a str>,
    /// Leader-only: what the partition planner saw
    pub hold: Option<RolloutHold>,
    pub manifests: &'a CharmManifests,
}

pub(crate) fn report(input: &ReportInput<'_>) -> StatusSet {
    let mut set = StatusSet::default();

    // tier 2: gate failure on the first refreshing unit
    if let Some(message) = input.gate_block {
        set.unit_higher = Some(Status::Blocked(message.to_string()));
    }

    // tier 3: unrecognized pause_after_unit_refresh value
    if input.leader && input.pause_after == PauseAfter::Unknown {
        set.app_higher = Some(Status::Blocked(
            "pause_after_unit_refresh config must be either `none`, `first` or `all`".to_string(),
        ));
    }

    // tier 4: rollout progress on the leader
    if input.leader && set.app_higher.is_none() && input.in_progress {
        let done = input.view.refreshed_count();
        let total = input.view.units.len();
        set.app_higher = Some(match &input.hold {
            Some(RolloutHold::GateUnresolved(unit)) => Status::Blocked(format!(
                "Refreshing. Unit {unit} is checking if the refresh is safe; \
                 rollback with `juju refresh` if it stays blocked"
            )),
            Some(RolloutHold::AwaitingResume) => Status::Blocked(format!(
                "Refreshing. To continue, run `juju run {}/leader resume-refresh`",
                input.app
            )),
            Some(RolloutHold::AwaitingHealth(unit)) => Status::Maintenance(format!(
                "Refreshing. Waiting for unit {unit} to allow the next unit to refresh \
                 ({done}/{total} units refreshed)"
            )),
            _ => Status::Maintenance(format!("Refreshing. {done}/{total} units refreshed")),
        });
    }

    set.unit_lower = Some(unit_summary(input));
    set
}

// tier 5: the always-available Active summary for this unit
fn unit_summary(input: &ReportInput<'_>) -> Status {
    let manifests = input.manifests;
    let mut message = format!("{} {}", input.workload_name, manifests.versions.workload);
    let me = input.view.unit(input.unit);
    if me.is_some_and(|u| u.controller_revision != input.view.app_revision) {
        message.push_str(" (restart pending)");
    }
    match manifests.revision_number() {
        Some(revision) => message.push_str(&format!("; charm rev {revision}")),
        None => message.push_str(&format!("; charm {}", manifests.versions.charm)),
    }
    if let Some(image) = me.and_then(|u| u.image.as_ref()) {
        if image.digest != manifests.container.digest {
            message.push_str(&format!("; unexpected container {}", short_digest(&image.digest)));
        }
    }
    Status::Active(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{RefreshVersions, WorkloadContainer};
    use crate::probe::{ContainerImage, UnitSnapshot};
    use crate::version::CharmVersion;

    fn manifests(revision: &str) -> CharmManifests {
        CharmManifests {
            versions: RefreshVersions {
                charm: CharmVersion::parse("14/1.13.0").unwrap(),
                workload: "14.12".to_string(),
                snap: None,
            },
            container: WorkloadContainer {
                container_name: "postgresql".to_string(),
                image_name: "ghcr.io/canonical/pg".to_string(),
                digest: "sha256:bbbbbbbbbbbb".to_string(),
            },
            charm_revision: revision.to_string(),
        }
    }

    fn view(app_revision: &str, specs: &[(u32, &str, Option<&str>)]) -> ClusterView {
        let units = specs
            .iter()
            .map(|(n, revision, digest)| UnitSnapshot {
                unit: UnitId::new("postgresql-k8s", *n),
                controller_revision: revision.to_string(),
                image: digest.map(|d| ContainerImage {
                    name: "ghcr.io/canonical/pg".to_string(),
                    digest: d.to_string(),
                }),
            })
            .collect();
        ClusterView::new(app_revision.to_string(), 0, units)
    }

    fn base_input<'a>(
        view: &'a ClusterView,
        unit: &'a UnitId,
        manifests: &'a CharmManifests,
    ) -> ReportInput<'a> {
        ReportInput {
            app: "postgresql-k8s",
            workload_name: "PostgreSQL",
            unit,
            leader: true,
            view,
            in_progress: false,
            pause_after: PauseAfter::None,
            gate_block: None,
            hold: None,
            manifests,
        }
    }

    #[test]
    fn idle_unit_summary() {
        let unit = UnitId::new("postgresql-k8s", 0);
        let v = view("a", &[(0, "a", Some("sha256:bbbbbbbbbbbb"))]);
        let m = manifests("ch:amd64/jammy/postgresql-k8s-364");
        let set = report(&base_input(&v, &unit, &m));
        assert_eq!(set.app_higher, None);
        assert_eq!(set.unit_higher, None);
        assert_eq!(set.unit_lower, Some(Status::Active("PostgreSQL 14.12; charm rev 364".to_string())));
    }

    #[test]
    fn summary_flags_pending_restart_and_unexpected_container() {
        let unit = UnitId::new("postgresql-k8s", 0);
        let v = view("b", &[(1, "b", None), (0, "a", Some("sha256:cccccc999999"))]);
        let m = manifests("local:postgresql-k8s");
        let mut input = base_input(&v, &unit, &m);
        input.leader = false;
        input.in_progress = true;
        let set = report(&input);
        assert_eq!(
            set.unit_lower,
            Some(Status::Active(
                "PostgreSQL 14.12 (restart pending); charm 14/1.13.0; unexpected container cccccc"
                    .to_string()
            ))
        );
        // non-leader never sets app status
        assert_eq!(set.app_higher, None);
    }

    #[test]
    fn gate_block_is_highest_priority_unit_status() {
        let unit = UnitId::new("postgresql-k8s", 1);
        let v = view("b", &[(1, "b", None), (0, "a", None)]);
        let m = manifests("rev-1");
        let mut input = base_input(&v, &unit, &m);
        input.gate_block = Some("Rollback with `juju refresh`. Refresh incompatible");
        let set = report(&input);
        assert_eq!(
            set.unit_higher,
            Some(Status::Blocked("Rollback with `juju refresh`. Refresh incompatible".to_string()))
        );
    }

    #[test]
    fn unknown_pause_after_outranks_rollout_status() {
        let unit = UnitId::new("postgresql-k8s", 1);
        let v = view("b", &[(1, "b", None), (0, "a", None)]);
        let m = manifests("rev-1");
        let mut input = base_input(&v, &unit, &m);
        input.in_progress = true;
        input.pause_after = PauseAfter::Unknown;
        input.hold = Some(RolloutHold::Progressing);
        let set = report(&input);
        let Some(Status::Blocked(message)) = set.app_higher else {
            panic!("expected blocked app status");
        };
        assert!(message.contains("pause_after_unit_refresh"), "{message}");
    }

    #[test]
    fn rollout_statuses_by_hold() {
        let unit = UnitId::new("postgresql-k8s", 1);
        let v = view("b", &[(1, "b", None), (0, "a", None)]);
        let m = manifests("rev-1");

        let mut input = base_input(&v, &unit, &m);
        input.in_progress = true;
        input.hold = Some(RolloutHold::AwaitingResume);
        assert!(matches!(report(&input).app_higher, Some(Status::Blocked(m)) if m.contains("resume-refresh")));

        input.hold = Some(RolloutHold::GateUnresolved(UnitId::new("postgresql-k8s", 1)));
        assert!(matches!(report(&input).app_higher, Some(Status::Blocked(_))));

        input.hold = Some(RolloutHold::AwaitingHealth(UnitId::new("postgresql-k8s", 1)));
        assert!(
            matches!(report(&input).app_higher, Some(Status::Maintenance(m)) if m.contains("1/2 units refreshed"))
        );

        input.hold = Some(RolloutHold::Progressing);
        assert_eq!(
            report(&input).app_higher,
            Some(Status::Maintenance("Refreshing. 1/2 units refreshed".to_string()))
        );
    }
}
