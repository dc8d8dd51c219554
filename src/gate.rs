//! The first-unit refresh gate
//!
//! After `juju refresh`, the highest-ordinal pod is replaced first and its
//! new charm code runs here before the workload is allowed to start. Three
//! checks run in order (container digest, compatibility, pre-refresh hooks);
//! a rollback is recognized up front and skips all of them, because rolling
//! back must be unconditional.
//!
//! The caller records the outcome (local marker + databag entry); this
//! module only decides.

use crate::action::ForceChecks;
use crate::controller::CharmHooks;
use crate::detect::ClusterView;
use crate::manifest::CharmManifests;
use crate::probe::short_digest;
use crate::store::OriginalVersions;
use tracing::{info, warn};

pub(crate) struct GateInput<'a> {
    pub view: &'a ClusterView,
    pub manifests: &'a CharmManifests,
    pub original: Option<&'a OriginalVersions>,
    /// Validated `force-refresh-start` parameters, if that action drives this event
    pub force: Option<ForceChecks>,
    pub app: &'a str,
    pub oci_resource: &'a str,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GateOutcome {
    /// All executed checks passed (or a rollback was recognized)
    Started { rollback: bool, skipped: Vec<&'static str> },
    /// A check failed; the refresh stays un-started and the user must act
    Blocked { status: String, action_failure: String },
    /// Observed state is incomplete (no image reported yet); retry next event
    Deferred,
}

pub(crate) fn run(input: &GateInput<'_>, hooks: &dyn CharmHooks) -> GateOutcome {
    let Some(first) = input.view.first() else {
        return GateOutcome::Deferred;
    };
    let Some(image) = &first.image else {
        info!("unit {} has not reported its workload image yet", first.unit);
        return GateOutcome::Deferred;
    };
    let pinned = &input.manifests.container;
    let versions = &input.manifests.versions;

    if let Some(original) = input.original {
        if original.charm == versions.charm && original.workload_container == image.digest {
            info!(
                "refresh target equals original versions (charm {}, container {}); rollback",
                original.charm,
                short_digest(&original.workload_container)
            );
            return GateOutcome::Started { rollback: true, skipped: Vec::new() };
        }
    }

    let rollback = input
        .original
        .map(|o| o.rollback_command(input.app, input.oci_resource, &pinned.image_name))
        .unwrap_or_else(|| "juju refresh".to_string());
    let mut skipped = Vec::new();

    // gate 1: the pod must be running the container digest this charm pins
    if input.force.map_or(true, |f| f.check_workload_container) {
        if image.digest != pinned.digest {
            warn!(
                "workload container mismatch: expected {}, found {}. Rollback with `{rollback}`",
                pinned.digest, image.digest
            );
            return GateOutcome::Blocked {
                status: format!(
                    "Rollback with `juju refresh`. Unexpected container {}",
                    short_digest(&image.digest)
                ),
                action_failure: format!(
                    "Workload container does not match the digest pinned by the charm: \
                     expected {}, found {}. Rollback with `{rollback}`",
                    pinned.digest, image.digest
                ),
            };
        }
    } else {
        info!("skipping workload container check (force-refresh-start)");
        skipped.push("workload container check");
    }

    // gate 2: the charm decides whether old -> new is a supported refresh
    if input.force.map_or(true, |f| f.check_compatibility) {
        let Some(original) = input.original else {
            // pre-v3 databag at refresh time; nothing to compare against
            warn!("original versions are unknown; cannot check refresh compatibility");
            return GateOutcome::Blocked {
                status: "Rollback with `juju refresh`. Original versions unknown".to_string(),
                action_failure: "Versions before the refresh are not recorded; unable to check \
                                 compatibility. Rollback manually with `juju refresh`"
                    .to_string(),
            };
        };
        if !hooks.is_compatible(&original.charm, &versions.charm, &original.workload, &versions.workload)
        {
            warn!(
                "refresh incompatible: charm {} -> {}, workload {} -> {}. Rollback with `{rollback}`",
                original.charm, versions.charm, original.workload, versions.workload
            );
            return GateOutcome::Blocked {
                status: "Rollback with `juju refresh`. Refresh incompatible".to_string(),
                action_failure: format!(
                    "Refresh incompatible: charm {} -> {}, workload {} -> {}. \
                     Rollback with `{rollback}`",
                    original.charm, versions.charm, original.workload, versions.workload
                ),
            };
        }
    } else {
        info!("skipping compatibility check (force-refresh-start)");
        skipped.push("compatibility check");
    }

    // gate 3: charm-author health checks & preparations
    if input.force.map_or(true, |f| f.run_pre_refresh_checks) {
        if let Err(failed) = hooks.pre_refresh_checks_after_1_unit_refreshed() {
            warn!("pre-refresh check failed: {}. Rollback with `{rollback}`", failed.message());
            return GateOutcome::Blocked {
                status: format!(
                    "Rollback with `juju refresh`. Pre-refresh check failed: {}",
                    failed.message()
                ),
                action_failure: format!(
                    "Pre-refresh check failed: {}. Rollback with `{rollback}`",
                    failed.message()
                ),
            };
        }
    } else {
        info!("skipping pre-refresh checks (force-refresh-start)");
        skipped.push("pre-refresh checks");
    }

    GateOutcome::Started { rollback: false, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{RefreshVersions, WorkloadContainer};
    use crate::probe::{ContainerImage, UnitSnapshot};
    use crate::version::CharmVersion;
    use crate::{PrecheckFailed, UnitId};
    use std::cell::Cell;

    struct TestHooks {
        compatible: bool,
        precheck: Option<&'static str>,
        compat_called: Cell<bool>,
        precheck_called: Cell<bool>,
    }

    impl TestHooks {
        fn passing() -> Self {
            Self {
                compatible: true,
                precheck: None,
                compat_called: Cell::new(false),
                precheck_called: Cell::new(false),
            }
        }
    }

    impl CharmHooks for TestHooks {
        fn pre_refresh_checks_after_1_unit_refreshed(&self) -> Result<(), PrecheckFailed> {
            self.precheck_called.set(true);
            match self.precheck {
                Some(message) => Err(PrecheckFailed::new(message)),
                None => Ok(()),
            }
        }

        fn is_compatible(
            &self,
            _old_charm: &CharmVersion,
            _new_charm: &CharmVersion,
            _old_workload: &str,
            _new_workload: &str,
        ) -> bool {
            self.compat_called.set(true);
            self.compatible
        }
    }

    const PINNED_DIGEST: &str = "sha256:bbbbbbbbbbbb";
    const ORIGINAL_DIGEST: &str = "sha256:aaaaaaaaaaaa";

    fn manifests() -> CharmManifests {
        CharmManifests {
            versions: RefreshVersions {
                charm: CharmVersion::parse("14/1.13.0").unwrap(),
                workload: "14.12".to_string(),
                snap: None,
            },
            container: WorkloadContainer {
                container_name: "postgresql".to_string(),
                image_name: "ghcr.io/canonical/pg".to_string(),
                digest: PINNED_DIGEST.to_string(),
            },
            charm_revision: "ch:amd64/jammy/postgresql-k8s-364".to_string(),
        }
    }

    fn original() -> OriginalVersions {
        OriginalVersions {
            workload: "14.11".to_string(),
            workload_container: ORIGINAL_DIGEST.to_string(),
            charm: CharmVersion::parse("14/1.12.0").unwrap(),
            charm_revision: "ch:amd64/jammy/postgresql-k8s-363".to_string(),
        }
    }

    fn view(first_digest: Option<&str>) -> ClusterView {
        let units = vec![
            UnitSnapshot {
                unit: UnitId::new("postgresql-k8s", 2),
                controller_revision: "rev-b".to_string(),
                image: first_digest.map(|digest| ContainerImage {
                    name: "ghcr.io/canonical/pg".to_string(),
                    digest: digest.to_string(),
                }),
            },
            UnitSnapshot {
                unit: UnitId::new("postgresql-k8s", 1),
                controller_revision: "rev-a".to_string(),
                image: None,
            },
        ];
        ClusterView::new("rev-b".to_string(), 2, units)
    }

    fn input<'a>(
        view: &'a ClusterView,
        manifests: &'a CharmManifests,
        original: Option<&'a OriginalVersions>,
        force: Option<ForceChecks>,
    ) -> GateInput<'a> {
        GateInput {
            view,
            manifests,
            original,
            force,
            app: "postgresql-k8s",
            oci_resource: "postgresql-image",
        }
    }

    #[test]
    fn passes_when_all_gates_succeed() {
        let view = view(Some(PINNED_DIGEST));
        let manifests = manifests();
        let original = original();
        let hooks = TestHooks::passing();
        let outcome = run(&input(&view, &manifests, Some(&original), None), &hooks);
        assert_eq!(outcome, GateOutcome::Started { rollback: false, skipped: vec![] });
        assert!(hooks.compat_called.get());
        assert!(hooks.precheck_called.get());
    }

    #[test]
    fn defers_until_image_is_reported() {
        let view = view(None);
        let manifests = manifests();
        let hooks = TestHooks::passing();
        assert_eq!(run(&input(&view, &manifests, None, None), &hooks), GateOutcome::Deferred);
    }

    #[test]
    fn rollback_skips_every_check() {
        // installed digest and pinned charm both equal the original versions
        let view = view(Some(ORIGINAL_DIGEST));
        let mut manifests = manifests();
        manifests.versions.charm = CharmVersion::parse("14/1.12.0").unwrap();
        let original = original();
        let hooks = TestHooks { compatible: false, precheck: Some("nope"), ..TestHooks::passing() };
        let outcome = run(&input(&view, &manifests, Some(&original), None), &hooks);
        assert_eq!(outcome, GateOutcome::Started { rollback: true, skipped: vec![] });
        assert!(!hooks.compat_called.get());
        assert!(!hooks.precheck_called.get());
    }

    #[test]
    fn container_mismatch_blocks_with_short_digest() {
        let view = view(Some("sha256:cccccc999999"));
        let manifests = manifests();
        let original = original();
        let hooks = TestHooks::passing();
        let outcome = run(&input(&view, &manifests, Some(&original), None), &hooks);
        let GateOutcome::Blocked { status, action_failure } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(status, "Rollback with `juju refresh`. Unexpected container cccccc");
        assert!(action_failure.contains("--revision 363"), "{action_failure}");
        assert!(!hooks.compat_called.get());
    }

    #[test]
    fn incompatible_refresh_blocks() {
        let view = view(Some(PINNED_DIGEST));
        let manifests = manifests();
        let original = original();
        let hooks = TestHooks { compatible: false, ..TestHooks::passing() };
        let outcome = run(&input(&view, &manifests, Some(&original), None), &hooks);
        let GateOutcome::Blocked { status, .. } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(status, "Rollback with `juju refresh`. Refresh incompatible");
        assert!(!hooks.precheck_called.get());
    }

    #[test]
    fn precheck_failure_propagates_message() {
        let view = view(Some(PINNED_DIGEST));
        let manifests = manifests();
        let original = original();
        let hooks = TestHooks { precheck: Some("Backup in progress"), ..TestHooks::passing() };
        let outcome = run(&input(&view, &manifests, Some(&original), None), &hooks);
        let GateOutcome::Blocked { status, action_failure } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(status, "Rollback with `juju refresh`. Pre-refresh check failed: Backup in progress");
        assert!(action_failure.starts_with("Pre-refresh check failed: Backup in progress"));
    }

    #[test]
    fn missing_originals_blocks_at_compatibility() {
        let view = view(Some(PINNED_DIGEST));
        let manifests = manifests();
        let hooks = TestHooks::passing();
        let outcome = run(&input(&view, &manifests, None, None), &hooks);
        let GateOutcome::Blocked { status, .. } = outcome else {
            panic!("expected blocked");
        };
        assert!(status.contains("Original versions unknown"), "{status}");
    }

    #[test]
    fn force_skips_selected_checks() {
        // wrong digest and incompatible, but both checks skipped
        let view = view(Some("sha256:cccccc999999"));
        let manifests = manifests();
        let original = original();
        let hooks = TestHooks { compatible: false, ..TestHooks::passing() };
        let force = ForceChecks {
            check_workload_container: false,
            check_compatibility: false,
            run_pre_refresh_checks: true,
        };
        let outcome = run(&input(&view, &manifests, Some(&original), Some(force)), &hooks);
        assert_eq!(
            outcome,
            GateOutcome::Started {
                rollback: false,
                skipped: vec!["workload container check", "compatibility check"],
            }
        );
        assert!(hooks.precheck_called.get());
    }

    #[test]
    fn force_with_skipped_compat_passes_without_originals() {
        let view = view(Some(PINNED_DIGEST));
        let manifests = manifests();
        let hooks = TestHooks::passing();
        let force = ForceChecks {
            check_workload_container: true,
            check_compatibility: false,
            run_pre_refresh_checks: true,
        };
        let outcome = run(&input(&view, &manifests, None, Some(force)), &hooks);
        assert!(matches!(outcome, GateOutcome::Started { rollback: false, .. }));
    }
}
