//! Per-event refresh orchestration
//!
//! One invocation per framework event: observe the cluster, classify the
//! refresh state, run the first-unit gate if it is due, consume the
//! triggering action, drive the partition (leader), and report statuses.
//! Persistent state lives in the peer databag and the local marker
//! directory; everything else is re-derived here every time.

use crate::action::{self, Action, ActionOutcome, ForceChecks};
use crate::detect::{ClusterView, PauseAfter};
use crate::gate::{self, GateOutcome};
use crate::manifest::CharmManifests;
use crate::partition::{self, Resume};
use crate::probe::{self, ClusterProbe, UnitSnapshot};
use crate::status::{self, RolloutHold, Status, StatusSet};
use crate::store::{Databag, LocalState, OriginalVersions, PeerRelation};
use crate::version::{charm_version_compatible, CharmVersion};
use crate::{Error, PrecheckFailed, Result, UnitId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Cloud that a charm is deployed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cloud {
    Kubernetes,
    Machines,
}

/// Charm-specific configuration for in-place refreshes
#[derive(Debug, Clone)]
pub struct CharmSpec {
    pub cloud: Cloud,
    /// Human readable workload name (e.g. PostgreSQL)
    pub workload_name: String,
    /// Link to the charm's refresh user documentation, shown by `pre-refresh-check`
    pub refresh_user_docs_url: String,
    /// Resource name of the workload OCI image in metadata.yaml `resources`;
    /// required on Kubernetes, disallowed on machines
    pub oci_resource_name: Option<String>,
}

impl CharmSpec {
    pub fn new(
        cloud: Cloud,
        workload_name: impl Into<String>,
        refresh_user_docs_url: impl Into<String>,
        oci_resource_name: Option<String>,
    ) -> Result<Self> {
        match (cloud, &oci_resource_name) {
            (Cloud::Kubernetes, None) => Err(Error::CharmSpec(
                "`oci_resource_name` is required when cloud is Kubernetes".to_string(),
            )),
            (Cloud::Machines, Some(_)) => Err(Error::CharmSpec(
                "`oci_resource_name` is only allowed when cloud is Kubernetes".to_string(),
            )),
            _ => Ok(Self {
                cloud,
                workload_name: workload_name.into(),
                refresh_user_docs_url: refresh_user_docs_url.into(),
                oci_resource_name,
            }),
        }
    }
}

/// Charm-author-supplied refresh callbacks
pub trait CharmHooks {
    /// Pre-refresh health checks & preparations, run on the first refreshed
    /// unit before its workload starts
    ///
    /// Checks run sequentially; run checks before preparations and critical
    /// checks first. They may run again on any later event until they all
    /// pass, and they never run during a rollback.
    fn pre_refresh_checks_after_1_unit_refreshed(&self) -> Result<(), PrecheckFailed>;

    /// Variant run before any unit has refreshed (the `pre-refresh-check`
    /// action); defaults to the same checks
    fn pre_refresh_checks_before_any_units_refreshed(&self) -> Result<(), PrecheckFailed> {
        self.pre_refresh_checks_after_1_unit_refreshed()
    }

    /// Whether a refresh from the old to the new versions is supported
    ///
    /// Called on the new charm code. Should return `true` whenever old and
    /// new are identical, so rollbacks keep working. Layer workload checks on
    /// top of the default charm-code baseline.
    fn is_compatible(
        &self,
        old_charm: &CharmVersion,
        new_charm: &CharmVersion,
        old_workload: &str,
        new_workload: &str,
    ) -> bool {
        let _ = (old_workload, new_workload);
        charm_version_compatible(old_charm, new_charm)
    }
}

/// The framework event triggering this invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The pod is stopping (refresh, restart, or removal)
    Stop,
    /// A unit left the peer relation
    RelationDeparted { departing: UnitId },
    /// An operator action was dispatched to this unit
    Action(Action),
    /// Anything else (config-changed, relation-changed, update-status, ...);
    /// the controller re-derives everything from observed state regardless
    Reconcile,
}

/// Everything ambient about this invocation, passed explicitly
#[derive(Debug, Clone)]
pub struct Context {
    pub app: String,
    pub unit: UnitId,
    pub leader: bool,
    pub event: Event,
    /// Raw `pause_after_unit_refresh` config value
    pub pause_after_config: String,
    /// Directory holding refresh_versions.toml, metadata.yaml and .juju-charm
    pub charm_dir: PathBuf,
    /// Per-pod state directory, conventionally [`LocalState::DIR`]
    pub state_dir: PathBuf,
}

/// The narrow refresh contract shared across clouds
///
/// Implemented by [`KubernetesRefresh`]. The machines variant (snap revision
/// as the refresh token, databag entries in place of controller-revision
/// hashes) shares this surface but is not implemented here.
pub trait Refresh {
    /// Whether a refresh is currently in progress
    fn in_progress(&self) -> bool;

    /// Whether this unit has already allowed the next unit to refresh
    ///
    /// Read this only to decide whether the health checks still need to run.
    fn next_unit_allowed_to_refresh(&self) -> bool;

    /// Declare this unit healthy under the revision observed this event
    ///
    /// Call after the workload started and the app and unit passed the
    /// charm's health checks. Resets automatically when the unit refreshes.
    fn allow_next_unit_to_refresh(&mut self);

    /// Whether this unit's workload is allowed to start
    ///
    /// Check on every unit after it refreshes, not just the highest one; the
    /// user may scale up mid-refresh.
    fn workload_allowed_to_start(&self) -> bool;

    /// App status with higher priority than any other app status in the charm
    fn app_status_higher_priority(&self) -> Option<Status>;

    /// Unit status with higher priority than any other unit status in the charm
    fn unit_status_higher_priority(&self) -> Option<Status>;

    /// Unit status to set if no other unit status has a message to display
    fn unit_status_lower_priority(&self) -> Option<Status>;

    /// Result of the action that triggered this event, if any
    fn take_action_outcome(&mut self) -> Option<ActionOutcome>;
}

/// The Kubernetes refresh state machine, rebuilt once per framework event
pub struct KubernetesRefresh {
    app_revision: String,
    bag: Databag,
    in_progress: bool,
    workload_allowed: bool,
    statuses: StatusSet,
    action: Option<ActionOutcome>,
}

impl KubernetesRefresh {
    /// Run one controller invocation
    ///
    /// `relation` is `None` until the peer relation exists
    /// ([`Error::PeerRelationMissing`] tells the framework to retry later).
    /// An [`Error::NotTrusted`] abort carries the leader app status via
    /// [`Error::user_status`].
    pub async fn load(
        spec: &CharmSpec,
        hooks: &dyn CharmHooks,
        ctx: Context,
        client: kube::Client,
        relation: Option<Box<dyn PeerRelation>>,
    ) -> Result<Self> {
        if spec.cloud != Cloud::Kubernetes {
            return Err(Error::CharmSpec("KubernetesRefresh requires Cloud::Kubernetes".to_string()));
        }
        let Some(oci_resource) = spec.oci_resource_name.as_deref() else {
            return Err(Error::CharmSpec("`oci_resource_name` is required when cloud is Kubernetes".to_string()));
        };
        let manifests = CharmManifests::load(&ctx.charm_dir, oci_resource)?;
        let local = LocalState::new(&ctx.state_dir);

        if let Event::RelationDeparted { departing } = &ctx.event {
            if departing == &ctx.unit {
                // remembered for the stop event that follows removal
                local.mark_tearing_down()?;
            }
        }

        let probe = ClusterProbe { client, app: ctx.app.clone(), namespace: None };
        if !probe.patch_allowed().await? {
            return Err(Error::NotTrusted { app: ctx.app.clone() });
        }

        if ctx.event == Event::Stop && !local.tearing_down() {
            // This pod could be refreshing or just restarting. Raise the
            // partition so no further unit refreshes while it is down; if no
            // refresh is in progress the leader resets it to 0. Skipped when
            // tearing down so the partition never exceeds the highest
            // remaining ordinal.
            let sts = probe.statefulset().await?;
            if sts.partition < ctx.unit.number {
                probe.set_partition(ctx.unit.number).await?;
                info!("raised partition to {} during stop event", ctx.unit.number);
            }
        }

        let Some(relation) = relation else {
            return Err(Error::PeerRelationMissing);
        };
        let mut bag = Databag::new(relation);
        bag.record_own_pause_after(&ctx.pause_after_config);

        let sts = probe.statefulset().await?;
        let pods = probe.pods().await?;
        let mut units = Vec::with_capacity(pods.len());
        for pod in &pods {
            units.push(probe::unit_snapshot(pod, Some(manifests.container.container_name.as_str()))?);
        }
        let view = ClusterView::new(sts.update_revision, sts.partition, units);
        let in_progress = view.in_progress();
        debug!("app revision {}, partition {}, in_progress={in_progress}", view.app_revision, view.partition);

        let mut prefs = BTreeMap::new();
        for unit in bag.unit_ids() {
            if let Some(raw) = bag.pause_after_of(&unit) {
                prefs.insert(unit, PauseAfter::parse(&raw));
            }
        }
        let pause_after = view.effective_pause_after(&prefs);
        debug!("effective pause_after_unit_refresh: {pause_after}");

        // between refreshes the leader records the rollback anchor; a
        // scale-up during a refresh keeps in_progress true for that whole
        // window, so this never clobbers mid-refresh state
        if ctx.leader && !in_progress {
            if let Some(image) = view.unit(&ctx.unit).and_then(|u| u.image.clone()) {
                bag.record_original_versions(&OriginalVersions {
                    workload: manifests.versions.workload.clone(),
                    workload_container: image.digest,
                    charm: manifests.versions.charm.clone(),
                    charm_revision: manifests.charm_revision.clone(),
                });
            }
        }
        let original = bag.original_versions();

        let mut action_outcome = None;
        let mut force: Option<ForceChecks> = None;
        let mut resume: Option<Resume> = None;
        let mut run_pre_refresh_check = false;
        if let Event::Action(act) = &ctx.event {
            let mut outcome = ActionOutcome::default();
            let actx = action::ActionContext {
                app: &ctx.app,
                unit: &ctx.unit,
                leader: ctx.leader,
                first_unit: view.first().map(|u| &u.unit),
                in_progress,
                pause_after,
            };
            match action::validate(act, &actx) {
                Ok(()) => match act {
                    Action::ForceRefreshStart(checks) => force = Some(*checks),
                    Action::ResumeRefresh { check_health_of_refreshed_units } => {
                        resume = Some(Resume { check_health: *check_health_of_refreshed_units });
                    }
                    Action::PreRefreshCheck => run_pre_refresh_check = true,
                },
                Err(Error::InvalidAction(reason)) => {
                    warn!("rejecting {}: {reason}", act.name());
                    outcome.fail(reason);
                }
                Err(e) => return Err(e),
            }
            action_outcome = Some(outcome);
        }

        // the first-unit gate
        let mut started = local.refresh_started() || bag.any_refresh_started(&view.app_revision);
        let mut gate_block = None;
        let gate_due = in_progress
            && !started
            && view
                .first()
                .is_some_and(|first| first.unit == ctx.unit && first.controller_revision == view.app_revision);
        if gate_due {
            let gate_input = gate::GateInput {
                view: &view,
                manifests: &manifests,
                original: original.as_ref(),
                force,
                app: &ctx.app,
                oci_resource,
            };
            match gate::run(&gate_input, hooks) {
                GateOutcome::Started { rollback, skipped } => {
                    // databag entry and local marker in the same invocation;
                    // neither is written when any executed check failed
                    bag.record_own_refresh_started(&view.app_revision)?;
                    local.mark_refresh_started()?;
                    started = true;
                    info!("refresh started under revision {} (rollback={rollback})", view.app_revision);
                    if force.is_some() {
                        if let Some(outcome) = &mut action_outcome {
                            for check in &skipped {
                                outcome.log(format!("Skipped {check}"));
                            }
                            outcome.succeed(format!(
                                "Refresh started. Unit {} is allowed to start its workload",
                                ctx.unit.number
                            ));
                        }
                    }
                }
                GateOutcome::Blocked { status, action_failure } => {
                    if force.is_some() {
                        if let Some(outcome) = &mut action_outcome {
                            outcome.fail(action_failure);
                        }
                    }
                    gate_block = Some(status);
                }
                GateOutcome::Deferred => debug!("refresh gate deferred; retrying on the next event"),
            }
        }
        if force.is_some() {
            if let Some(outcome) = &mut action_outcome {
                if outcome.result.is_none() && !outcome.failed() {
                    // the gate did not run: already recorded, or the pod is
                    // not observable yet
                    if started {
                        outcome.fail("Refresh has already started; no checks left to skip");
                    } else {
                        outcome.fail(format!(
                            "Unit {} has not finished refreshing; try again once its pod is running",
                            ctx.unit.number
                        ));
                    }
                }
            }
        }

        if run_pre_refresh_check {
            if let Some(outcome) = &mut action_outcome {
                match hooks.pre_refresh_checks_before_any_units_refreshed() {
                    Ok(()) => {
                        let mut message = format!(
                            "Charm is ready for refresh. For refresh instructions, see {}",
                            spec.refresh_user_docs_url
                        );
                        if let Some(original) = &original {
                            message.push_str(&format!(
                                "\nAfter the refresh has started, use this command to rollback \
                                 (copy these instructions in case you need them later):\n`{}`",
                                original.rollback_command(&ctx.app, oci_resource, &manifests.container.image_name)
                            ));
                        }
                        outcome.succeed(message);
                    }
                    Err(failed) => {
                        outcome.fail(format!(
                            "Charm is not ready for refresh. Pre-refresh check failed: {}",
                            failed.message()
                        ));
                    }
                }
            }
        }

        // leader drives the partition, and only ever downwards
        let mut hold = None;
        if ctx.leader {
            let healthy: BTreeSet<UnitId> = view
                .units
                .iter()
                .filter(|u| {
                    bag.next_unit_allowed_hash(&u.unit).as_deref() == Some(view.app_revision.as_str())
                })
                .map(|u| u.unit.clone())
                .collect();
            let plan = partition::plan(&partition::PlanInput {
                view: &view,
                pause_after,
                refresh_started: started,
                healthy: &healthy,
                resume,
            });
            if plan.target < view.partition {
                probe.set_partition(plan.target).await?;
            }
            if resume.is_some() {
                if let Some(outcome) = &mut action_outcome {
                    if !outcome.failed() {
                        if plan.allowed {
                            match &plan.next_unit {
                                Some(next) => outcome.succeed(format!(
                                    "Refresh resumed. Unit {} is refreshing next",
                                    next.number
                                )),
                                None => outcome.succeed("Refresh resumed"),
                            }
                        } else if let Some(blocking) = &plan.blocking_unit {
                            outcome.fail(format!(
                                "Unit {blocking} has not allowed the next unit to refresh; its \
                                 health checks have not passed. Use \
                                 `check-health-of-refreshed-units=false` to override"
                            ));
                        } else {
                            let first = view.first().map(|u| u.unit.number).unwrap_or(0);
                            outcome.fail(format!("Pre-refresh checks have not succeeded on unit {first}"));
                        }
                    }
                }
            }
            if in_progress {
                hold = Some(if plan.allowed {
                    RolloutHold::Progressing
                } else if let Some(unit) = plan.blocking_unit {
                    RolloutHold::AwaitingHealth(unit)
                } else if !started {
                    match view.first() {
                        Some(first) => RolloutHold::GateUnresolved(first.unit.clone()),
                        None => RolloutHold::Progressing,
                    }
                } else {
                    RolloutHold::AwaitingResume
                });
            }
        }

        let workload_allowed = workload_allowed_to_start(in_progress, started, view.unit(&ctx.unit), &view.app_revision);
        let statuses = status::report(&status::ReportInput {
            app: &ctx.app,
            workload_name: &spec.workload_name,
            unit: &ctx.unit,
            leader: ctx.leader,
            view: &view,
            in_progress,
            pause_after,
            gate_block: gate_block.as_deref(),
            hold,
            manifests: &manifests,
        });

        Ok(Self {
            app_revision: view.app_revision,
            bag,
            in_progress,
            workload_allowed,
            statuses,
            action: action_outcome,
        })
    }
}

// A unit still on the old revision runs the old workload, which is already
// started; a refreshed unit waits for the gate.
fn workload_allowed_to_start(
    in_progress: bool,
    started: bool,
    me: Option<&UnitSnapshot>,
    app_revision: &str,
) -> bool {
    !in_progress || started || me.is_some_and(|u| u.controller_revision != app_revision)
}

impl Refresh for KubernetesRefresh {
    fn in_progress(&self) -> bool {
        self.in_progress
    }

    fn next_unit_allowed_to_refresh(&self) -> bool {
        self.bag.own_next_unit_allowed_hash().as_deref() == Some(self.app_revision.as_str())
    }

    fn allow_next_unit_to_refresh(&mut self) {
        self.bag.allow_next_unit(&self.app_revision);
    }

    fn workload_allowed_to_start(&self) -> bool {
        self.workload_allowed
    }

    fn app_status_higher_priority(&self) -> Option<Status> {
        self.statuses.app_higher.clone()
    }

    fn unit_status_higher_priority(&self) -> Option<Status> {
        self.statuses.unit_higher.clone()
    }

    fn unit_status_lower_priority(&self) -> Option<Status> {
        self.statuses.unit_lower.clone()
    }

    fn take_action_outcome(&mut self) -> Option<ActionOutcome> {
        self.action.take()
    }
}
