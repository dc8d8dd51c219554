//! StatefulSet partition planning
//!
//! The rollout advances by lowering the partition one unit at a time as
//! health confirmations arrive. Planning is pure; the controller applies the
//! result through the probe, and only ever lowers it here. (Raising the
//! partition back over a pod that has started refreshing can wedge it, so
//! the lone raise lives in the stop-event guard, not here.)

use crate::detect::{ClusterView, PauseAfter};
use crate::UnitId;
use std::collections::BTreeSet;
use tracing::debug;

/// Validated `resume-refresh` parameters driving this event
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resume {
    pub check_health: bool,
}

pub(crate) struct PlanInput<'a> {
    pub view: &'a ClusterView,
    pub pause_after: PauseAfter,
    /// Whether the first-unit gate has recorded started for the app revision
    pub refresh_started: bool,
    /// Units whose `next_unit_allowed...` hash equals the current app revision
    pub healthy: &'a BTreeSet<UnitId>,
    pub resume: Option<Resume>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionPlan {
    pub target: u32,
    pub allowed: bool,
    /// The unit that would refresh when allowed
    pub next_unit: Option<UnitId>,
    /// The refreshed unit whose missing health confirmation denies progress
    pub blocking_unit: Option<UnitId>,
}

pub(crate) fn plan(input: &PlanInput<'_>) -> PartitionPlan {
    let view = input.view;
    let units = &view.units;
    if units.is_empty() {
        return PartitionPlan {
            target: view.partition,
            allowed: false,
            next_unit: None,
            blocking_unit: None,
        };
    }

    // the first unit by descending ordinal still on the old revision; when
    // all units have converged, the lowest-ordinal unit stands in so that a
    // completed refresh resolves to partition 0
    let (index, next) = units
        .iter()
        .enumerate()
        .find(|(_, u)| u.controller_revision != view.app_revision)
        .unwrap_or((units.len() - 1, &units[units.len() - 1]));

    if !view.in_progress() {
        // nothing to gate; reset so the next `juju refresh` starts at the top
        return PartitionPlan {
            target: next.unit.number,
            allowed: true,
            next_unit: Some(next.unit.clone()),
            blocking_unit: None,
        };
    }

    let mut blocking_unit = None;
    let allowed = if matches!(input.resume, Some(r) if !r.check_health) {
        debug!("resume-refresh is overriding health checks of refreshed units");
        true
    } else if !input.refresh_started {
        false
    } else if let Some(unhealthy) = units[..index].iter().find(|u| !input.healthy.contains(&u.unit)) {
        blocking_unit = Some(unhealthy.unit.clone());
        false
    } else {
        input.pause_after == PauseAfter::None
            || (input.pause_after == PauseAfter::First && index >= 2)
            || input.resume.is_some()
    };

    let target = if allowed || index == 0 {
        next.unit.number
    } else {
        units[index - 1].unit.number
    };
    debug!(
        "partition plan: next unit {}, allowed={allowed}, target {target} (current {})",
        next.unit, view.partition
    );
    PartitionPlan { target, allowed, next_unit: Some(next.unit.clone()), blocking_unit }
}
