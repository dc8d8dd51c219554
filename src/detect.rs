//! Refresh state derived from an observed cluster snapshot
//!
//! Pure logic: the controller assembles a [`ClusterView`] from the probe and
//! asks it what is going on. Nothing here touches the API or the databag.

use crate::probe::UnitSnapshot;
use crate::UnitId;
use std::collections::BTreeMap;
use std::fmt;

/// The `pause_after_unit_refresh` config lattice
///
/// The cluster-effective value is the max across the most up-to-date units'
/// reported preferences, so an unrecognized value (`Unknown`) dominates and
/// blocks progress via status rather than silently drifting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PauseAfter {
    None,
    First,
    All,
    Unknown,
}

impl PauseAfter {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "none" => PauseAfter::None,
            "first" => PauseAfter::First,
            "all" => PauseAfter::All,
            _ => PauseAfter::Unknown,
        }
    }
}

impl fmt::Display for PauseAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PauseAfter::None => "none",
            PauseAfter::First => "first",
            PauseAfter::All => "all",
            PauseAfter::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A point-in-time picture of the app's statefulset and pods
#[derive(Debug, Clone)]
pub struct ClusterView {
    /// `status.updateRevision`: the revision being rolled out
    pub app_revision: String,
    /// Current rolling-update partition
    pub partition: u32,
    /// Units ordered highest ordinal first (the refresh order)
    pub units: Vec<UnitSnapshot>,
}

impl ClusterView {
    pub fn new(app_revision: String, partition: u32, mut units: Vec<UnitSnapshot>) -> Self {
        units.sort_by(|a, b| b.unit.number.cmp(&a.unit.number));
        Self { app_revision, partition, units }
    }

    /// A refresh is in progress while any pod trails the app revision
    pub fn in_progress(&self) -> bool {
        self.units.iter().any(|u| u.controller_revision != self.app_revision)
    }

    /// The first unit scheduled to refresh (highest ordinal)
    pub fn first(&self) -> Option<&UnitSnapshot> {
        self.units.first()
    }

    pub fn unit(&self, id: &UnitId) -> Option<&UnitSnapshot> {
        self.units.iter().find(|u| &u.unit == id)
    }

    /// Units already on the app revision
    pub fn refreshed_count(&self) -> usize {
        self.units.iter().filter(|u| u.controller_revision == self.app_revision).count()
    }

    /// Units on the same revision as the highest unit
    ///
    /// During a stop-before-refresh window this revision can differ from the
    /// app revision; preferences are still read from these units because they
    /// are the ones that will carry the refresh forward.
    pub fn most_up_to_date(&self) -> impl Iterator<Item = &UnitSnapshot> {
        let revision = self.first().map(|u| u.controller_revision.clone());
        self.units
            .iter()
            .filter(move |u| Some(&u.controller_revision) == revision.as_ref())
    }

    /// Cluster-effective `pause_after_unit_refresh`
    ///
    /// `prefs` holds the parsed per-unit databag values; units without a
    /// recorded preference (scale-up, initial install) are excluded from the
    /// max unless none have one, in which case Unknown.
    pub fn effective_pause_after(&self, prefs: &BTreeMap<UnitId, PauseAfter>) -> PauseAfter {
        let mut effective = None;
        for unit in self.most_up_to_date() {
            if let Some(pref) = prefs.get(&unit.unit) {
                effective = Some(effective.map_or(*pref, |e: PauseAfter| e.max(*pref)));
            }
        }
        effective.unwrap_or(PauseAfter::Unknown)
    }
}
