//! Terminal tracking of an in-place refresh
//!
//! Read-only operator tooling: peek at the statefulset and pods the same way
//! the controller does and render where the rollout is. No databag access,
//! so this shows the cluster's view, not the charm's.

use crate::detect::ClusterView;
use crate::probe::{unit_snapshot, ClusterProbe};
use crate::Result;
use indicatif::{ProgressBar, ProgressStyle};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time as K8sTime;
use kube::ResourceExt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Snapshot the refresh state plus the raw pods (for age display)
pub async fn cluster_view(probe: &ClusterProbe, container: Option<&str>) -> Result<(ClusterView, Vec<Pod>)> {
    let sts = probe.statefulset().await?;
    let pods = probe.pods().await?;
    let units = pods
        .iter()
        .map(|p| unit_snapshot(p, container))
        .collect::<Result<Vec<_>>>()?;
    Ok((ClusterView::new(sts.update_revision, sts.partition, units), pods))
}

pub fn print_view(view: &ClusterView, pods: &[Pod]) {
    println!("app revision:        {}", view.app_revision);
    println!("partition:           {}", view.partition);
    println!("refresh in progress: {}", view.in_progress());
    for unit in &view.units {
        let pod_name = format!("{}-{}", unit.unit.app, unit.unit.number);
        let age = pods
            .iter()
            .find(|p| p.name_any() == pod_name)
            .map(|p| format_duration(pod_age(p)))
            .unwrap_or_else(|| "?".to_string());
        let digest = unit.image.as_ref().map(|i| i.short_digest()).unwrap_or("-");
        let marker = if unit.controller_revision == view.app_revision { "refreshed" } else { "pending" };
        println!("  {}: {} (container {digest}, age {age}, {marker})", unit.unit, unit.controller_revision);
    }
}

/// Poll until the refresh completes (all revisions converged, partition 0)
///
/// Returns `false` on timeout. The partition only moves when refreshed units
/// confirm health, so a stuck bar means the cluster is waiting on a unit or
/// on a `resume-refresh`.
pub async fn track_refresh(probe: &ClusterProbe, container: Option<&str>) -> Result<bool> {
    let poll = Duration::from_secs(5);
    let (view, _) = cluster_view(probe, container).await?;
    if !view.in_progress() && view.partition == 0 {
        info!("no refresh in progress for {}", probe.app);
        return Ok(true);
    }

    let pb = ProgressBar::new(view.units.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("> {bar:40.green/black} {prefix} {pos}/{len} ({elapsed}) {msg}")
            .expect("valid template string"),
    );
    // statefulset revisions already prefix the app name
    pb.set_prefix(view.app_revision.clone());
    pb.set_position(view.refreshed_count() as u64);

    for i in 1..240 {
        debug!("poll iteration {i}");
        sleep(poll).await;
        let (view, _) = cluster_view(probe, container).await?;
        // the app may scale mid-refresh
        pb.set_length(view.units.len() as u64);
        pb.set_position(view.refreshed_count() as u64);
        pb.set_message(format!("partition {}", view.partition));
        if !view.in_progress() && view.partition == 0 {
            pb.finish();
            return Ok(true);
        }
    }
    Ok(false) // timeout
}

fn pod_age(pod: &Pod) -> time::Duration {
    let ts = pod
        .creation_timestamp()
        .unwrap_or(K8sTime(chrono::DateTime::<chrono::Utc>::MIN_UTC))
        .0;
    let age_std = chrono::Utc::now().signed_duration_since(ts).to_std().unwrap_or_default();
    time::Duration::try_from(age_std).unwrap_or_default()
}

fn format_duration(dur: time::Duration) -> String {
    let days = dur.whole_days();
    let hours = dur.whole_hours();
    let mins = dur.whole_minutes();
    if days > 0 {
        format!("{}d", days)
    } else if hours > 0 {
        format!("{}h", hours)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", dur.whole_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn durations_render_largest_unit() {
        let start = datetime!(2024-01-01 00:00 UTC);
        assert_eq!(format_duration(datetime!(2024-01-03 01:00 UTC) - start), "2d");
        assert_eq!(format_duration(datetime!(2024-01-01 05:30 UTC) - start), "5h");
        assert_eq!(format_duration(datetime!(2024-01-01 00:12 UTC) - start), "12m");
        assert_eq!(format_duration(datetime!(2024-01-01 00:00:30 UTC) - start), "30s");
    }
}
