use crate::domain::models::{
    ActivityStatus, Conflict, ConflictKind, ConfirmationState, ItineraryDay, ScheduleItem, Severity, format_hhmm,
};
use std::collections::HashSet;

pub const SUGGESTED_RESOLUTION: &str = "Adjust time or duration";

/// Pairwise overlap check across the real activities of one day.
///
/// Every ordered pair that overlaps yields its own conflict, so an overlap
/// between `a` and `b` is reported once from each side.
pub fn detect_conflicts(day: &ItineraryDay) -> Vec<Conflict> {
    let activities = day.activities();
    let mut conflicts = Vec::new();

    for activity in &activities {
        let (start, end) = activity.interval_on(day.date);
        for other in &activities {
            if other.id == activity.id {
                continue;
            }
            let (other_start, other_end) = other.interval_on(day.date);
            if start < other_end && other_start < end {
                conflicts.push(Conflict {
                    kind: ConflictKind::TimeOverlap,
                    severity: Severity::High,
                    activity_id: activity.id.clone(),
                    conflicting_activity_id: other.id.clone(),
                    description: format!(
                        "Overlaps with \"{}\" ({})",
                        other.title,
                        format_hhmm(other.start_time)
                    ),
                    suggested_resolution: SUGGESTED_RESOLUTION.to_string(),
                });
            }
        }
    }

    conflicts
}

pub fn conflicts_for(day: &ItineraryDay, activity_id: &str) -> Vec<Conflict> {
    detect_conflicts(day)
        .into_iter()
        .filter(|conflict| conflict.activity_id == activity_id)
        .collect()
}

/// Re-derives every non-draft activity status from the day's conflicts.
/// Returns how many activities changed status.
pub fn recompute_statuses(day: &mut ItineraryDay) -> usize {
    let conflicted = detect_conflicts(day)
        .into_iter()
        .map(|conflict| conflict.activity_id)
        .collect::<HashSet<_>>();

    let mut changed = 0;
    for item in &mut day.items {
        let ScheduleItem::Activity(activity) = item else {
            continue;
        };
        if matches!(activity.status, ActivityStatus::Draft | ActivityStatus::Deleted) {
            continue;
        }
        let next = if conflicted.contains(&activity.id) {
            ActivityStatus::Conflicted
        } else if activity.confirmation == ConfirmationState::Confirmed {
            ActivityStatus::Confirmed
        } else {
            ActivityStatus::Scheduled
        };
        if activity.status != next {
            activity.status = next;
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{activity, day_with};
    use proptest::prelude::*;

    #[test]
    fn overlapping_pair_is_reported_from_both_sides() {
        let day = day_with(vec![
            activity("a", "10:00", 60, "Santos"),
            activity("b", "10:30", 60, "Santos"),
        ]);
        let conflicts = detect_conflicts(&day);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().all(|c| c.severity == Severity::High));
        assert_eq!(conflicts_for(&day, "a")[0].conflicting_activity_id, "b");
        assert_eq!(conflicts_for(&day, "a")[0].description, "Overlaps with \"Visit b\" (10:30)");
        assert_eq!(conflicts_for(&day, "b")[0].suggested_resolution, "Adjust time or duration");
    }

    #[test]
    fn back_to_back_activities_do_not_conflict() {
        let day = day_with(vec![
            activity("a", "10:00", 60, "Santos"),
            activity("b", "11:00", 60, "Santos"),
        ]);
        assert!(detect_conflicts(&day).is_empty());
    }

    #[test]
    fn activity_running_past_midnight_still_overlaps_late_neighbour() {
        let day = day_with(vec![
            activity("late", "23:00", 120, "Santos"),
            activity("later", "23:30", 15, "Santos"),
        ]);
        assert_eq!(detect_conflicts(&day).len(), 2);
    }

    #[test]
    fn statuses_follow_conflicts_and_confirmation() {
        let mut confirmed = activity("c", "14:00", 60, "Santos");
        confirmed.confirmation = ConfirmationState::Confirmed;
        let mut draft = activity("d", "16:00", 15, "Santos");
        draft.status = ActivityStatus::Draft;
        let mut day = day_with(vec![
            activity("a", "10:00", 60, "Santos"),
            activity("b", "10:30", 60, "Santos"),
            confirmed,
            draft,
        ]);

        recompute_statuses(&mut day);
        assert_eq!(day.activity("a").expect("a").status, ActivityStatus::Conflicted);
        assert_eq!(day.activity("b").expect("b").status, ActivityStatus::Conflicted);
        assert_eq!(day.activity("c").expect("c").status, ActivityStatus::Confirmed);
        assert_eq!(day.activity("d").expect("d").status, ActivityStatus::Draft);

        day.activity_mut("b").expect("b").start_time = crate::domain::models::fixtures::time("11:00");
        assert_eq!(recompute_statuses(&mut day), 2);
        assert_eq!(day.activity("a").expect("a").status, ActivityStatus::Scheduled);
    }

    proptest! {
        #[test]
        fn conflicts_are_symmetric(
            starts in proptest::collection::vec((0u32..23, 0u32..60, 1u32..240), 0..6)
        ) {
            let activities = starts
                .iter()
                .enumerate()
                .map(|(index, (hour, minute, duration))| {
                    activity(&format!("act-{index}"), &format!("{hour:02}:{minute:02}"), *duration, "Santos")
                })
                .collect::<Vec<_>>();
            let day = day_with(activities);
            let conflicts = detect_conflicts(&day);
            for conflict in &conflicts {
                let mirrored = conflicts.iter().any(|other| {
                    other.activity_id == conflict.conflicting_activity_id
                        && other.conflicting_activity_id == conflict.activity_id
                });
                prop_assert!(mirrored);
                prop_assert_ne!(&conflict.activity_id, &conflict.conflicting_activity_id);
            }
        }
    }
}
