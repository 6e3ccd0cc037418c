use crate::application::distance_resolver::RouteResolver;
use crate::domain::location::{CityTokenResolver, LocationResolver};
use crate::domain::models::{ItineraryDay, ResolutionConfidence, TravelMode, TravelSegment};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisPolicy {
    /// Travel at or below this many minutes gets no segment.
    pub negligible_minutes: u32,
    /// Travel at or below this many minutes is walked; above it is driven.
    pub walk_max_minutes: u32,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            negligible_minutes: 9,
            walk_max_minutes: 12,
        }
    }
}

/// Full replace-set for one day's travel segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SynthesisPlan {
    pub day_id: String,
    pub to_delete: Vec<String>,
    pub to_create: Vec<TravelSegment>,
}

impl SynthesisPlan {
    pub fn apply_to(&self, day: &mut ItineraryDay) {
        day.replace_travel_segments(self.to_create.clone());
    }
}

pub struct TravelSegmentSynthesizer {
    resolver: Arc<dyn RouteResolver>,
    locations: Arc<dyn LocationResolver>,
    policy: SynthesisPolicy,
}

impl TravelSegmentSynthesizer {
    pub fn new(resolver: Arc<dyn RouteResolver>) -> Self {
        Self {
            resolver,
            locations: Arc::new(CityTokenResolver),
            policy: SynthesisPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SynthesisPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_location_resolver(mut self, locations: Arc<dyn LocationResolver>) -> Self {
        self.locations = locations;
        self
    }

    pub fn policy(&self) -> SynthesisPolicy {
        self.policy
    }

    pub async fn synthesize(&self, day: &ItineraryDay) -> SynthesisPlan {
        let to_delete = day
            .travel_segments()
            .into_iter()
            .map(|segment| segment.id.clone())
            .collect::<Vec<_>>();

        let activities = day.activities();
        let mut to_create = Vec::new();
        for pair in activities.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let from_token = self.locations.location_token(from);
            let to_token = self.locations.location_token(to);
            let estimate = self
                .resolver
                .resolve_or_estimate(&from_token, &to_token, TravelMode::Drive)
                .await;

            let minutes = u32::try_from(estimate.duration_seconds.div_ceil(60)).unwrap_or(u32::MAX);
            if minutes <= self.policy.negligible_minutes {
                continue;
            }
            let mode = if minutes <= self.policy.walk_max_minutes {
                TravelMode::Walk
            } else {
                TravelMode::Drive
            };
            let (title, mut description) = match mode {
                TravelMode::Walk => (
                    format!("Walk to {to_token}"),
                    format!("Walking between offices in {to_token}"),
                ),
                TravelMode::Drive => (
                    format!("Drive to {to_token}"),
                    format!("Travel from {from_token} to {to_token} ({minutes} min drive)"),
                ),
            };
            if estimate.confidence == ResolutionConfidence::Degraded {
                description.push_str(" [estimated]");
            }

            to_create.push(TravelSegment {
                id: TravelSegment::id_for(&from.id, &to.id),
                day_id: day.id.clone(),
                from_activity_id: from.id.clone(),
                to_activity_id: to.id.clone(),
                start_time: from.end_time(),
                duration_minutes: minutes,
                mode,
                title,
                description,
                from_location: from_token,
                to_location: to_token,
                confidence: estimate.confidence,
            });
        }

        tracing::debug!(
            day_id = %day.id,
            deleted = to_delete.len(),
            created = to_create.len(),
            "travel segments synthesized"
        );
        SynthesisPlan {
            day_id: day.id.clone(),
            to_delete,
            to_create,
        }
    }
}
