use crate::application::coordinator::ItineraryCoordinator;
use crate::infrastructure::itinerary_repository::ItineraryRepository;
use crate::infrastructure::realtime_channel::{RealtimeChannel, Subscription};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Feeds every event of `subscription` into the coordinator until the channel
/// closes or the task is aborted.
pub fn spawn_realtime_listener<R, P>(
    coordinator: Arc<ItineraryCoordinator<R, P>>,
    mut subscription: Subscription,
) -> JoinHandle<()>
where
    R: ItineraryRepository + 'static,
    P: RealtimeChannel + 'static,
{
    tokio::spawn(async move {
        let trip_id = subscription.trip_id().to_string();
        tracing::info!(trip_id = %trip_id, session = coordinator.session_id(), "realtime listener started");
        while let Some(event) = subscription.recv().await {
            match coordinator.apply_remote_event(&event).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(kind = event.kind.as_str(), entity_id = %event.entity_id, "realtime event skipped");
                }
                Err(error) => {
                    tracing::warn!(kind = event.kind.as_str(), %error, "realtime event could not be applied");
                }
            }
        }
        tracing::info!(trip_id = %trip_id, "realtime listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::coordinator::ActivityDraft;
    use crate::application::travel_synthesis::fakes::TableRouteResolver;
    use crate::domain::models::fixtures::{activity, date};
    use crate::domain::models::{ItineraryDay, Location, Trip};
    use crate::infrastructure::itinerary_repository::InMemoryItineraryRepository;
    use crate::infrastructure::realtime_channel::InProcessRealtimeChannel;
    use tokio::time::{Duration, sleep};

    fn sample_trip() -> Trip {
        let mut day = ItineraryDay::new("day-1", "trip-1", date("2024-09-16"), 1);
        day.insert_activity(activity("port", "09:00", 120, "Port Authority, Santos"));
        Trip {
            id: "trip-1".to_string(),
            title: "Coffee sourcing".to_string(),
            start_date: date("2024-09-16"),
            end_date: date("2024-09-17"),
            time_zone: "America/Sao_Paulo".to_string(),
            days: vec![day, ItineraryDay::new("day-2", "trip-1", date("2024-09-17"), 2)],
        }
    }

    fn meeting(day_id: &str, title: &str, start: &str) -> ActivityDraft {
        ActivityDraft {
            day_id: day_id.to_string(),
            title: title.to_string(),
            kind: "meeting".to_string(),
            start_time: start.to_string(),
            duration_minutes: 60,
            location: Location::from_address("Av. Paulista, Sao Paulo"),
            ..ActivityDraft::default()
        }
    }

    #[tokio::test]
    async fn listener_applies_changes_from_another_session() {
        let repository = Arc::new(InMemoryItineraryRepository::default());
        repository.save_trip(&sample_trip()).expect("seed trip");
        let channel = Arc::new(InProcessRealtimeChannel::default());
        let resolver = Arc::new(TableRouteResolver::default().with("Santos", "Sao Paulo", 75));

        let editor = ItineraryCoordinator::new(Arc::clone(&repository), Arc::clone(&channel), resolver.clone());
        editor.load_trip("trip-1").await.expect("editor load");
        let viewer = Arc::new(ItineraryCoordinator::new(
            Arc::clone(&repository),
            Arc::clone(&channel),
            resolver,
        ));
        viewer.load_trip("trip-1").await.expect("viewer load");
        let listener = spawn_realtime_listener(Arc::clone(&viewer), channel.subscribe("trip-1").expect("subscribe"));

        let saved = editor
            .save_activity(meeting("day-1", "Exporter meeting", "14:00"))
            .await
            .expect("save");

        let mut seen = false;
        for _ in 0..50 {
            let day = viewer.day_snapshot("day-1").expect("day");
            if day.activity(&saved.activity.id).is_some() {
                assert_eq!(day.travel_segments().len(), 1);
                seen = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "viewer never observed the new activity");

        listener.abort();
    }

    #[tokio::test]
    async fn lagging_listener_reloads_changes_it_missed() {
        let repository = Arc::new(InMemoryItineraryRepository::default());
        repository.save_trip(&sample_trip()).expect("seed trip");
        let channel = Arc::new(InProcessRealtimeChannel::with_capacity(1));
        let resolver = Arc::new(TableRouteResolver::default().with("Santos", "Sao Paulo", 75));

        let editor = ItineraryCoordinator::new(Arc::clone(&repository), Arc::clone(&channel), resolver.clone());
        editor.load_trip("trip-1").await.expect("editor load");
        let viewer = Arc::new(ItineraryCoordinator::new(
            Arc::clone(&repository),
            Arc::clone(&channel),
            resolver,
        ));
        viewer.load_trip("trip-1").await.expect("viewer load");
        let subscription = channel.subscribe("trip-1").expect("subscribe");

        let missed = editor
            .save_activity(meeting("day-1", "Exporter meeting", "14:00"))
            .await
            .expect("first save");
        let latest = editor
            .save_activity(meeting("day-2", "Roaster tour", "10:00"))
            .await
            .expect("second save");
        let listener = spawn_realtime_listener(Arc::clone(&viewer), subscription);

        let mut seen = false;
        for _ in 0..50 {
            let trip = viewer.trip_snapshot().expect("trip");
            let has_missed = trip.day("day-1").is_some_and(|day| day.activity(&missed.activity.id).is_some());
            let has_latest = trip.day("day-2").is_some_and(|day| day.activity(&latest.activity.id).is_some());
            if has_missed && has_latest {
                assert_eq!(trip.day("day-1").expect("day-1").travel_segments().len(), 1);
                seen = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "viewer never caught up after lagging");

        listener.abort();
    }
}
