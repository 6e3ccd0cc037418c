use crate::application::autosave::{AutosaveOutcome, AutosaveScheduler, RepositoryAutosaveSink};
use crate::application::distance_resolver::{NowProvider, RouteResolver};
use crate::application::travel_synthesis::{SynthesisPolicy, TravelSegmentSynthesizer};
use crate::domain::conflicts::{conflicts_for, recompute_statuses};
use crate::domain::flight_buffer::{BufferCalculator, BufferOptions, BufferResult, FlightArrival};
use crate::domain::models::{
    Activity, ActivityKind, ActivityStatus, Conflict, ConfirmationState, ExtendDirection, ItineraryDay,
    Location, TravelSegment, Trip, format_hhmm, parse_hhmm, validate_non_empty,
};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::error::EngineError;
use crate::infrastructure::event_mapper::{
    RealtimeEvent, RealtimeEventKind, affected_day_ids, encode_activity_event, encode_delete_event,
    encode_move_event, encode_trip_event, encode_update_event,
};
use crate::infrastructure::itinerary_repository::ItineraryRepository;
use crate::infrastructure::realtime_channel::RealtimeChannel;
use crate::infrastructure::storage::next_id;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::time::Duration;

/// Create-or-patch request for one activity. Text fields are validated before
/// anything changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActivityDraft {
    pub id: Option<String>,
    pub day_id: String,
    pub title: String,
    pub kind: String,
    pub start_time: String,
    pub duration_minutes: u32,
    pub location: Location,
    pub host: Option<String>,
    pub attendees: BTreeSet<String>,
    pub confirmation: ConfirmationState,
}

impl ActivityDraft {
    fn validate(&self) -> Result<(ActivityKind, NaiveTime), EngineError> {
        validate_non_empty(&self.title, "title").map_err(EngineError::InvalidInput)?;
        validate_non_empty(&self.day_id, "day_id").map_err(EngineError::InvalidInput)?;
        let kind = self.kind.parse::<ActivityKind>().map_err(EngineError::InvalidInput)?;
        let start_time = parse_hhmm(&self.start_time, "start_time").map_err(EngineError::InvalidInput)?;
        if self.duration_minutes == 0 {
            return Err(EngineError::InvalidInput("duration_minutes must be > 0".to_string()));
        }
        Ok((kind, start_time))
    }

    fn apply_to(&self, activity: &mut Activity, kind: ActivityKind, start_time: NaiveTime) {
        activity.day_id = self.day_id.trim().to_string();
        activity.title = self.title.trim().to_string();
        activity.kind = kind;
        activity.start_time = start_time;
        activity.duration_minutes = self.duration_minutes;
        activity.location = self.location.clone();
        activity.host = self.host.clone();
        activity.attendees = self.attendees.clone();
        activity.confirmation = self.confirmation;
        if activity.status == ActivityStatus::Draft {
            activity.status = ActivityStatus::Scheduled;
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MutationOutcome {
    pub activity: Activity,
    pub conflicts: Vec<Conflict>,
    pub travel_segments: Vec<TravelSegment>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    trip: Option<Trip>,
    /// Staged activity id to the day it was stored on before staging.
    staged_activities: BTreeMap<String, String>,
    staged_days: BTreeSet<String>,
}

/// A staged edit taken back by a committed mutation of the same activity.
struct WithdrawnEdit {
    origin_day_id: String,
    payload: Option<Activity>,
}

enum RowWrite {
    Upsert(String),
    Delete(String),
    AlreadyStored,
}

enum RowRestore {
    Upsert(Activity),
    Delete(String),
}

/// Distinct day ids in write order. Days an activity leaves come before the day
/// it enters: segment ids are global primary keys, so a left day's stale rows
/// are cleared before the entered day writes ids that may collide with them.
fn affected(day_ids: &[&str]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(day_ids.len());
    for day_id in day_ids {
        if !ordered.iter().any(|known| known.as_str() == *day_id) {
            ordered.push((*day_id).to_string());
        }
    }
    ordered
}

fn statuses_of(trip: &Trip, day_ids: &[String]) -> Vec<(String, ActivityStatus)> {
    day_ids
        .iter()
        .filter_map(|day_id| trip.day(day_id))
        .flat_map(|day| day.activities())
        .map(|activity| (activity.id.clone(), activity.status))
        .collect()
}

/// Serializes itinerary mutations for one session and keeps the in-memory trip,
/// the store, travel segments and subscribers consistent.
pub struct ItineraryCoordinator<R, P>
where
    R: ItineraryRepository + 'static,
    P: RealtimeChannel + 'static,
{
    repository: Arc<R>,
    realtime: Arc<P>,
    synthesizer: TravelSegmentSynthesizer,
    buffer_calculator: BufferCalculator,
    autosave: AutosaveScheduler<RepositoryAutosaveSink<R>>,
    runtime: Mutex<RuntimeState>,
    mutation_lock: AsyncMutex<()>,
    session_id: String,
    actor: Option<String>,
    now_provider: NowProvider,
}

impl<R, P> ItineraryCoordinator<R, P>
where
    R: ItineraryRepository + 'static,
    P: RealtimeChannel + 'static,
{
    pub fn new(repository: Arc<R>, realtime: Arc<P>, resolver: Arc<dyn RouteResolver>) -> Self {
        let autosave = AutosaveScheduler::new(Arc::new(RepositoryAutosaveSink::new(Arc::clone(&repository))));
        Self {
            repository,
            realtime,
            synthesizer: TravelSegmentSynthesizer::new(resolver),
            buffer_calculator: BufferCalculator::default(),
            autosave,
            runtime: Mutex::new(RuntimeState::default()),
            mutation_lock: AsyncMutex::new(()),
            session_id: next_id("session"),
            actor: None,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        repository: Arc<R>,
        realtime: Arc<P>,
        resolver: Arc<dyn RouteResolver>,
    ) -> Self {
        Self::new(repository, realtime, resolver)
            .with_synthesis_policy(SynthesisPolicy {
                negligible_minutes: config.travel.negligible_minutes,
                walk_max_minutes: config.travel.walk_max_minutes,
            })
            .with_buffer_calculator(BufferCalculator::new(
                config.flights.domestic_airports.clone(),
                config.flights.pickup_buffer_minutes,
            ))
            .with_autosave_delay(Duration::from_millis(config.autosave.delay_ms))
    }

    /// Acting user stamped on `updated_by` of every activity this coordinator writes.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: TravelSegmentSynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_synthesis_policy(mut self, policy: SynthesisPolicy) -> Self {
        self.synthesizer = self.synthesizer.with_policy(policy);
        self
    }

    pub fn with_buffer_calculator(mut self, buffer_calculator: BufferCalculator) -> Self {
        self.buffer_calculator = buffer_calculator;
        self
    }

    pub fn with_autosave_delay(mut self, delay: Duration) -> Self {
        self.autosave = AutosaveScheduler::with_delay(
            Arc::new(RepositoryAutosaveSink::new(Arc::clone(&self.repository))),
            delay,
        );
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn autosave_outcomes(&self) -> broadcast::Receiver<AutosaveOutcome> {
        self.autosave.subscribe()
    }

    pub async fn load_trip(&self, trip_id: &str) -> Result<Trip, EngineError> {
        let _guard = self.mutation_lock.lock().await;
        let result = self.fetch_trip(trip_id).and_then(|trip| {
            self.install_trip(trip.clone())?;
            Ok(trip)
        });
        match result {
            Ok(trip) => {
                tracing::info!(trip_id, days = trip.days.len(), "trip loaded");
                Ok(trip)
            }
            Err(error) => Err(self.command_error("load_trip", error)),
        }
    }

    pub fn trip_snapshot(&self) -> Result<Trip, EngineError> {
        self.current_trip()
    }

    pub fn day_snapshot(&self, day_id: &str) -> Result<ItineraryDay, EngineError> {
        self.current_trip()?
            .day(day_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("day {day_id}")))
    }

    pub async fn move_activity(
        &self,
        activity_id: &str,
        new_day_id: &str,
        new_time: &str,
    ) -> Result<MutationOutcome, EngineError> {
        self.move_activity_inner(activity_id, new_day_id, new_time)
            .await
            .map_err(|error| self.command_error("move_activity", error))
    }

    async fn move_activity_inner(
        &self,
        activity_id: &str,
        new_day_id: &str,
        new_time: &str,
    ) -> Result<MutationOutcome, EngineError> {
        let start_time = parse_hhmm(new_time, "new_time").map_err(EngineError::InvalidInput)?;
        let _guard = self.mutation_lock.lock().await;

        let snapshot = self.current_trip()?;
        let (old_day_id, original) = snapshot
            .find_activity(activity_id)
            .map(|(day, activity)| (day.id.clone(), activity.clone()))
            .ok_or_else(|| EngineError::NotFound(format!("activity {activity_id}")))?;
        if snapshot.day(new_day_id).is_none() {
            return Err(EngineError::NotFound(format!("day {new_day_id}")));
        }

        let mut moved = original.clone();
        moved.day_id = new_day_id.to_string();
        moved.start_time = start_time;
        moved.updated_by = self.actor.clone();

        let mut trip = snapshot.clone();
        if let Some(day) = trip.day_mut(&old_day_id) {
            day.remove_activity(activity_id);
        }
        if let Some(day) = trip.day_mut(new_day_id) {
            day.insert_activity(moved);
        }

        let withdrawn = self.withdraw_staged(activity_id)?;
        let from_day_id = withdrawn
            .as_ref()
            .map_or_else(|| old_day_id.clone(), |edit| edit.origin_day_id.clone());
        let days = affected(&[from_day_id.as_str(), old_day_id.as_str(), new_day_id]);
        let committed = self
            .commit(
                snapshot,
                trip,
                RowWrite::Upsert(activity_id.to_string()),
                RowRestore::Upsert(original),
                &days,
            )
            .await;
        let trip = match committed {
            Ok(trip) => trip,
            Err(error) => {
                self.restage(activity_id, withdrawn);
                return Err(error);
            }
        };

        let outcome = outcome_for(&trip, activity_id)?;
        self.publish(
            "move_activity",
            encode_move_event(&trip.id, &from_day_id, &outcome.activity, &self.session_id, self.now()),
        );
        tracing::info!(
            activity_id,
            from_day = %old_day_id,
            to_day = new_day_id,
            start = %format_hhmm(start_time),
            segments = outcome.travel_segments.len(),
            conflicts = outcome.conflicts.len(),
            "activity moved"
        );
        Ok(outcome)
    }

    pub async fn save_activity(&self, draft: ActivityDraft) -> Result<MutationOutcome, EngineError> {
        self.save_activity_inner(draft)
            .await
            .map_err(|error| self.command_error("save_activity", error))
    }

    async fn save_activity_inner(&self, draft: ActivityDraft) -> Result<MutationOutcome, EngineError> {
        let (kind, start_time) = draft.validate()?;
        let day_id = draft.day_id.trim().to_string();
        let _guard = self.mutation_lock.lock().await;

        let snapshot = self.current_trip()?;
        if snapshot.day(&day_id).is_none() {
            return Err(EngineError::NotFound(format!("day {day_id}")));
        }

        let existing_id = draft
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned);

        let (trip, activity_id, from_day_id) = match existing_id {
            Some(activity_id) => {
                let (old_day_id, original) = snapshot
                    .find_activity(&activity_id)
                    .map(|(day, activity)| (day.id.clone(), activity.clone()))
                    .ok_or_else(|| EngineError::NotFound(format!("activity {activity_id}")))?;

                let mut patched = original.clone();
                draft.apply_to(&mut patched, kind, start_time);
                patched.updated_by = self.actor.clone();

                let mut trip = snapshot.clone();
                if let Some(day) = trip.day_mut(&old_day_id) {
                    day.remove_activity(&activity_id);
                }
                if let Some(day) = trip.day_mut(&day_id) {
                    day.insert_activity(patched);
                }

                let withdrawn = self.withdraw_staged(&activity_id)?;
                let from_day_id = withdrawn
                    .as_ref()
                    .map_or_else(|| old_day_id.clone(), |edit| edit.origin_day_id.clone());
                let days = affected(&[from_day_id.as_str(), old_day_id.as_str(), day_id.as_str()]);
                let committed = self
                    .commit(
                        snapshot,
                        trip,
                        RowWrite::Upsert(activity_id.clone()),
                        RowRestore::Upsert(original),
                        &days,
                    )
                    .await;
                match committed {
                    Ok(trip) => (trip, activity_id, Some(from_day_id)),
                    Err(error) => {
                        self.restage(&activity_id, withdrawn);
                        return Err(error);
                    }
                }
            }
            None => {
                let mut candidate = Activity {
                    id: String::new(),
                    day_id: day_id.clone(),
                    title: String::new(),
                    kind,
                    start_time,
                    duration_minutes: draft.duration_minutes,
                    location: Location::default(),
                    host: None,
                    attendees: BTreeSet::new(),
                    status: ActivityStatus::Draft,
                    confirmation: ConfirmationState::Unconfirmed,
                    updated_by: None,
                };
                draft.apply_to(&mut candidate, kind, start_time);
                candidate.updated_by = self.actor.clone();

                let stored = self.repository.insert_activity(&candidate)?;
                let activity_id = stored.id.clone();
                let mut trip = snapshot.clone();
                if let Some(day) = trip.day_mut(&day_id) {
                    day.insert_activity(stored);
                }

                let trip = self
                    .commit(
                        snapshot,
                        trip,
                        RowWrite::AlreadyStored,
                        RowRestore::Delete(activity_id.clone()),
                        &[day_id.clone()],
                    )
                    .await?;
                (trip, activity_id, None)
            }
        };

        let outcome = outcome_for(&trip, &activity_id)?;
        let (kind_of_event, event) = match &from_day_id {
            Some(from_day_id) => (
                RealtimeEventKind::ActivityUpdated,
                encode_update_event(&trip.id, from_day_id, &outcome.activity, &self.session_id, self.now()),
            ),
            None => (
                RealtimeEventKind::ActivityCreated,
                encode_activity_event(
                    RealtimeEventKind::ActivityCreated,
                    &trip.id,
                    &outcome.activity,
                    &self.session_id,
                    self.now(),
                ),
            ),
        };
        self.publish("save_activity", event);
        tracing::info!(
            activity_id = %activity_id,
            day_id = %outcome.activity.day_id,
            event = kind_of_event.as_str(),
            conflicts = outcome.conflicts.len(),
            "activity saved"
        );
        Ok(outcome)
    }

    /// Removes an activity. Unknown ids return `Ok(false)`.
    pub async fn delete_activity(&self, activity_id: &str) -> Result<bool, EngineError> {
        self.delete_activity_inner(activity_id)
            .await
            .map_err(|error| self.command_error("delete_activity", error))
    }

    async fn delete_activity_inner(&self, activity_id: &str) -> Result<bool, EngineError> {
        let _guard = self.mutation_lock.lock().await;
        let snapshot = self.current_trip()?;
        let Some((day, original)) = snapshot
            .find_activity(activity_id)
            .map(|(day, activity)| (day.clone(), activity.clone()))
        else {
            tracing::info!(activity_id, "delete requested for unknown activity");
            return Ok(false);
        };

        let mut trip = snapshot.clone();
        if let Some(owning_day) = trip.day_mut(&day.id) {
            owning_day.remove_activity(activity_id);
        }
        let withdrawn = self.withdraw_staged(activity_id)?;
        let event_day = withdrawn
            .as_ref()
            .and_then(|edit| snapshot.day(&edit.origin_day_id))
            .cloned()
            .unwrap_or_else(|| day.clone());
        let days = affected(&[event_day.id.as_str(), day.id.as_str()]);
        let committed = self
            .commit(
                snapshot,
                trip,
                RowWrite::Delete(activity_id.to_string()),
                RowRestore::Upsert(original),
                &days,
            )
            .await;
        let trip = match committed {
            Ok(trip) => trip,
            Err(error) => {
                self.restage(activity_id, withdrawn);
                return Err(error);
            }
        };

        self.publish(
            "delete_activity",
            Ok(encode_delete_event(&trip.id, &event_day, activity_id, &self.session_id, self.now())),
        );
        tracing::info!(activity_id, day_id = %day.id, "activity deleted");
        Ok(true)
    }

    /// Widens the trip by `days` before its start or after its end, creating
    /// missing days and renumbering every day from the new start.
    pub async fn extend_trip_dates(&self, direction: ExtendDirection, days: u32) -> Result<Trip, EngineError> {
        self.extend_trip_dates_inner(direction, days)
            .await
            .map_err(|error| self.command_error("extend_trip_dates", error))
    }

    async fn extend_trip_dates_inner(&self, direction: ExtendDirection, days: u32) -> Result<Trip, EngineError> {
        if days < 1 {
            return Err(EngineError::InvalidInput("days must be >= 1".to_string()));
        }
        let _guard = self.mutation_lock.lock().await;
        let snapshot = self.current_trip()?;

        let shift = chrono::Duration::days(i64::from(days));
        let mut trip = snapshot.clone();
        let out_of_range = || EngineError::InvalidInput(format!("cannot extend trip by {days} days"));
        match direction {
            ExtendDirection::Before => {
                trip.start_date = trip.start_date.checked_sub_signed(shift).ok_or_else(out_of_range)?;
            }
            ExtendDirection::After => {
                trip.end_date = trip.end_date.checked_add_signed(shift).ok_or_else(out_of_range)?;
            }
        }
        self.install_trip(trip.clone())?;

        let created_day_ids = match self.persist_date_range(&mut trip) {
            Ok(created_day_ids) => created_day_ids,
            Err(error) => {
                self.install_trip(snapshot)?;
                return Err(error);
            }
        };
        for day in &mut trip.days {
            recompute_statuses(day);
        }
        self.install_trip(trip.clone())?;

        self.publish(
            "extend_trip_dates",
            encode_trip_event(&trip, created_day_ids.clone(), &self.session_id, self.now()),
        );
        tracing::info!(
            trip_id = %trip.id,
            direction = %direction,
            days,
            created = created_day_ids.len(),
            start = %trip.start_date,
            end = %trip.end_date,
            "trip dates extended"
        );
        Ok(trip)
    }

    fn persist_date_range(&self, trip: &mut Trip) -> Result<Vec<String>, EngineError> {
        let mut created_day_ids = Vec::new();
        let mut date = trip.start_date;
        while date <= trip.end_date {
            if trip.day_for_date(date).is_none() {
                let (day, created) = self
                    .repository
                    .insert_day_if_absent(&trip.id, date, trip.day_number_for(date))?;
                if created {
                    created_day_ids.push(day.id.clone());
                }
                trip.days.push(day);
            }
            date = date
                .succ_opt()
                .ok_or_else(|| EngineError::InvalidInput("trip date range overflows the calendar".to_string()))?;
        }
        self.repository
            .update_trip_dates(&trip.id, trip.start_date, trip.end_date)?;

        let previous_numbers = trip
            .days
            .iter()
            .map(|day| (day.id.clone(), day.day_number))
            .collect::<HashMap<_, _>>();
        trip.renumber_days();
        for day in &trip.days {
            if previous_numbers.get(&day.id) != Some(&day.day_number) {
                self.repository.update_day_number(&day.id, day.day_number)?;
            }
        }
        Ok(created_day_ids)
    }

    /// Conflicts of one activity against the rest of its day.
    pub fn detect_conflicts(&self, activity_id: &str) -> Result<Vec<Conflict>, EngineError> {
        let trip = self.current_trip()?;
        let (day, _) = trip
            .find_activity(activity_id)
            .ok_or_else(|| EngineError::NotFound(format!("activity {activity_id}")))?;
        Ok(conflicts_for(day, activity_id))
    }

    /// Landing and pickup estimate; falls back to the loaded trip's time zone.
    pub fn compute_buffer(&self, flight: &FlightArrival, options: &BufferOptions) -> Result<BufferResult, EngineError> {
        let mut options = options.clone();
        if options.time_zone.is_none() {
            let runtime = self.lock_runtime()?;
            options.time_zone = runtime.trip.as_ref().map(|trip| trip.time_zone.clone());
        }
        let result = self
            .buffer_calculator
            .compute(flight, &options)
            .map_err(|error| self.command_error("compute_buffer", error))?;
        tracing::debug!(
            buffer_minutes = result.buffer_minutes,
            pickup = %result.recommended_pickup,
            "flight buffer computed"
        );
        Ok(result)
    }

    /// In-progress edit: patched in memory and persisted by the debounced autosave.
    pub async fn stage_activity_edit(&self, activity: Activity) -> Result<(), EngineError> {
        self.stage_activity_edit_inner(activity)
            .await
            .map_err(|error| self.command_error("stage_activity_edit", error))
    }

    async fn stage_activity_edit_inner(&self, mut activity: Activity) -> Result<(), EngineError> {
        activity.validate().map_err(EngineError::InvalidInput)?;
        activity.updated_by = self.actor.clone();
        let _guard = self.mutation_lock.lock().await;

        let staged = {
            let mut runtime = self.lock_runtime()?;
            let trip = runtime
                .trip
                .as_mut()
                .ok_or_else(|| EngineError::NotFound("no trip loaded".to_string()))?;
            if trip.day(&activity.day_id).is_none() {
                return Err(EngineError::NotFound(format!("day {}", activity.day_id)));
            }
            let old_day_id = trip
                .find_activity(&activity.id)
                .map(|(day, _)| day.id.clone())
                .ok_or_else(|| EngineError::NotFound(format!("activity {}", activity.id)))?;

            if let Some(day) = trip.day_mut(&old_day_id) {
                day.remove_activity(&activity.id);
                recompute_statuses(day);
            }
            let new_day_id = activity.day_id.clone();
            if let Some(day) = trip.day_mut(&new_day_id) {
                day.insert_activity(activity.clone());
                recompute_statuses(day);
            }
            let staged = trip
                .find_activity(&activity.id)
                .map(|(_, staged)| staged.clone())
                .unwrap_or(activity);
            runtime
                .staged_activities
                .entry(staged.id.clone())
                .or_insert_with(|| old_day_id.clone());
            runtime.staged_days.insert(old_day_id);
            runtime.staged_days.insert(new_day_id);
            staged
        };

        tracing::debug!(activity_id = %staged.id, day_id = %staged.day_id, "activity edit staged");
        self.autosave.schedule(&staged.id.clone(), staged)
    }

    /// Flushes pending autosaves, then stores recomputed statuses and travel
    /// segments for every staged day.
    pub async fn save_now(&self) -> Result<usize, EngineError> {
        self.save_now_inner()
            .await
            .map_err(|error| self.command_error("save_now", error))
    }

    async fn save_now_inner(&self) -> Result<usize, EngineError> {
        let _guard = self.mutation_lock.lock().await;
        let flushed = self.autosave.save_now().await?;

        let (activity_ids, day_ids) = {
            let mut runtime = self.lock_runtime()?;
            let activity_ids = std::mem::take(&mut runtime.staged_activities);
            let day_ids = std::mem::take(&mut runtime.staged_days);
            (activity_ids, day_ids)
        };
        if day_ids.is_empty() {
            return Ok(flushed);
        }

        let mut trip = self.current_trip()?;
        let day_ids = day_ids.into_iter().collect::<Vec<_>>();
        self.repository.update_activity_statuses(&statuses_of(&trip, &day_ids))?;
        self.resynthesize_days(&mut trip, &day_ids).await?;
        self.install_trip(trip.clone())?;

        for (activity_id, origin_day_id) in &activity_ids {
            if let Some((_, activity)) = trip.find_activity(activity_id) {
                self.publish(
                    "save_now",
                    encode_update_event(&trip.id, origin_day_id, activity, &self.session_id, self.now()),
                );
            }
        }
        tracing::info!(flushed, days = day_ids.len(), "staged edits saved");
        Ok(flushed)
    }

    /// Reloads what a remote change touched. Returns `false` when the event was
    /// ignored (own session, other trip, or nothing loaded).
    pub async fn apply_remote_event(&self, event: &RealtimeEvent) -> Result<bool, EngineError> {
        self.apply_remote_event_inner(event)
            .await
            .map_err(|error| self.command_error("apply_remote_event", error))
    }

    async fn apply_remote_event_inner(&self, event: &RealtimeEvent) -> Result<bool, EngineError> {
        if event.origin_session == self.session_id {
            return Ok(false);
        }
        let _guard = self.mutation_lock.lock().await;
        let loaded = { self.lock_runtime()?.trip.clone() };
        let Some(mut trip) = loaded else {
            return Ok(false);
        };
        if trip.id != event.trip_id {
            return Ok(false);
        }

        let day_ids = affected_day_ids(event);
        let reload_ids = if day_ids.is_empty() {
            trip = self.fetch_trip(&event.trip_id)?;
            trip.days.iter().map(|day| day.id.clone()).collect::<Vec<_>>()
        } else {
            for day_id in &day_ids {
                match self.repository.load_day(day_id)? {
                    Some(day) => match trip.day_mut(day_id) {
                        Some(existing) => *existing = day,
                        None => trip.days.push(day),
                    },
                    None => trip.days.retain(|day| &day.id != day_id),
                }
            }
            trip.days.sort_by_key(|day| day.date);
            day_ids
        };

        for day_id in &reload_ids {
            let Some(day) = trip.day(day_id) else {
                continue;
            };
            let plan = self.synthesizer.synthesize(day).await;
            if let Some(day) = trip.day_mut(day_id) {
                plan.apply_to(day);
                recompute_statuses(day);
            }
        }
        self.install_trip(trip)?;

        tracing::info!(
            trip_id = %event.trip_id,
            kind = event.kind.as_str(),
            entity_id = %event.entity_id,
            days = reload_ids.len(),
            "realtime change reloaded"
        );
        Ok(true)
    }

    /// Cancels pending autosave timers without saving.
    pub fn shutdown(&self) -> Result<usize, EngineError> {
        self.autosave.shutdown()
    }

    async fn commit(
        &self,
        snapshot: Trip,
        mut trip: Trip,
        write: RowWrite,
        restore: RowRestore,
        day_ids: &[String],
    ) -> Result<Trip, EngineError> {
        for day_id in day_ids {
            if let Some(day) = trip.day_mut(day_id) {
                recompute_statuses(day);
            }
        }
        self.install_trip(trip.clone())?;

        let written = match &write {
            RowWrite::Upsert(activity_id) => match trip.find_activity(activity_id) {
                Some((_, activity)) => self.repository.upsert_activity(activity),
                None => Err(EngineError::NotFound(format!("activity {activity_id}"))),
            },
            RowWrite::Delete(activity_id) => self.repository.delete_activity(activity_id).map(|_| ()),
            RowWrite::AlreadyStored => Ok(()),
        };
        if let Err(error) = written {
            self.install_trip(snapshot)?;
            return Err(error);
        }

        if let Err(error) = self.repository.update_activity_statuses(&statuses_of(&trip, day_ids)) {
            self.restore_row(restore);
            self.install_trip(snapshot)?;
            return Err(error);
        }

        if let Err(error) = self.resynthesize_days(&mut trip, day_ids).await {
            self.restore_statuses(&statuses_of(&snapshot, day_ids));
            self.restore_row(restore);
            self.install_trip(snapshot)?;
            return Err(error);
        }
        self.install_trip(trip.clone())?;
        Ok(trip)
    }

    /// Regenerates and stores travel segments day by day. A failed write undoes
    /// the segment writes of the days already handled.
    async fn resynthesize_days(&self, trip: &mut Trip, day_ids: &[String]) -> Result<(), EngineError> {
        let mut written: Vec<(String, Vec<TravelSegment>)> = Vec::new();
        for day_id in day_ids {
            let Some(day) = trip.day(day_id) else {
                continue;
            };
            let previous = day.travel_segments().into_iter().cloned().collect::<Vec<_>>();
            let plan = self.synthesizer.synthesize(day).await;

            if let Err(error) = self.repository.replace_travel_segments(day_id, &plan.to_create) {
                for (done_day_id, previous) in written.iter().rev() {
                    if let Err(undo_error) = self.repository.replace_travel_segments(done_day_id, previous) {
                        tracing::error!(day_id = %done_day_id, error = %undo_error, "travel segment undo failed");
                    }
                }
                return Err(error);
            }

            written.push((day_id.clone(), previous));
            if let Some(day) = trip.day_mut(day_id) {
                plan.apply_to(day);
            }
        }
        Ok(())
    }

    fn restore_row(&self, restore: RowRestore) {
        let (activity_id, result) = match restore {
            RowRestore::Upsert(activity) => {
                let result = self.repository.upsert_activity(&activity);
                (activity.id, result)
            }
            RowRestore::Delete(activity_id) => {
                let result = self.repository.delete_activity(&activity_id).map(|_| ());
                (activity_id, result)
            }
        };
        match result {
            Ok(()) => tracing::warn!(activity_id = %activity_id, "activity row restored after failed commit"),
            Err(error) => tracing::error!(activity_id = %activity_id, %error, "compensating activity restore failed"),
        }
    }

    fn restore_statuses(&self, statuses: &[(String, ActivityStatus)]) {
        if let Err(error) = self.repository.update_activity_statuses(statuses) {
            tracing::error!(%error, "compensating status restore failed");
        }
    }

    /// Takes back the staged edit of `activity_id`, if any, so its autosave
    /// cannot overwrite a committed write.
    fn withdraw_staged(&self, activity_id: &str) -> Result<Option<WithdrawnEdit>, EngineError> {
        let payload = self.autosave.cancel(activity_id)?;
        let origin_day_id = self.lock_runtime()?.staged_activities.remove(activity_id);
        if payload.is_some() || origin_day_id.is_some() {
            tracing::debug!(activity_id, "staged edit superseded by committed write");
        }
        Ok(origin_day_id.map(|origin_day_id| WithdrawnEdit { origin_day_id, payload }))
    }

    fn restage(&self, activity_id: &str, withdrawn: Option<WithdrawnEdit>) {
        let Some(edit) = withdrawn else {
            return;
        };
        match self.lock_runtime() {
            Ok(mut runtime) => {
                runtime
                    .staged_activities
                    .insert(activity_id.to_string(), edit.origin_day_id);
            }
            Err(error) => tracing::error!(activity_id, %error, "staged edit could not be restored"),
        }
        if let Some(payload) = edit.payload {
            if let Err(error) = self.autosave.schedule(activity_id, payload) {
                tracing::error!(activity_id, %error, "staged autosave could not be rescheduled");
            }
        }
    }

    fn fetch_trip(&self, trip_id: &str) -> Result<Trip, EngineError> {
        let mut trip = self
            .repository
            .load_trip(trip_id)?
            .ok_or_else(|| EngineError::NotFound(format!("trip {trip_id}")))?;
        trip.days.sort_by_key(|day| day.date);
        for day in &mut trip.days {
            day.sort_items();
            recompute_statuses(day);
        }
        Ok(trip)
    }

    fn lock_runtime(&self) -> Result<MutexGuard<'_, RuntimeState>, EngineError> {
        self.runtime
            .lock()
            .map_err(|error| EngineError::lock_poisoned("coordinator runtime", error))
    }

    fn current_trip(&self) -> Result<Trip, EngineError> {
        self.lock_runtime()?
            .trip
            .clone()
            .ok_or_else(|| EngineError::NotFound("no trip loaded".to_string()))
    }

    fn install_trip(&self, trip: Trip) -> Result<(), EngineError> {
        self.lock_runtime()?.trip = Some(trip);
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    fn publish(&self, command: &str, event: Result<RealtimeEvent, EngineError>) {
        match event.and_then(|event| self.realtime.publish(event)) {
            Ok(delivered) => tracing::debug!(command, delivered, "realtime event published"),
            Err(error) => tracing::warn!(command, %error, "realtime publish failed"),
        }
    }

    fn command_error(&self, command: &str, error: EngineError) -> EngineError {
        tracing::error!(command, session = %self.session_id, %error, "itinerary command failed");
        error
    }
}

fn outcome_for(trip: &Trip, activity_id: &str) -> Result<MutationOutcome, EngineError> {
    let (day, activity) = trip
        .find_activity(activity_id)
        .ok_or_else(|| EngineError::NotFound(format!("activity {activity_id}")))?;
    Ok(MutationOutcome {
        activity: activity.clone(),
        conflicts: conflicts_for(day, activity_id),
        travel_segments: day.travel_segments().into_iter().cloned().collect(),
    })
}
