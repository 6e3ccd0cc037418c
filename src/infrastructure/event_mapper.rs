use crate::domain::models::{Activity, ItineraryDay, Trip};
use crate::infrastructure::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEventKind {
    ActivityCreated,
    ActivityUpdated,
    ActivityMoved,
    ActivityDeleted,
    TripModified,
}

impl RealtimeEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActivityCreated => "activity_created",
            Self::ActivityUpdated => "activity_updated",
            Self::ActivityMoved => "activity_moved",
            Self::ActivityDeleted => "activity_deleted",
            Self::TripModified => "trip_modified",
        }
    }
}

/// Change notification fanned out to every viewer of one trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeEvent {
    pub trip_id: String,
    pub kind: RealtimeEventKind,
    pub entity_id: String,
    pub day_id: Option<String>,
    pub origin_session: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct MovePayload {
    from_day_id: String,
    activity: Activity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TripDatesPayload {
    start_date: String,
    end_date: String,
    created_day_ids: Vec<String>,
}

pub fn encode_activity_event(
    kind: RealtimeEventKind,
    trip_id: &str,
    activity: &Activity,
    origin_session: &str,
    timestamp: DateTime<Utc>,
) -> Result<RealtimeEvent, EngineError> {
    Ok(RealtimeEvent {
        trip_id: trip_id.to_string(),
        kind,
        entity_id: activity.id.clone(),
        day_id: Some(activity.day_id.clone()),
        origin_session: origin_session.to_string(),
        timestamp,
        payload: serde_json::to_value(activity)?,
    })
}

pub fn encode_move_event(
    trip_id: &str,
    from_day_id: &str,
    activity: &Activity,
    origin_session: &str,
    timestamp: DateTime<Utc>,
) -> Result<RealtimeEvent, EngineError> {
    encode_with_previous_day(
        RealtimeEventKind::ActivityMoved,
        trip_id,
        from_day_id,
        activity,
        origin_session,
        timestamp,
    )
}

/// Patch notification. Carries the day the activity was on before the patch so
/// receivers drop it there when the patch changed its day.
pub fn encode_update_event(
    trip_id: &str,
    from_day_id: &str,
    activity: &Activity,
    origin_session: &str,
    timestamp: DateTime<Utc>,
) -> Result<RealtimeEvent, EngineError> {
    encode_with_previous_day(
        RealtimeEventKind::ActivityUpdated,
        trip_id,
        from_day_id,
        activity,
        origin_session,
        timestamp,
    )
}

fn encode_with_previous_day(
    kind: RealtimeEventKind,
    trip_id: &str,
    from_day_id: &str,
    activity: &Activity,
    origin_session: &str,
    timestamp: DateTime<Utc>,
) -> Result<RealtimeEvent, EngineError> {
    let payload = MovePayload {
        from_day_id: from_day_id.to_string(),
        activity: activity.clone(),
    };
    Ok(RealtimeEvent {
        trip_id: trip_id.to_string(),
        kind,
        entity_id: activity.id.clone(),
        day_id: Some(activity.day_id.clone()),
        origin_session: origin_session.to_string(),
        timestamp,
        payload: serde_json::to_value(payload)?,
    })
}

pub fn encode_delete_event(
    trip_id: &str,
    day: &ItineraryDay,
    activity_id: &str,
    origin_session: &str,
    timestamp: DateTime<Utc>,
) -> RealtimeEvent {
    RealtimeEvent {
        trip_id: trip_id.to_string(),
        kind: RealtimeEventKind::ActivityDeleted,
        entity_id: activity_id.to_string(),
        day_id: Some(day.id.clone()),
        origin_session: origin_session.to_string(),
        timestamp,
        payload: serde_json::Value::Null,
    }
}

pub fn encode_trip_event(
    trip: &Trip,
    created_day_ids: Vec<String>,
    origin_session: &str,
    timestamp: DateTime<Utc>,
) -> Result<RealtimeEvent, EngineError> {
    let payload = TripDatesPayload {
        start_date: trip.start_date.format("%Y-%m-%d").to_string(),
        end_date: trip.end_date.format("%Y-%m-%d").to_string(),
        created_day_ids,
    };
    Ok(RealtimeEvent {
        trip_id: trip.id.clone(),
        kind: RealtimeEventKind::TripModified,
        entity_id: trip.id.clone(),
        day_id: None,
        origin_session: origin_session.to_string(),
        timestamp,
        payload: serde_json::to_value(payload)?,
    })
}

/// Origin session stamped on events a lagging subscriber synthesizes for itself.
pub const RESYNC_ORIGIN: &str = "resync";

/// Whole-trip reload request, used when a subscriber missed events.
pub fn resync_event(trip_id: &str, timestamp: DateTime<Utc>) -> RealtimeEvent {
    RealtimeEvent {
        trip_id: trip_id.to_string(),
        kind: RealtimeEventKind::TripModified,
        entity_id: trip_id.to_string(),
        day_id: None,
        origin_session: RESYNC_ORIGIN.to_string(),
        timestamp,
        payload: serde_json::Value::Null,
    }
}

/// Days a receiver must reload for `event`; empty means reload the whole trip.
pub fn affected_day_ids(event: &RealtimeEvent) -> Vec<String> {
    let mut day_ids = Vec::new();
    if event.kind == RealtimeEventKind::TripModified {
        return day_ids;
    }
    if matches!(event.kind, RealtimeEventKind::ActivityMoved | RealtimeEventKind::ActivityUpdated) {
        if let Ok(payload) = serde_json::from_value::<MovePayload>(event.payload.clone()) {
            day_ids.push(payload.from_day_id);
        }
    }
    if let Some(day_id) = event.day_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        if !day_ids.iter().any(|known| known == day_id) {
            day_ids.push(day_id.to_string());
        }
    }
    day_ids
}

pub fn decode_activity_payload(event: &RealtimeEvent) -> Result<Option<Activity>, EngineError> {
    match event.kind {
        RealtimeEventKind::ActivityCreated => Ok(Some(serde_json::from_value(event.payload.clone())?)),
        RealtimeEventKind::ActivityUpdated => {
            match serde_json::from_value::<MovePayload>(event.payload.clone()) {
                Ok(payload) => Ok(Some(payload.activity)),
                Err(_) => Ok(Some(serde_json::from_value(event.payload.clone())?)),
            }
        }
        RealtimeEventKind::ActivityMoved => {
            let payload: MovePayload = serde_json::from_value(event.payload.clone())?;
            Ok(Some(payload.activity))
        }
        RealtimeEventKind::ActivityDeleted | RealtimeEventKind::TripModified => Ok(None),
    }
}

/// JSON wire form for transports outside the process.
pub fn to_wire(event: &RealtimeEvent) -> Result<String, EngineError> {
    Ok(serde_json::to_string(event)?)
}

pub fn from_wire(raw: &str) -> Result<RealtimeEvent, EngineError> {
    let event: RealtimeEvent = serde_json::from_str(raw)?;
    if event.trip_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("realtime event trip_id must not be empty".to_string()));
    }
    Ok(event)
}
