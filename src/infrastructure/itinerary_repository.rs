use crate::domain::models::{
    Activity, ActivityStatus, ItineraryDay, Location, ScheduleItem, TravelSegment, Trip, format_hhmm,
};
use crate::infrastructure::error::EngineError;
use crate::infrastructure::storage::next_id;
use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Row-level store for trips, days, activities and travel segments.
///
/// Writes are last-write-wins per row; there is no version check.
pub trait ItineraryRepository: Send + Sync {
    /// Upserts the trip row together with every day and item it carries.
    fn save_trip(&self, trip: &Trip) -> Result<(), EngineError>;
    fn load_trip(&self, trip_id: &str) -> Result<Option<Trip>, EngineError>;
    fn load_day(&self, day_id: &str) -> Result<Option<ItineraryDay>, EngineError>;
    fn update_trip_dates(&self, trip_id: &str, start_date: NaiveDate, end_date: NaiveDate) -> Result<(), EngineError>;
    /// Returns the day for `(trip_id, date)` and whether this call created it.
    fn insert_day_if_absent(
        &self,
        trip_id: &str,
        date: NaiveDate,
        day_number: u32,
    ) -> Result<(ItineraryDay, bool), EngineError>;
    fn update_day_number(&self, day_id: &str, day_number: u32) -> Result<(), EngineError>;
    /// Stores a new activity under a freshly allocated id and returns it.
    fn insert_activity(&self, activity: &Activity) -> Result<Activity, EngineError>;
    fn upsert_activity(&self, activity: &Activity) -> Result<(), EngineError>;
    fn delete_activity(&self, activity_id: &str) -> Result<bool, EngineError>;
    /// Atomically swaps every stored segment of the day, including ones written
    /// by other sessions, for `segments`. Segment ids are global keys, so a
    /// row with the same id on another day moves to this one.
    fn replace_travel_segments(&self, day_id: &str, segments: &[TravelSegment]) -> Result<(), EngineError>;
    /// Rewrites only the status column of the listed activities; unknown ids
    /// are skipped.
    fn update_activity_statuses(&self, statuses: &[(String, ActivityStatus)]) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct SqliteItineraryRepository {
    db_path: PathBuf,
}

impl SqliteItineraryRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, EngineError> {
        let connection = Connection::open(&self.db_path)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(connection)
    }
}

fn to_sql_text<T: Serialize>(value: &T) -> Result<String, EngineError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(EngineError::Persistence(format!("expected string enum, got {other}"))),
    }
}

fn from_sql_text<T: DeserializeOwned>(raw: String, column: &str) -> Result<T, EngineError> {
    serde_json::from_value(serde_json::Value::String(raw.clone()))
        .map_err(|_| EngineError::Persistence(format!("invalid {column} value '{raw}'")))
}

fn parse_stored_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|error| EngineError::Persistence(format!("invalid stored date '{raw}': {error}")))
}

fn parse_stored_time(raw: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|error| EngineError::Persistence(format!("invalid stored time '{raw}': {error}")))
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

struct ActivityRow {
    id: String,
    day_id: String,
    title: String,
    kind: String,
    start_time: String,
    duration_minutes: u32,
    address: String,
    city: Option<String>,
    place_id: Option<String>,
    host: Option<String>,
    attendees_json: String,
    status: String,
    confirmation: String,
    updated_by: Option<String>,
}

impl ActivityRow {
    const COLUMNS: &'static str = "id, day_id, title, kind, start_time, duration_minutes, address, city, \
         place_id, host, attendees_json, status, confirmation, updated_by";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            day_id: row.get(1)?,
            title: row.get(2)?,
            kind: row.get(3)?,
            start_time: row.get(4)?,
            duration_minutes: row.get(5)?,
            address: row.get(6)?,
            city: row.get(7)?,
            place_id: row.get(8)?,
            host: row.get(9)?,
            attendees_json: row.get(10)?,
            status: row.get(11)?,
            confirmation: row.get(12)?,
            updated_by: row.get(13)?,
        })
    }

    fn into_activity(self) -> Result<Activity, EngineError> {
        let attendees: BTreeSet<String> = serde_json::from_str(&self.attendees_json)?;
        Ok(Activity {
            start_time: parse_stored_time(&self.start_time)?,
            kind: from_sql_text(self.kind, "activities.kind")?,
            status: from_sql_text(self.status, "activities.status")?,
            confirmation: from_sql_text(self.confirmation, "activities.confirmation")?,
            id: self.id,
            day_id: self.day_id,
            title: self.title,
            duration_minutes: self.duration_minutes,
            location: Location {
                address: self.address,
                city: self.city,
                place_id: self.place_id,
            },
            host: self.host,
            attendees,
            updated_by: self.updated_by,
        })
    }
}

struct SegmentRow {
    id: String,
    day_id: String,
    from_activity_id: String,
    to_activity_id: String,
    start_time: String,
    duration_minutes: u32,
    mode: String,
    title: String,
    description: String,
    from_location: String,
    to_location: String,
    confidence: String,
}

impl SegmentRow {
    const COLUMNS: &'static str = "id, day_id, from_activity_id, to_activity_id, start_time, duration_minutes, \
         mode, title, description, from_location, to_location, confidence";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            day_id: row.get(1)?,
            from_activity_id: row.get(2)?,
            to_activity_id: row.get(3)?,
            start_time: row.get(4)?,
            duration_minutes: row.get(5)?,
            mode: row.get(6)?,
            title: row.get(7)?,
            description: row.get(8)?,
            from_location: row.get(9)?,
            to_location: row.get(10)?,
            confidence: row.get(11)?,
        })
    }

    fn into_segment(self) -> Result<TravelSegment, EngineError> {
        Ok(TravelSegment {
            start_time: parse_stored_time(&self.start_time)?,
            mode: from_sql_text(self.mode, "travel_segments.mode")?,
            confidence: from_sql_text(self.confidence, "travel_segments.confidence")?,
            id: self.id,
            day_id: self.day_id,
            from_activity_id: self.from_activity_id,
            to_activity_id: self.to_activity_id,
            duration_minutes: self.duration_minutes,
            title: self.title,
            description: self.description,
            from_location: self.from_location,
            to_location: self.to_location,
        })
    }
}

fn write_activity(connection: &Connection, activity: &Activity) -> Result<(), EngineError> {
    connection.execute(
        "INSERT INTO activities (
           id, day_id, title, kind, start_time, duration_minutes, address, city, place_id,
           host, attendees_json, status, confirmation, updated_by, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
           day_id = excluded.day_id,
           title = excluded.title,
           kind = excluded.kind,
           start_time = excluded.start_time,
           duration_minutes = excluded.duration_minutes,
           address = excluded.address,
           city = excluded.city,
           place_id = excluded.place_id,
           host = excluded.host,
           attendees_json = excluded.attendees_json,
           status = excluded.status,
           confirmation = excluded.confirmation,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        params![
            activity.id,
            activity.day_id,
            activity.title,
            to_sql_text(&activity.kind)?,
            format_hhmm(activity.start_time),
            activity.duration_minutes,
            activity.location.address,
            activity.location.city,
            activity.location.place_id,
            activity.host,
            serde_json::to_string(&activity.attendees)?,
            to_sql_text(&activity.status)?,
            to_sql_text(&activity.confirmation)?,
            activity.updated_by,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn write_segment(transaction: &Transaction<'_>, segment: &TravelSegment) -> Result<(), EngineError> {
    transaction.execute(
        "INSERT OR REPLACE INTO travel_segments (
           id, day_id, from_activity_id, to_activity_id, start_time, duration_minutes,
           mode, title, description, from_location, to_location, confidence
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            segment.id,
            segment.day_id,
            segment.from_activity_id,
            segment.to_activity_id,
            format_hhmm(segment.start_time),
            segment.duration_minutes,
            to_sql_text(&segment.mode)?,
            segment.title,
            segment.description,
            segment.from_location,
            segment.to_location,
            to_sql_text(&segment.confidence)?,
        ],
    )?;
    Ok(())
}

fn read_day_items(connection: &Connection, day: &mut ItineraryDay) -> Result<(), EngineError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {} FROM activities WHERE day_id = ?1",
        ActivityRow::COLUMNS
    ))?;
    let rows = statement
        .query_map(params![day.id], ActivityRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    for row in rows {
        day.items.push(ScheduleItem::Activity(row.into_activity()?));
    }

    let mut statement = connection.prepare(&format!(
        "SELECT {} FROM travel_segments WHERE day_id = ?1",
        SegmentRow::COLUMNS
    ))?;
    let rows = statement
        .query_map(params![day.id], SegmentRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    for row in rows {
        day.items.push(ScheduleItem::Travel(row.into_segment()?));
    }

    day.sort_items();
    Ok(())
}

fn read_day(connection: &Connection, day_id: &str) -> Result<Option<ItineraryDay>, EngineError> {
    let row: Option<(String, String, String, u32)> = connection
        .query_row(
            "SELECT id, trip_id, date, day_number FROM itinerary_days WHERE id = ?1",
            params![day_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((id, trip_id, date_raw, day_number)) = row else {
        return Ok(None);
    };
    let mut day = ItineraryDay::new(id, trip_id, parse_stored_date(&date_raw)?, day_number);
    read_day_items(connection, &mut day)?;
    Ok(Some(day))
}

impl ItineraryRepository for SqliteItineraryRepository {
    fn save_trip(&self, trip: &Trip) -> Result<(), EngineError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute(
            "INSERT INTO trips (id, title, start_date, end_date, time_zone, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               start_date = excluded.start_date,
               end_date = excluded.end_date,
               time_zone = excluded.time_zone,
               updated_at = excluded.updated_at",
            params![
                trip.id,
                trip.title,
                date_text(trip.start_date),
                date_text(trip.end_date),
                trip.time_zone,
                Utc::now().to_rfc3339(),
            ],
        )?;
        for day in &trip.days {
            transaction.execute(
                "INSERT INTO itinerary_days (id, trip_id, date, day_number)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET date = excluded.date, day_number = excluded.day_number",
                params![day.id, trip.id, date_text(day.date), day.day_number],
            )?;
            for item in &day.items {
                match item {
                    ScheduleItem::Activity(activity) => write_activity(&transaction, activity)?,
                    ScheduleItem::Travel(segment) => write_segment(&transaction, segment)?,
                }
            }
        }
        transaction.commit()?;
        Ok(())
    }

    fn load_trip(&self, trip_id: &str) -> Result<Option<Trip>, EngineError> {
        let connection = self.connect()?;
        let row: Option<(String, String, String, String, String)> = connection
            .query_row(
                "SELECT id, title, start_date, end_date, time_zone FROM trips WHERE id = ?1",
                params![trip_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        let Some((id, title, start_raw, end_raw, time_zone)) = row else {
            return Ok(None);
        };

        let mut statement = connection.prepare(
            "SELECT id, date, day_number FROM itinerary_days WHERE trip_id = ?1 ORDER BY date ASC",
        )?;
        let day_rows = statement
            .query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut days = Vec::with_capacity(day_rows.len());
        for (day_id, date_raw, day_number) in day_rows {
            let mut day = ItineraryDay::new(day_id, id.clone(), parse_stored_date(&date_raw)?, day_number);
            read_day_items(&connection, &mut day)?;
            days.push(day);
        }

        Ok(Some(Trip {
            start_date: parse_stored_date(&start_raw)?,
            end_date: parse_stored_date(&end_raw)?,
            id,
            title,
            time_zone,
            days,
        }))
    }

    fn load_day(&self, day_id: &str) -> Result<Option<ItineraryDay>, EngineError> {
        let connection = self.connect()?;
        read_day(&connection, day_id)
    }

    fn update_trip_dates(&self, trip_id: &str, start_date: NaiveDate, end_date: NaiveDate) -> Result<(), EngineError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE trips SET start_date = ?2, end_date = ?3, updated_at = ?4 WHERE id = ?1",
            params![trip_id, date_text(start_date), date_text(end_date), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("trip {trip_id}")));
        }
        Ok(())
    }

    fn insert_day_if_absent(
        &self,
        trip_id: &str,
        date: NaiveDate,
        day_number: u32,
    ) -> Result<(ItineraryDay, bool), EngineError> {
        let connection = self.connect()?;
        let created = connection.execute(
            "INSERT OR IGNORE INTO itinerary_days (id, trip_id, date, day_number) VALUES (?1, ?2, ?3, ?4)",
            params![next_id("day"), trip_id, date_text(date), day_number],
        )? > 0;
        let day_id: String = connection.query_row(
            "SELECT id FROM itinerary_days WHERE trip_id = ?1 AND date = ?2",
            params![trip_id, date_text(date)],
            |row| row.get(0),
        )?;
        let day = read_day(&connection, &day_id)?
            .ok_or_else(|| EngineError::Persistence(format!("day {day_id} vanished after insert")))?;
        Ok((day, created))
    }

    fn update_day_number(&self, day_id: &str, day_number: u32) -> Result<(), EngineError> {
        let connection = self.connect()?;
        connection.execute(
            "UPDATE itinerary_days SET day_number = ?2 WHERE id = ?1",
            params![day_id, day_number],
        )?;
        Ok(())
    }

    fn insert_activity(&self, activity: &Activity) -> Result<Activity, EngineError> {
        let connection = self.connect()?;
        let mut stored = activity.clone();
        stored.id = next_id("act");
        write_activity(&connection, &stored)?;
        Ok(stored)
    }

    fn upsert_activity(&self, activity: &Activity) -> Result<(), EngineError> {
        let connection = self.connect()?;
        write_activity(&connection, activity)
    }

    fn delete_activity(&self, activity_id: &str) -> Result<bool, EngineError> {
        let connection = self.connect()?;
        let deleted = connection.execute("DELETE FROM activities WHERE id = ?1", params![activity_id])?;
        Ok(deleted > 0)
    }

    fn replace_travel_segments(&self, day_id: &str, segments: &[TravelSegment]) -> Result<(), EngineError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute("DELETE FROM travel_segments WHERE day_id = ?1", params![day_id])?;
        for segment in segments {
            write_segment(&transaction, segment)?;
        }
        transaction.commit()?;
        Ok(())
    }

    fn update_activity_statuses(&self, statuses: &[(String, ActivityStatus)]) -> Result<(), EngineError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        for (activity_id, status) in statuses {
            transaction.execute(
                "UPDATE activities SET status = ?1 WHERE id = ?2",
                params![to_sql_text(status)?, activity_id],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }
}

/// Whole trips kept in a map; used by tests and embedders without SQLite.
#[derive(Debug, Default)]
pub struct InMemoryItineraryRepository {
    trips: Mutex<HashMap<String, Trip>>,
}

impl InMemoryItineraryRepository {
    fn with_trips<T>(&self, f: impl FnOnce(&mut HashMap<String, Trip>) -> Result<T, EngineError>) -> Result<T, EngineError> {
        let mut trips = self
            .trips
            .lock()
            .map_err(|error| EngineError::lock_poisoned("itinerary store", error))?;
        f(&mut trips)
    }
}

fn find_day_mut<'a>(trips: &'a mut HashMap<String, Trip>, day_id: &str) -> Option<&'a mut ItineraryDay> {
    trips.values_mut().find_map(|trip| trip.day_mut(day_id))
}

fn remove_activity_everywhere(trips: &mut HashMap<String, Trip>, activity_id: &str) -> bool {
    let mut removed = false;
    for trip in trips.values_mut() {
        for day in &mut trip.days {
            removed |= day.remove_activity(activity_id).is_some();
        }
    }
    removed
}

impl ItineraryRepository for InMemoryItineraryRepository {
    fn save_trip(&self, trip: &Trip) -> Result<(), EngineError> {
        self.with_trips(|trips| {
            let mut stored = trip.clone();
            stored.days.sort_by_key(|day| day.date);
            trips.insert(stored.id.clone(), stored);
            Ok(())
        })
    }

    fn load_trip(&self, trip_id: &str) -> Result<Option<Trip>, EngineError> {
        self.with_trips(|trips| Ok(trips.get(trip_id).cloned()))
    }

    fn load_day(&self, day_id: &str) -> Result<Option<ItineraryDay>, EngineError> {
        self.with_trips(|trips| Ok(find_day_mut(trips, day_id).map(|day| day.clone())))
    }

    fn update_trip_dates(&self, trip_id: &str, start_date: NaiveDate, end_date: NaiveDate) -> Result<(), EngineError> {
        self.with_trips(|trips| {
            let trip = trips
                .get_mut(trip_id)
                .ok_or_else(|| EngineError::NotFound(format!("trip {trip_id}")))?;
            trip.start_date = start_date;
            trip.end_date = end_date;
            Ok(())
        })
    }

    fn insert_day_if_absent(
        &self,
        trip_id: &str,
        date: NaiveDate,
        day_number: u32,
    ) -> Result<(ItineraryDay, bool), EngineError> {
        self.with_trips(|trips| {
            let trip = trips
                .get_mut(trip_id)
                .ok_or_else(|| EngineError::NotFound(format!("trip {trip_id}")))?;
            if let Some(existing) = trip.day_for_date(date) {
                return Ok((existing.clone(), false));
            }
            let day = ItineraryDay::new(next_id("day"), trip_id, date, day_number);
            trip.days.push(day.clone());
            trip.days.sort_by_key(|day| day.date);
            Ok((day, true))
        })
    }

    fn update_day_number(&self, day_id: &str, day_number: u32) -> Result<(), EngineError> {
        self.with_trips(|trips| {
            if let Some(day) = find_day_mut(trips, day_id) {
                day.day_number = day_number;
            }
            Ok(())
        })
    }

    fn insert_activity(&self, activity: &Activity) -> Result<Activity, EngineError> {
        self.with_trips(|trips| {
            let mut stored = activity.clone();
            stored.id = next_id("act");
            let day = find_day_mut(trips, &stored.day_id)
                .ok_or_else(|| EngineError::NotFound(format!("day {}", stored.day_id)))?;
            day.insert_activity(stored.clone());
            Ok(stored)
        })
    }

    fn upsert_activity(&self, activity: &Activity) -> Result<(), EngineError> {
        self.with_trips(|trips| {
            if find_day_mut(trips, &activity.day_id).is_none() {
                return Err(EngineError::NotFound(format!("day {}", activity.day_id)));
            }
            remove_activity_everywhere(trips, &activity.id);
            if let Some(day) = find_day_mut(trips, &activity.day_id) {
                day.insert_activity(activity.clone());
            }
            Ok(())
        })
    }

    fn delete_activity(&self, activity_id: &str) -> Result<bool, EngineError> {
        self.with_trips(|trips| Ok(remove_activity_everywhere(trips, activity_id)))
    }

    fn replace_travel_segments(&self, day_id: &str, segments: &[TravelSegment]) -> Result<(), EngineError> {
        self.with_trips(|trips| {
            if find_day_mut(trips, day_id).is_none() {
                return Err(EngineError::NotFound(format!("day {day_id}")));
            }
            for trip in trips.values_mut() {
                for day in trip.days.iter_mut().filter(|day| day.id != day_id) {
                    let kept = day
                        .travel_segments()
                        .into_iter()
                        .filter(|existing| segments.iter().all(|segment| segment.id != existing.id))
                        .cloned()
                        .collect::<Vec<_>>();
                    day.replace_travel_segments(kept);
                }
            }
            if let Some(day) = find_day_mut(trips, day_id) {
                day.replace_travel_segments(segments.to_vec());
            }
            Ok(())
        })
    }

    fn update_activity_statuses(&self, statuses: &[(String, ActivityStatus)]) -> Result<(), EngineError> {
        self.with_trips(|trips| {
            for (activity_id, status) in statuses {
                let stored = trips
                    .values_mut()
                    .flat_map(|trip| trip.days.iter_mut())
                    .find_map(|day| day.activity_mut(activity_id));
                if let Some(activity) = stored {
                    activity.status = *status;
                }
            }
            Ok(())
        })
    }
}
