use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Meeting,
    Visit,
    Meal,
    Hotel,
    Conference,
    Other,
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "meeting" => Ok(Self::Meeting),
            "visit" => Ok(Self::Visit),
            "meal" | "meal_break" => Ok(Self::Meal),
            "hotel" | "accommodation" => Ok(Self::Hotel),
            "conference" | "event" => Ok(Self::Conference),
            "other" => Ok(Self::Other),
            other => Err(format!("unsupported activity kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Draft,
    Scheduled,
    Confirmed,
    Conflicted,
    Deleted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    #[default]
    Unconfirmed,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Location {
    pub address: String,
    pub city: Option<String>,
    pub place_id: Option<String>,
}

impl Location {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            city: None,
            place_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub id: String,
    pub day_id: String,
    pub title: String,
    pub kind: ActivityKind,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub location: Location,
    pub host: Option<String>,
    pub attendees: BTreeSet<String>,
    pub status: ActivityStatus,
    pub confirmation: ConfirmationState,
    pub updated_by: Option<String>,
}

impl Activity {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "activity.id")?;
        validate_non_empty(&self.day_id, "activity.day_id")?;
        validate_non_empty(&self.title, "activity.title")?;
        if self.duration_minutes == 0 {
            return Err("activity.duration_minutes must be > 0".to_string());
        }
        Ok(())
    }

    /// End time on the wall clock; wraps past midnight.
    pub fn end_time(&self) -> NaiveTime {
        self.start_time + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Half-open interval `[start, end)` anchored on `date`, so activities that
    /// run past midnight keep a correct ordering.
    pub fn interval_on(&self, date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        let start = date.and_time(self.start_time);
        (start, start + Duration::minutes(i64::from(self.duration_minutes)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    Walk,
    Drive,
}

impl TravelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Walk => "walk",
            Self::Drive => "drive",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionConfidence {
    Live,
    Cached,
    Degraded,
}

impl ResolutionConfidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Cached => "cached",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TravelSegment {
    pub id: String,
    pub day_id: String,
    pub from_activity_id: String,
    pub to_activity_id: String,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub mode: TravelMode,
    pub title: String,
    pub description: String,
    pub from_location: String,
    pub to_location: String,
    pub confidence: ResolutionConfidence,
}

impl TravelSegment {
    pub fn id_for(from_activity_id: &str, to_activity_id: &str) -> String {
        format!("travel-{from_activity_id}-{to_activity_id}")
    }

    pub fn end_time(&self) -> NaiveTime {
        self.start_time + Duration::minutes(i64::from(self.duration_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "item_type", rename_all = "snake_case")]
pub enum ScheduleItem {
    Activity(Activity),
    Travel(TravelSegment),
}

impl ScheduleItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Activity(activity) => &activity.id,
            Self::Travel(segment) => &segment.id,
        }
    }

    pub fn start_time(&self) -> NaiveTime {
        match self {
            Self::Activity(activity) => activity.start_time,
            Self::Travel(segment) => segment.start_time,
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            Self::Activity(activity) => Some(activity),
            Self::Travel(_) => None,
        }
    }

    pub fn as_travel(&self) -> Option<&TravelSegment> {
        match self {
            Self::Travel(segment) => Some(segment),
            Self::Activity(_) => None,
        }
    }

    fn sort_key(&self) -> (NaiveTime, u8, &str) {
        match self {
            Self::Activity(activity) => (activity.start_time, 0, activity.id.as_str()),
            Self::Travel(segment) => (segment.start_time, 1, segment.id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItineraryDay {
    pub id: String,
    pub trip_id: String,
    pub date: NaiveDate,
    pub day_number: u32,
    pub items: Vec<ScheduleItem>,
}

impl ItineraryDay {
    pub fn new(id: impl Into<String>, trip_id: impl Into<String>, date: NaiveDate, day_number: u32) -> Self {
        Self {
            id: id.into(),
            trip_id: trip_id.into(),
            date,
            day_number,
            items: Vec::new(),
        }
    }

    /// Real activities ordered by start time. Stored item order is never trusted.
    pub fn activities(&self) -> Vec<&Activity> {
        let mut activities = self
            .items
            .iter()
            .filter_map(ScheduleItem::as_activity)
            .collect::<Vec<_>>();
        activities.sort_by(|left, right| {
            left.start_time
                .cmp(&right.start_time)
                .then_with(|| left.id.cmp(&right.id))
        });
        activities
    }

    pub fn travel_segments(&self) -> Vec<&TravelSegment> {
        self.items.iter().filter_map(ScheduleItem::as_travel).collect()
    }

    pub fn activity(&self, activity_id: &str) -> Option<&Activity> {
        self.items
            .iter()
            .filter_map(ScheduleItem::as_activity)
            .find(|activity| activity.id == activity_id)
    }

    pub fn activity_mut(&mut self, activity_id: &str) -> Option<&mut Activity> {
        self.items.iter_mut().find_map(|item| match item {
            ScheduleItem::Activity(activity) if activity.id == activity_id => Some(activity),
            _ => None,
        })
    }

    pub fn insert_activity(&mut self, activity: Activity) {
        self.items.push(ScheduleItem::Activity(activity));
        self.sort_items();
    }

    pub fn remove_activity(&mut self, activity_id: &str) -> Option<Activity> {
        let index = self.items.iter().position(|item| {
            item.as_activity()
                .map(|activity| activity.id == activity_id)
                .unwrap_or(false)
        })?;
        match self.items.remove(index) {
            ScheduleItem::Activity(activity) => Some(activity),
            ScheduleItem::Travel(_) => None,
        }
    }

    /// Drops every travel segment and inserts the given ones in a single step.
    pub fn replace_travel_segments(&mut self, segments: Vec<TravelSegment>) {
        self.items.retain(|item| item.as_travel().is_none());
        self.items.extend(segments.into_iter().map(ScheduleItem::Travel));
        self.sort_items();
    }

    pub fn sort_items(&mut self) {
        self.items.sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trip {
    pub id: String,
    pub title: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub time_zone: String,
    pub days: Vec<ItineraryDay>,
}

impl Trip {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "trip.id")?;
        if self.end_date < self.start_date {
            return Err("trip.end_date must be on or after trip.start_date".to_string());
        }
        Ok(())
    }

    pub fn day(&self, day_id: &str) -> Option<&ItineraryDay> {
        self.days.iter().find(|day| day.id == day_id)
    }

    pub fn day_mut(&mut self, day_id: &str) -> Option<&mut ItineraryDay> {
        self.days.iter_mut().find(|day| day.id == day_id)
    }

    pub fn day_for_date(&self, date: NaiveDate) -> Option<&ItineraryDay> {
        self.days.iter().find(|day| day.date == date)
    }

    pub fn find_activity(&self, activity_id: &str) -> Option<(&ItineraryDay, &Activity)> {
        self.days.iter().find_map(|day| {
            day.activity(activity_id)
                .map(|activity| (day, activity))
        })
    }

    /// 1-based ordinal of `date` counted from the trip start.
    pub fn day_number_for(&self, date: NaiveDate) -> u32 {
        let offset = (date - self.start_date).num_days();
        u32::try_from(offset + 1).unwrap_or(0)
    }

    pub fn renumber_days(&mut self) {
        self.days.sort_by_key(|day| day.date);
        let start_date = self.start_date;
        for day in &mut self.days {
            let offset = (day.date - start_date).num_days();
            day.day_number = u32::try_from(offset + 1).unwrap_or(0);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    TimeOverlap,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub activity_id: String,
    pub conflicting_activity_id: String,
    pub description: String,
    pub suggested_resolution: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtendDirection {
    Before,
    After,
}

impl FromStr for ExtendDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            other => Err(format!("direction must be \"before\" or \"after\", got {other:?}")),
        }
    }
}

impl fmt::Display for ExtendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Before => "before",
            Self::After => "after",
        })
    }
}

pub(crate) fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

/// Parses a 24-hour `H:MM` / `HH:MM` wall-clock time.
pub fn parse_hhmm(value: &str, field_name: &str) -> Result<NaiveTime, String> {
    let invalid = || format!("{field_name} must be HH:MM (24-hour)");
    let mut split = value.trim().split(':');
    let (Some(hour_str), Some(minute_str), None) = (split.next(), split.next(), split.next()) else {
        return Err(invalid());
    };
    if hour_str.is_empty()
        || hour_str.len() > 2
        || minute_str.len() != 2
        || !hour_str.bytes().all(|byte| byte.is_ascii_digit())
        || !minute_str.bytes().all(|byte| byte.is_ascii_digit())
    {
        return Err(invalid());
    }

    let hour = hour_str.parse::<u32>().map_err(|_| invalid())?;
    let minute = minute_str.parse::<u32>().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Parses a strict `YYYY-MM-DD` calendar date.
pub fn parse_date(value: &str, field_name: &str) -> Result<NaiveDate, String> {
    let value = value.trim();
    let bytes = value.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(index, byte)| index == 4 || index == 7 || byte.is_ascii_digit());
    if !well_formed {
        return Err(format!("{field_name} must be YYYY-MM-DD"));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("{field_name} must be YYYY-MM-DD"))
}

pub fn format_hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}
