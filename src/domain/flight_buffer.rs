use crate::domain::models::{parse_date, parse_hhmm};
use crate::infrastructure::error::EngineError;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_PICKUP_BUFFER_MINUTES: u32 = 15;
pub const DEFAULT_DOMESTIC_AIRPORTS: &[&str] =
    &["GRU", "GIG", "BSB", "CGH", "SDU", "SSA", "FOR", "REC", "BEL", "MAO"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlightType {
    International,
    Domestic,
}

impl fmt::Display for FlightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::International => "international",
            Self::Domestic => "domestic",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AirportSize {
    Small,
    Medium,
    Large,
    MajorHub,
}

impl fmt::Display for AirportSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::MajorHub => "major_hub",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AirportProfile {
    airport_type: FlightType,
    size: AirportSize,
}

fn known_airport(code: &str) -> Option<AirportProfile> {
    use AirportSize::*;
    use FlightType::*;

    let (airport_type, size) = match code {
        "JFK" | "LAX" | "CDG" | "LHR" | "FRA" | "AMS" | "DXB" => (International, MajorHub),
        "MIA" | "ATL" | "ORD" | "DFW" | "MAD" | "FCO" | "DOH" | "IST" | "GRU" | "GIG" => {
            (International, Large)
        }
        "BSB" => (International, Medium),
        "CGH" => (Domestic, Large),
        "SDU" => (Domestic, Medium),
        _ => return None,
    };
    Some(AirportProfile { airport_type, size })
}

fn buffer_minutes_for(profile: AirportProfile) -> u32 {
    match (profile.airport_type, profile.size) {
        (FlightType::International, AirportSize::Small) => 45,
        (FlightType::International, AirportSize::Medium) => 60,
        (FlightType::International, AirportSize::Large) => 90,
        (FlightType::International, AirportSize::MajorHub) => 120,
        (FlightType::Domestic, AirportSize::Small) => 30,
        (FlightType::Domestic, AirportSize::Medium) => 45,
        (FlightType::Domestic, AirportSize::Large) => 60,
        (FlightType::Domestic, AirportSize::MajorHub) => 75,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FlightArrival {
    pub arrival_date: String,
    pub arrival_time: String,
    pub origin_airport: Option<String>,
    pub destination_airport: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BufferOptions {
    pub flight_type_override: Option<FlightType>,
    pub custom_buffer_minutes: Option<u32>,
    /// IANA zone of the arrival airport; enables `pickup_utc`.
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AirportClassification {
    pub flight_type: FlightType,
    pub airport_type: FlightType,
    pub airport_size: AirportSize,
    pub origin_airport: Option<String>,
    pub destination_airport: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferResult {
    pub scheduled_arrival: NaiveDateTime,
    pub estimated_landing: NaiveDateTime,
    pub recommended_pickup: NaiveDateTime,
    pub buffer_minutes: u32,
    pub pickup_buffer_minutes: u32,
    pub reason: String,
    pub classification: Option<AirportClassification>,
    pub pickup_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BufferCalculator {
    domestic_airports: Vec<String>,
    pickup_buffer_minutes: u32,
}

impl Default for BufferCalculator {
    fn default() -> Self {
        Self::new(
            DEFAULT_DOMESTIC_AIRPORTS.iter().map(|code| code.to_string()).collect(),
            DEFAULT_PICKUP_BUFFER_MINUTES,
        )
    }
}

impl BufferCalculator {
    pub fn new(domestic_airports: Vec<String>, pickup_buffer_minutes: u32) -> Self {
        Self {
            domestic_airports: domestic_airports
                .into_iter()
                .map(|code| code.trim().to_ascii_uppercase())
                .collect(),
            pickup_buffer_minutes,
        }
    }

    pub fn compute(&self, flight: &FlightArrival, options: &BufferOptions) -> Result<BufferResult, EngineError> {
        let date = parse_date(&flight.arrival_date, "arrival_date").map_err(EngineError::InvalidInput)?;
        let time = parse_hhmm(&flight.arrival_time, "arrival_time").map_err(EngineError::InvalidInput)?;
        let time_zone = options
            .time_zone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| EngineError::InvalidInput(format!("unknown time zone: {name}")))
            })
            .transpose()?;

        let origin = normalized_code(flight.origin_airport.as_deref());
        let destination = normalized_code(flight.destination_airport.as_deref());

        let (buffer_minutes, reason, classification) = match options.custom_buffer_minutes {
            Some(custom) if custom > 0 => (
                custom,
                format!("Custom buffer time specified: {custom} minutes"),
                None,
            ),
            _ => {
                let flight_type = options
                    .flight_type_override
                    .unwrap_or_else(|| self.flight_type(origin.as_deref(), destination.as_deref()));
                // Delays happen at the arrival airport, so it is looked up first.
                let profile = destination
                    .as_deref()
                    .and_then(known_airport)
                    .or_else(|| origin.as_deref().and_then(known_airport))
                    .unwrap_or(AirportProfile {
                        airport_type: flight_type,
                        size: AirportSize::Medium,
                    });
                let minutes = buffer_minutes_for(profile);
                let reason = format!(
                    "{flight_type} flight buffer ({} {} airport): {minutes} minutes for customs/immigration/baggage",
                    profile.size, profile.airport_type
                );
                let classification = AirportClassification {
                    flight_type,
                    airport_type: profile.airport_type,
                    airport_size: profile.size,
                    origin_airport: origin.clone(),
                    destination_airport: destination.clone(),
                };
                (minutes, reason, Some(classification))
            }
        };

        let scheduled_arrival = date.and_time(time);
        let estimated_landing = scheduled_arrival + Duration::minutes(i64::from(buffer_minutes));
        let recommended_pickup = estimated_landing + Duration::minutes(i64::from(self.pickup_buffer_minutes));
        let pickup_utc = time_zone.and_then(|zone| {
            zone.from_local_datetime(&recommended_pickup)
                .earliest()
                .map(|local| local.with_timezone(&Utc))
        });

        Ok(BufferResult {
            scheduled_arrival,
            estimated_landing,
            recommended_pickup,
            buffer_minutes,
            pickup_buffer_minutes: self.pickup_buffer_minutes,
            reason,
            classification,
            pickup_utc,
        })
    }

    fn flight_type(&self, origin: Option<&str>, destination: Option<&str>) -> FlightType {
        let (Some(origin), Some(destination)) = (origin, destination) else {
            return FlightType::International;
        };
        let is_domestic = |code: &str| self.domestic_airports.iter().any(|known| known == code);
        if is_domestic(origin) && is_domestic(destination) {
            FlightType::Domestic
        } else {
            FlightType::International
        }
    }
}

fn normalized_code(code: Option<&str>) -> Option<String> {
    code.map(|value| value.trim().to_ascii_uppercase())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{date, time};
    use proptest::prelude::*;

    fn arrival(time: &str, origin: Option<&str>, destination: Option<&str>) -> FlightArrival {
        FlightArrival {
            arrival_date: "2024-09-15".to_string(),
            arrival_time: time.to_string(),
            origin_airport: origin.map(str::to_string),
            destination_airport: destination.map(str::to_string),
        }
    }

    #[test]
    fn jfk_to_gru_uses_large_international_buffer() {
        let result = BufferCalculator::default()
            .compute(&arrival("14:30", Some("JFK"), Some("GRU")), &BufferOptions::default())
            .expect("buffer");

        assert_eq!(result.buffer_minutes, 90);
        assert_eq!(result.estimated_landing, date("2024-09-15").and_time(time("16:00")));
        assert_eq!(result.recommended_pickup, date("2024-09-15").and_time(time("16:15")));
        assert_eq!(
            result.reason,
            "international flight buffer (large international airport): 90 minutes for customs/immigration/baggage"
        );
        let classification = result.classification.expect("classification");
        assert_eq!(classification.airport_size, AirportSize::Large);
    }

    #[test]
    fn domestic_route_uses_destination_classification() {
        let result = BufferCalculator::default()
            .compute(&arrival("08:00", Some("gig"), Some("cgh")), &BufferOptions::default())
            .expect("buffer");
        assert_eq!(result.buffer_minutes, 60);
        let classification = result.classification.expect("classification");
        assert_eq!(classification.flight_type, FlightType::Domestic);
        assert_eq!(classification.airport_type, FlightType::Domestic);
    }

    #[test]
    fn unknown_airports_fall_back_to_medium_of_flight_type() {
        let calculator = BufferCalculator::default();
        let international = calculator
            .compute(&arrival("08:00", Some("XYZ"), Some("ABC")), &BufferOptions::default())
            .expect("buffer");
        assert_eq!(international.buffer_minutes, 60);

        let domestic = calculator
            .compute(
                &arrival("08:00", Some("SSA"), Some("FOR")),
                &BufferOptions::default(),
            )
            .expect("buffer");
        assert_eq!(domestic.buffer_minutes, 45);
    }

    #[test]
    fn missing_airport_means_international() {
        let result = BufferCalculator::default()
            .compute(&arrival("08:00", None, Some("SSA")), &BufferOptions::default())
            .expect("buffer");
        assert_eq!(
            result.classification.expect("classification").flight_type,
            FlightType::International
        );
        assert_eq!(result.buffer_minutes, 60);
    }

    #[test]
    fn late_arrival_rolls_into_next_day() {
        let result = BufferCalculator::default()
            .compute(&arrival("23:30", Some("JFK"), Some("GRU")), &BufferOptions::default())
            .expect("buffer");
        assert_eq!(result.recommended_pickup, date("2024-09-16").and_time(time("01:15")));
    }

    #[test]
    fn pickup_utc_is_derived_from_time_zone() {
        let options = BufferOptions {
            time_zone: Some("America/Sao_Paulo".to_string()),
            ..BufferOptions::default()
        };
        let result = BufferCalculator::default()
            .compute(&arrival("14:30", Some("JFK"), Some("GRU")), &options)
            .expect("buffer");
        let pickup_utc = result.pickup_utc.expect("pickup utc");
        assert_eq!(pickup_utc.format("%H:%M").to_string(), "19:15");
    }

    #[test]
    fn malformed_input_is_rejected_before_computation() {
        let calculator = BufferCalculator::default();
        assert!(matches!(
            calculator.compute(&arrival("25:00", None, None), &BufferOptions::default()),
            Err(EngineError::InvalidInput(_))
        ));
        let mut bad_date = arrival("10:00", None, None);
        bad_date.arrival_date = "15/09/2024".to_string();
        assert!(matches!(
            calculator.compute(&bad_date, &BufferOptions::default()),
            Err(EngineError::InvalidInput(_))
        ));
        let bad_zone = BufferOptions {
            time_zone: Some("Mars/Olympus".to_string()),
            ..BufferOptions::default()
        };
        assert!(calculator.compute(&arrival("10:00", None, None), &bad_zone).is_err());
    }

    proptest! {
        #[test]
        fn custom_buffer_overrides_everything(
            custom in 1u32..600,
            override_domestic in any::<bool>(),
            hour in 0u32..24,
            minute in 0u32..60,
        ) {
            let options = BufferOptions {
                flight_type_override: Some(if override_domestic { FlightType::Domestic } else { FlightType::International }),
                custom_buffer_minutes: Some(custom),
                time_zone: None,
            };
            let result = BufferCalculator::default()
                .compute(&arrival(&format!("{hour:02}:{minute:02}"), Some("JFK"), Some("GRU")), &options)
                .expect("buffer");
            prop_assert_eq!(result.buffer_minutes, custom);
            prop_assert_eq!(result.reason, format!("Custom buffer time specified: {custom} minutes"));
            prop_assert!(result.classification.is_none());
            prop_assert_eq!(
                result.recommended_pickup - result.scheduled_arrival,
                Duration::minutes(i64::from(custom) + 15)
            );
        }
    }
}
