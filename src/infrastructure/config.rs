use crate::domain::flight_buffer::DEFAULT_DOMESTIC_AIRPORTS;
use crate::infrastructure::error::EngineError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const ENGINE_JSON: &str = "engine.json";
pub const DEFAULT_DISTANCE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/distancematrix/json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub schema: u8,
    pub timezone: String,
    pub travel: TravelConfig,
    pub distance_cache: DistanceCacheConfig,
    pub distance_provider: DistanceProviderConfig,
    pub flights: FlightsConfig,
    pub autosave: AutosaveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TravelConfig {
    pub negligible_minutes: u32,
    pub walk_max_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DistanceCacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DistanceProviderConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlightsConfig {
    pub pickup_buffer_minutes: u32,
    pub domestic_airports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveConfig {
    pub delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            timezone: "UTC".to_string(),
            travel: TravelConfig {
                negligible_minutes: 9,
                walk_max_minutes: 12,
            },
            distance_cache: DistanceCacheConfig {
                ttl_seconds: 600,
                max_entries: 1000,
            },
            distance_provider: DistanceProviderConfig {
                endpoint: DEFAULT_DISTANCE_ENDPOINT.to_string(),
                api_key_env: "GOOGLE_MAPS_API_KEY".to_string(),
                max_attempts: 3,
                base_delay_ms: 200,
            },
            flights: FlightsConfig {
                pickup_buffer_minutes: 15,
                domestic_airports: DEFAULT_DOMESTIC_AIRPORTS.iter().map(|code| code.to_string()).collect(),
            },
            autosave: AutosaveConfig { delay_ms: 2000 },
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.schema != 1 {
            return Err(EngineError::InvalidConfig(format!("unsupported schema {}", self.schema)));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| EngineError::InvalidConfig(format!("unknown timezone {}", self.timezone)))?;
        if self.travel.walk_max_minutes < self.travel.negligible_minutes {
            return Err(EngineError::InvalidConfig(
                "travel.walkMaxMinutes must be >= travel.negligibleMinutes".to_string(),
            ));
        }
        if self.distance_cache.ttl_seconds == 0 || self.distance_cache.max_entries == 0 {
            return Err(EngineError::InvalidConfig(
                "distanceCache.ttlSeconds and distanceCache.maxEntries must be > 0".to_string(),
            ));
        }
        if self.distance_provider.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "distanceProvider.maxAttempts must be > 0".to_string(),
            ));
        }
        url::Url::parse(&self.distance_provider.endpoint).map_err(|error| {
            EngineError::InvalidConfig(format!("distanceProvider.endpoint is not a URL: {error}"))
        })?;
        if self.distance_provider.api_key_env.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "distanceProvider.apiKeyEnv must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), EngineError> {
    let path = config_dir.join(ENGINE_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&EngineConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, EngineError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| EngineError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(EngineError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_engine_config(config_dir: &Path) -> Result<EngineConfig, EngineError> {
    let path = config_dir.join(ENGINE_JSON);
    let raw = read_config(&path)?;
    let config: EngineConfig = serde_json::from_value(raw)
        .map_err(|error| EngineError::InvalidConfig(format!("{}: {error}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Reads the provider API key from the environment variable named in config.
pub fn read_api_key(config: &EngineConfig) -> Result<String, EngineError> {
    read_api_key_from_lookup(config, |name| std::env::var(name).ok())
}

pub(crate) fn read_api_key_from_lookup<F>(config: &EngineConfig, lookup: F) -> Result<String, EngineError>
where
    F: Fn(&str) -> Option<String>,
{
    let name = config.distance_provider.api_key_env.trim();
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EngineError::InvalidConfig(format!("distance provider api key is not set ({name})")))
}
