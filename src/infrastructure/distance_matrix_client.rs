use crate::domain::models::TravelMode;
use crate::infrastructure::config::DEFAULT_DISTANCE_ENDPOINT;
use crate::infrastructure::error::EngineError;
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

/// Single origin/destination element as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRoute {
    pub distance_meters: u64,
    pub duration_seconds: u64,
    pub origin_address: String,
    pub destination_address: String,
}

#[async_trait]
pub trait DistanceMatrixClient: Send + Sync {
    async fn query(&self, origin: &str, destination: &str, mode: TravelMode) -> Result<ProviderRoute, EngineError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestDistanceMatrixClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl ReqwestDistanceMatrixClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(DEFAULT_DISTANCE_ENDPOINT, api_key)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), EngineError> {
        if value.trim().is_empty() {
            return Err(EngineError::InvalidInput(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn provider_http_error(status: reqwest::StatusCode, body: &str) -> EngineError {
        let message = if body.trim().is_empty() {
            format!("distance matrix api error: http {}", status.as_u16())
        } else {
            format!("distance matrix api error: http {}; body={body}", status.as_u16())
        };
        EngineError::Resolution(message)
    }

    fn request_url(&self, origin: &str, destination: &str, mode: TravelMode) -> Result<Url, EngineError> {
        let provider_mode = match mode {
            TravelMode::Walk => "walking",
            TravelMode::Drive => "driving",
        };
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("origins", origin.trim()),
                ("destinations", destination.trim()),
                ("mode", provider_mode),
                ("units", "metric"),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|error| EngineError::InvalidConfig(format!("invalid distance matrix endpoint: {error}")))
    }
}

#[derive(Debug, serde::Deserialize)]
struct MatrixResponse {
    status: String,
    error_message: Option<String>,
    #[serde(default)]
    origin_addresses: Vec<String>,
    #[serde(default)]
    destination_addresses: Vec<String>,
    #[serde(default)]
    rows: Vec<MatrixRow>,
}

#[derive(Debug, serde::Deserialize)]
struct MatrixRow {
    #[serde(default)]
    elements: Vec<MatrixElement>,
}

#[derive(Debug, serde::Deserialize)]
struct MatrixElement {
    status: String,
    distance: Option<MatrixValue>,
    duration: Option<MatrixValue>,
}

#[derive(Debug, serde::Deserialize)]
struct MatrixValue {
    value: u64,
}

fn parse_matrix_body(body: &str, origin: &str, destination: &str) -> Result<ProviderRoute, EngineError> {
    let parsed: MatrixResponse = serde_json::from_str(body)
        .map_err(|error| EngineError::Resolution(format!("invalid distance matrix payload: {error}; body={body}")))?;

    if parsed.status != "OK" {
        let detail = parsed.error_message.unwrap_or_default();
        return Err(EngineError::Resolution(format!(
            "distance matrix status {} {detail}",
            parsed.status
        )));
    }

    let element = parsed
        .rows
        .first()
        .and_then(|row| row.elements.first())
        .ok_or_else(|| EngineError::Resolution("distance matrix response had no elements".to_string()))?;
    if element.status != "OK" {
        return Err(EngineError::Resolution(format!(
            "distance matrix element status {} for {origin} -> {destination}",
            element.status
        )));
    }
    let (Some(distance), Some(duration)) = (&element.distance, &element.duration) else {
        return Err(EngineError::Resolution("distance matrix element missing distance or duration".to_string()));
    };

    Ok(ProviderRoute {
        distance_meters: distance.value,
        duration_seconds: duration.value,
        origin_address: parsed
            .origin_addresses
            .first()
            .cloned()
            .unwrap_or_else(|| origin.to_string()),
        destination_address: parsed
            .destination_addresses
            .first()
            .cloned()
            .unwrap_or_else(|| destination.to_string()),
    })
}

#[async_trait]
impl DistanceMatrixClient for ReqwestDistanceMatrixClient {
    async fn query(&self, origin: &str, destination: &str, mode: TravelMode) -> Result<ProviderRoute, EngineError> {
        Self::ensure_non_empty(origin, "origin")?;
        Self::ensure_non_empty(destination, "destination")?;

        let url = self.request_url(origin, destination, mode)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| {
                let kind = if error.is_timeout() { "timeout" } else { "network error" };
                EngineError::Resolution(format!("{kind} while querying distance matrix: {error}"))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| EngineError::Resolution(format!("failed reading distance matrix response: {error}")))?;

        if !status.is_success() {
            return Err(Self::provider_http_error(status, &body));
        }

        parse_matrix_body(&body, origin, destination)
    }
}
