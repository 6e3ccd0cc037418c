use crate::domain::models::{ResolutionConfidence, TravelMode};
use crate::domain::travel_heuristics;
use crate::infrastructure::distance_cache::{DistanceCacheRepository, RouteEstimate, RouteKey};
use crate::infrastructure::distance_matrix_client::{DistanceMatrixClient, ProviderRoute};
use crate::infrastructure::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{Duration as TokioDuration, sleep};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// Point-to-point duration lookup that never fails; used by travel synthesis.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve_or_estimate(&self, origin: &str, destination: &str, mode: TravelMode) -> RouteEstimate;
}

pub struct DistanceResolver<C, R>
where
    C: DistanceMatrixClient,
    R: DistanceCacheRepository,
{
    client: Arc<C>,
    cache: Arc<R>,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<C, R> DistanceResolver<C, R>
where
    C: DistanceMatrixClient,
    R: DistanceCacheRepository,
{
    pub fn new(client: Arc<C>, cache: Arc<R>) -> Self {
        Self {
            client,
            cache,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn cache(&self) -> &Arc<R> {
        &self.cache
    }

    /// Cached or live estimate; provider failures surface as `Resolution`.
    pub async fn resolve(&self, origin: &str, destination: &str, mode: TravelMode) -> Result<RouteEstimate, EngineError> {
        if origin.trim().is_empty() || destination.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "origin and destination must not be empty".to_string(),
            ));
        }

        let key = RouteKey::new(origin, destination, mode);
        let now = (self.now_provider)();
        if let Some(mut cached) = self.cache.get_fresh(&key, now)? {
            tracing::debug!(origin, destination, mode = mode.as_str(), "distance cache hit");
            cached.confidence = ResolutionConfidence::Cached;
            return Ok(cached);
        }
        tracing::debug!(origin, destination, mode = mode.as_str(), "distance cache miss");

        let route = self.query_with_retry(origin, destination, mode).await?;
        let resolved_at = (self.now_provider)();
        let estimate = RouteEstimate {
            distance_meters: route.distance_meters,
            duration_seconds: route.duration_seconds,
            origin_address: route.origin_address,
            destination_address: route.destination_address,
            resolved_at,
            confidence: ResolutionConfidence::Live,
        };
        self.cache.put(key, estimate.clone(), resolved_at)?;
        Ok(estimate)
    }

    async fn query_with_retry(&self, origin: &str, destination: &str, mode: TravelMode) -> Result<ProviderRoute, EngineError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match self.client.query(origin, destination, mode).await {
                Ok(route) => return Ok(route),
                Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt));
                    tracing::debug!(attempt, delay_ms = delay, %error, "retrying distance provider");
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn should_retry(error: &EngineError) -> bool {
    match error {
        EngineError::Resolution(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("network error")
                || message.contains("timeout")
                || message.contains("timed out")
                || message.contains("temporarily unavailable")
                || message.contains("connection reset")
        }
        _ => false,
    }
}

fn degraded_estimate(origin: &str, destination: &str, resolved_at: DateTime<Utc>) -> RouteEstimate {
    RouteEstimate {
        distance_meters: 0,
        duration_seconds: travel_heuristics::estimate_seconds(origin, destination),
        origin_address: origin.to_string(),
        destination_address: destination.to_string(),
        resolved_at,
        confidence: ResolutionConfidence::Degraded,
    }
}

#[async_trait]
impl<C, R> RouteResolver for DistanceResolver<C, R>
where
    C: DistanceMatrixClient,
    R: DistanceCacheRepository,
{
    async fn resolve_or_estimate(&self, origin: &str, destination: &str, mode: TravelMode) -> RouteEstimate {
        match self.resolve(origin, destination, mode).await {
            Ok(estimate) => estimate,
            Err(error) => {
                let estimate = degraded_estimate(origin, destination, (self.now_provider)());
                tracing::warn!(
                    origin,
                    destination,
                    %error,
                    estimated_seconds = estimate.duration_seconds,
                    "distance provider unavailable; using heuristic estimate"
                );
                estimate
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider fake keyed by `(origin, destination)`; unknown pairs fail.
    #[derive(Debug, Default)]
    pub struct FakeDistanceMatrixClient {
        durations: Mutex<HashMap<(String, String), u64>>,
        scripted_failures: Mutex<VecDeque<String>>,
        pub calls: AtomicUsize,
    }

    impl FakeDistanceMatrixClient {
        pub fn with_route(self, origin: &str, destination: &str, duration_seconds: u64) -> Self {
            self.durations
                .lock()
                .expect("durations lock poisoned")
                .insert((origin.to_string(), destination.to_string()), duration_seconds);
            self
        }

        pub fn with_failures(self, messages: &[&str]) -> Self {
            self.scripted_failures
                .lock()
                .expect("failures lock poisoned")
                .extend(messages.iter().map(|message| message.to_string()));
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DistanceMatrixClient for FakeDistanceMatrixClient {
        async fn query(&self, origin: &str, destination: &str, _mode: TravelMode) -> Result<ProviderRoute, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self
                .scripted_failures
                .lock()
                .expect("failures lock poisoned")
                .pop_front()
            {
                return Err(EngineError::Resolution(message));
            }
            let duration = self
                .durations
                .lock()
                .expect("durations lock poisoned")
                .get(&(origin.to_string(), destination.to_string()))
                .copied();
            match duration {
                Some(duration_seconds) => Ok(ProviderRoute {
                    distance_meters: duration_seconds * 15,
                    duration_seconds,
                    origin_address: origin.to_string(),
                    destination_address: destination.to_string(),
                }),
                None => Err(EngineError::Resolution(format!(
                    "distance matrix element status NOT_FOUND for {origin} -> {destination}"
                ))),
            }
        }
    }
}
