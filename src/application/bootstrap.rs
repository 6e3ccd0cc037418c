use crate::application::coordinator::ItineraryCoordinator;
use crate::application::distance_resolver::{DistanceResolver, RetryPolicy};
use crate::infrastructure::config::{EngineConfig, ensure_default_configs, load_engine_config, read_api_key};
use crate::infrastructure::distance_cache::InMemoryDistanceCache;
use crate::infrastructure::distance_matrix_client::ReqwestDistanceMatrixClient;
use crate::infrastructure::error::EngineError;
use crate::infrastructure::itinerary_repository::SqliteItineraryRepository;
use crate::infrastructure::realtime_channel::RealtimeChannel;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub config: EngineConfig,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, EngineError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let database_path = state_dir.join("itinerary.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_engine_config(&config_dir)?;
    initialize_database(&database_path)?;

    tracing::info!(
        workspace_root = %workspace_root.display(),
        database = %database_path.display(),
        "workspace ready"
    );
    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        database_path,
        config,
    })
}

/// Wires the SQLite store, the cached distance provider and `realtime` into a
/// coordinator configured from the bootstrapped workspace.
pub fn open_coordinator<P>(
    bootstrap: &BootstrapResult,
    realtime: Arc<P>,
) -> ItineraryCoordinator<SqliteItineraryRepository, P>
where
    P: RealtimeChannel + 'static,
{
    let config = &bootstrap.config;
    let api_key = read_api_key(config).unwrap_or_else(|error| {
        tracing::warn!(%error, "distance provider disabled; travel times will be estimated");
        String::new()
    });
    let client = Arc::new(ReqwestDistanceMatrixClient::with_endpoint(
        config.distance_provider.endpoint.clone(),
        api_key,
    ));
    let cache = Arc::new(InMemoryDistanceCache::new(
        config.distance_cache.ttl_seconds,
        config.distance_cache.max_entries,
    ));
    let resolver = DistanceResolver::new(client, cache).with_retry_policy(RetryPolicy {
        max_attempts: config.distance_provider.max_attempts,
        base_delay_ms: config.distance_provider.base_delay_ms,
    });
    let repository = Arc::new(SqliteItineraryRepository::new(&bootstrap.database_path));

    ItineraryCoordinator::from_config(config, repository, realtime, Arc::new(resolver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{activity, date};
    use crate::domain::models::{ItineraryDay, Trip};
    use crate::infrastructure::itinerary_repository::ItineraryRepository;
    use crate::infrastructure::realtime_channel::InProcessRealtimeChannel;
    use crate::test_support::TempWorkspace;

    #[test]
    fn bootstrap_creates_config_and_database() {
        let workspace = TempWorkspace::new();
        let result = bootstrap_workspace(&workspace.path).expect("bootstrap");

        assert!(workspace.path.join("config").join("engine.json").exists());
        assert!(result.database_path.exists());
        assert_eq!(result.config, EngineConfig::default());

        let again = bootstrap_workspace(&workspace.path).expect("bootstrap is idempotent");
        assert_eq!(again.database_path, result.database_path);
    }

    #[test]
    fn bootstrap_rejects_unsupported_schema() {
        let workspace = TempWorkspace::new();
        let config_dir = workspace.path.join("config");
        fs::create_dir_all(&config_dir).expect("config dir");
        fs::write(config_dir.join("engine.json"), "{\"schema\": 2}\n").expect("write config");

        let error = bootstrap_workspace(&workspace.path).expect_err("schema 2");
        assert!(matches!(error, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn opened_coordinator_reads_the_sqlite_store() {
        let workspace = TempWorkspace::new();
        let result = bootstrap_workspace(&workspace.path).expect("bootstrap");
        let mut day = ItineraryDay::new("day-1", "trip-1", date("2024-09-16"), 1);
        day.insert_activity(activity("port", "09:00", 60, "Port Authority, Santos"));
        let trip = Trip {
            id: "trip-1".to_string(),
            title: "Coffee sourcing".to_string(),
            start_date: date("2024-09-16"),
            end_date: date("2024-09-16"),
            time_zone: "America/Sao_Paulo".to_string(),
            days: vec![day],
        };
        SqliteItineraryRepository::new(&result.database_path)
            .save_trip(&trip)
            .expect("seed trip");

        let coordinator = open_coordinator(&result, Arc::new(InProcessRealtimeChannel::default()));
        let loaded = coordinator.load_trip("trip-1").await.expect("load");
        assert_eq!(loaded.days[0].activities().len(), 1);
    }
}
