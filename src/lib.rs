pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{BootstrapResult, bootstrap_workspace, open_coordinator};
pub use application::coordinator::{ActivityDraft, ItineraryCoordinator, MutationOutcome};
pub use application::realtime_sync::spawn_realtime_listener;
pub use domain::models::{Activity, Conflict, ExtendDirection, ItineraryDay, TravelSegment, Trip};
pub use infrastructure::error::EngineError;

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default `info`
/// filter; calling this twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
