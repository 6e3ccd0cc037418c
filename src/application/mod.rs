pub mod autosave;
pub mod bootstrap;
pub mod coordinator;
pub mod distance_resolver;
pub mod realtime_sync;
pub mod travel_synthesis;
