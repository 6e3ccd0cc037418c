pub mod config;
pub mod distance_cache;
pub mod distance_matrix_client;
pub mod error;
pub mod event_mapper;
pub mod itinerary_repository;
pub mod realtime_channel;
pub mod storage;
