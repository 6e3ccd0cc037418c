pub mod conflicts;
pub mod flight_buffer;
pub mod location;
pub mod models;
pub mod travel_heuristics;
