pub mod clock;
pub mod config;
pub mod effects;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod occupancy;
pub mod scheduler;
pub mod wal;
