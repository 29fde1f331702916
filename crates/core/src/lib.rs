pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod snapshot;
pub mod states;

pub use chrono;
pub use uuid;
