pub mod config;
pub mod error;
pub mod event_bus;
pub mod records;
pub mod types;
pub mod webhook;

pub use config::AppConfig;
pub use error::{JourneyError, JourneyResult};
