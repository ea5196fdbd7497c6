pub mod config;
pub mod error;
pub mod models;
pub mod patients;
pub mod service;
pub mod telemetry;

pub use config::{ConfigError, ServiceConfig};
pub use error::ApiError;
pub use patients::{PatientRecord, PatientRegistry};
pub use service::{AppState, build_router, create_app, create_app_state};
