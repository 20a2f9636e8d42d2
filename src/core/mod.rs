//! Core types, errors, configuration and logging

pub mod types;
pub mod error;
pub mod logging;
pub mod config;
pub mod camera;

pub use types::*;
pub use error::Error;
pub use config::{
    StreamingConfig, UpdateMode,
    DEFAULT_ERROR_THRESHOLD, MIN_ERROR_THRESHOLD, MAX_ERROR_THRESHOLD,
};
pub use camera::ViewCamera;
