//! Shared infrastructure for the effector workspace.

pub mod logging;

pub use logging::{init_logging, init_test_logging, LoggingConfig};
