//! Application module
//!
//! Command-line level concerns of the `mapstage` binary:
//! - Verbosity and config file selection
//! - Logging setup
//! - Engine startup
//! - Fatal error reporting

pub mod config;
pub mod error_handling;
pub mod logging;
pub mod runtime;

pub use config::AppConfig;
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
pub use runtime::initialize_engine;
