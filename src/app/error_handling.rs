//! Fatal error reporting for the binary

use tracing::error;

use crate::error::Error;

const GENERAL_ERROR: i32 = 1;
const USAGE_ERROR: i32 = 2;
const NOT_FOUND: i32 = 3;

/// Exit status for an error surfaced at the command line
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<Error>() {
        Some(Error::NotFound { .. }) => NOT_FOUND,
        Some(Error::Specification(_) | Error::Config(_) | Error::InvalidTransition { .. }) => {
            USAGE_ERROR
        }
        _ => GENERAL_ERROR,
    }
}

/// Print the error (with its chain in verbose mode) and exit
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);
    eprintln!("Error: {error}");

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code(&error))
}
