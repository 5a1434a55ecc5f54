//! Custom error types for the camera workers.
//!
//! `CameraError` is the single error type shared by the attribute store, the
//! acquisition engine, the action runner, the run-file readers and the
//! buffered-transition worker. Using the `thiserror` crate, it keeps the
//! failure taxonomy of a shot in one place:
//!
//! - **`AttributeNotFound`**: an attribute name was requested that the store
//!   does not hold.
//! - **`ActionNotFound`**: the file behind an action reference is missing. The
//!   engine recovers from this locally (logs it and keeps acquiring).
//! - **`AcquisitionFailure`**: any vendor SDK error during setup, acquire or
//!   download. Raised inside the acquisition thread and handed back to the
//!   worker through the completion handle.
//! - **`PartialAcquisition`**: the acquisition thread ended with fewer images
//!   than the shot expected.
//!
//! By using `#[from]`, I/O, JSON and configuration errors convert with `?`.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CameraError>;

/// Errors raised by the camera workers.
#[derive(Error, Debug)]
pub enum CameraError {
    /// No value is stored under this attribute name.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// An action file referenced by the run file is missing.
    #[error("Action not found: the file '{}' does not exist", .0.display())]
    ActionNotFound(PathBuf),

    /// An action ran and reported failure.
    #[error("Action '{action}' failed: {reason}")]
    ActionFailed {
        /// Action reference as given in the run file.
        action: String,
        /// What the action reported.
        reason: String,
    },

    /// The SDK failed, or the camera could not be set up.
    #[error("Acquisition failure: {0}")]
    AcquisitionFailure(String),

    /// The shot produced fewer images than expected.
    #[error("Partial acquisition: got {acquired} of {expected} image(s)")]
    PartialAcquisition {
        /// Images the shot should have produced.
        expected: usize,
        /// Images actually acquired.
        acquired: usize,
    },

    /// An abort was requested.
    #[error("Acquisition aborted")]
    Aborted,

    /// The engine is lent to an acquisition or live-view thread.
    #[error("Camera is busy: an acquisition is in progress")]
    AcquisitionInProgress,

    /// The run file is malformed.
    #[error("Run file error: {0}")]
    RunFile(String),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Filesystem or process error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker thread panicked.
    #[error("Acquisition thread panicked")]
    ThreadPanicked,

    /// The named cargo feature is required.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

#[cfg(feature = "storage_hdf5")]
impl From<hdf5::Error> for CameraError {
    fn from(err: hdf5::Error) -> Self {
        CameraError::RunFile(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CameraError::AttributeNotFound("exposure_time".to_string());
        assert_eq!(err.to_string(), "Attribute not found: exposure_time");
    }

    #[test]
    fn test_partial_acquisition_display() {
        let err = CameraError::PartialAcquisition {
            expected: 5,
            acquired: 3,
        };
        assert_eq!(err.to_string(), "Partial acquisition: got 3 of 5 image(s)");
    }

    #[test]
    fn test_action_not_found_mentions_path() {
        let err = CameraError::ActionNotFound(PathBuf::from("scripts/fit.rhai"));
        assert!(err.to_string().contains("scripts/fit.rhai"));
    }
}
