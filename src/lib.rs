//! Core library for the labcam camera workers.
//!
//! This library contains the attribute store, the vendor SDK boundary, the
//! acquisition engine and the buffered-transition worker that lets an
//! experiment-control host drive Andor Solis and IMAQdx ("in-situ analysis")
//! cameras during automated shots. It is used by the `labcam` binary and by
//! host integrations.

pub mod acquisition;
pub mod action;
pub mod attributes;
pub mod buffer;
pub mod config;
pub mod continuous;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mock;
pub mod run_file;
pub mod sdk;
pub mod worker;

pub use attributes::{AttributeSet, AttributeValue, VisibilityLevel};
pub use config::{DeviceKind, WorkerConfig};
pub use engine::AcquisitionEngine;
pub use error::{AppResult, CameraError};
pub use sdk::{CameraSdk, SdkFactory};
pub use worker::CameraWorker;
