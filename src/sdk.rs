//! Vendor SDK boundary.
//!
//! The acquisition engine never talks to a camera library directly. It drives
//! a [`CameraSdk`] obtained from an injected [`SdkFactory`], which keeps the
//! vendor binding (Andor Solis, IMAQdx) swappable and lets tests substitute
//! the simulated camera in [`crate::mock`].
//!
//! All calls are blocking. `acquire` in particular returns only once the
//! camera has been triggered and the exposure is complete, so it is only
//! ever called from a dedicated acquisition thread during a buffered shot.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array3, ArrayD, Axis};

use crate::attributes::AttributeSet;
use crate::error::AppResult;

/// One downloaded acquisition: a stack of sub-frames indexed `(frame, row, col)`.
pub type Acquisition = Array3<u16>;

/// A single stored image. Single-image mode stores whole downloads (3-D),
/// series modes store individual sub-frames (2-D).
pub type Image = ArrayD<u16>;

/// Split a download into its individual 2-D sub-frames.
pub fn split_frames(acquisition: &Acquisition) -> Vec<Image> {
    acquisition
        .axis_iter(Axis(0))
        .map(|frame| frame.to_owned().into_dyn())
        .collect()
}

/// Acquisition mode reported by the SDK.
///
/// Parsed from the SDK's mode string by substring, so vendor spellings such
/// as `"single_scan"` or `"fast_kinetics_fvb"` map onto the same protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// One frame per trigger.
    Single,
    /// A fixed-size series of sub-frames per trigger.
    FastKinetics,
    /// Kinetic series of full frames.
    KineticSeries,
    /// Anything else (run-till-abort, accumulate, ...).
    Other(String),
}

impl AcquisitionMode {
    /// Classify a mode string by substring.
    pub fn parse(mode: &str) -> Self {
        if mode.contains("single") {
            AcquisitionMode::Single
        } else if mode.contains("fast_kinetics") {
            AcquisitionMode::FastKinetics
        } else if mode.contains("kinetic_series") {
            AcquisitionMode::KineticSeries
        } else {
            AcquisitionMode::Other(mode.to_string())
        }
    }

    /// Mode string as programmed on the camera.
    pub fn as_str(&self) -> &str {
        match self {
            AcquisitionMode::Single => "single",
            AcquisitionMode::FastKinetics => "fast_kinetics",
            AcquisitionMode::KineticSeries => "kinetic_series",
            AcquisitionMode::Other(mode) => mode,
        }
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancels an in-flight acquisition from another thread.
///
/// Kept separate from [`CameraSdk`] because the SDK handle itself is owned by
/// the acquisition thread (and blocked inside `acquire`) while an abort is
/// requested.
pub trait SdkAborter: Send + Sync {
    /// Abort the acquisition in progress.
    fn abort_acquisition(&self) -> AppResult<()>;
}

/// Operations and timing properties consumed from a vendor camera SDK.
pub trait CameraSdk: Send {
    /// Program the camera with a full attribute set.
    fn setup_acquisition(&mut self, attributes: &AttributeSet) -> AppResult<()>;

    /// Arm, wait for the trigger and expose. Blocks.
    fn acquire(&mut self) -> AppResult<()>;

    /// Read out the last acquisition.
    fn download_acquisition(&mut self) -> AppResult<Acquisition>;

    /// Handle that can abort an acquisition while `acquire` is blocked.
    fn aborter(&self) -> Arc<dyn SdkAborter>;

    /// Release the camera.
    fn shutdown(&mut self) -> AppResult<()>;

    /// Arm or disarm the camera.
    fn set_armed(&mut self, armed: bool);

    /// Acquisition mode currently programmed.
    fn acquisition_mode(&self) -> AcquisitionMode;

    /// Exposure time actually used, in seconds.
    fn exposure_time(&self) -> f64;

    /// Readout time, in seconds.
    fn readout_time(&self) -> f64;

    /// Keep-clean cycle time, in seconds.
    fn keep_clean_time(&self) -> f64;

    /// Horizontal shift (digitization) speed, in MHz.
    fn horizontal_shift_speed(&self) -> f64;

    /// Vertical shift speed, in microseconds.
    fn vs_speed(&self) -> f64;

    /// EMCCD gain in effect.
    fn emccd_gain(&self) -> i64;

    /// Sub-frames per fast-kinetics series.
    fn number_fast_kinetics(&self) -> usize;

    /// Frames per kinetic series.
    fn number_kinetics(&self) -> usize;

    /// Kinetic cycle period, in seconds.
    fn kinetics_timing(&self) -> f64;

    /// Attribute set the camera starts out with.
    fn default_acquisition_attrs(&self) -> AttributeSet;
}

/// Builds a vendor SDK handle. Injected into the engine at construction.
pub type SdkFactory = Arc<dyn Fn() -> AppResult<Box<dyn CameraSdk>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing_by_substring() {
        assert_eq!(AcquisitionMode::parse("single_scan"), AcquisitionMode::Single);
        assert_eq!(
            AcquisitionMode::parse("fast_kinetics"),
            AcquisitionMode::FastKinetics
        );
        assert_eq!(
            AcquisitionMode::parse("kinetic_series"),
            AcquisitionMode::KineticSeries
        );
        assert_eq!(
            AcquisitionMode::parse("run_till_abort"),
            AcquisitionMode::Other("run_till_abort".to_string())
        );
    }

    #[test]
    fn test_split_frames() {
        let stack = Array3::<u16>::from_shape_fn((3, 2, 4), |(f, r, c)| (f * 100 + r * 10 + c) as u16);
        let frames = split_frames(&stack);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].shape(), &[2, 4]);
        assert_eq!(frames[2][[1, 3]], 213);
    }
}
