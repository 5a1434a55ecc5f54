//! Simulated camera SDK.
//!
//! Provides a [`MockSdk`] that implements [`CameraSdk`] without hardware, used
//! by the `mock` worker option and throughout the tests.
//!
//! # Behaviour
//!
//! - Frames carry a deterministic pattern: `acquisition * 1000 + frame * 100 + row + col`
//! - `setup_acquisition` applies `acquisition`, `exposure_time`, `emccd_gain`,
//!   `number_kinetics`, `number_fast_kinetics`, `width` and `height` and
//!   rejects values of the wrong type, like a real SDK would at apply-time
//! - With `external_trigger`, `acquire` blocks until [`MockProbe::trigger`] or
//!   an abort
//! - Every call is recorded and can be inspected through a [`MockProbe`]

use std::sync::Arc;
use std::time::Duration;

use ndarray::Array3;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::attributes::{AttributeSet, AttributeValue};
use crate::error::{AppResult, CameraError};
use crate::sdk::{Acquisition, AcquisitionMode, CameraSdk, SdkAborter, SdkFactory};

/// Settings of the simulated camera.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MockCameraConfig {
    /// Frame width in pixels.
    #[serde(default = "default_width")]
    pub width: usize,
    /// Frame height in pixels.
    #[serde(default = "default_height")]
    pub height: usize,
    /// Initial acquisition mode.
    #[serde(default = "default_mode")]
    pub acquisition_mode: String,
    /// Sub-frames per fast-kinetics series.
    #[serde(default = "default_fast_kinetics")]
    pub number_fast_kinetics: usize,
    /// Frames per kinetic series.
    #[serde(default = "default_kinetics")]
    pub number_kinetics: usize,
    /// Exposure time in seconds
    #[serde(default = "default_exposure")]
    pub exposure_time: f64,
    /// Initial EMCCD gain.
    #[serde(default)]
    pub emccd_gain: i64,
    /// Simulated readout delay per acquisition
    #[serde(default, with = "humantime_serde")]
    pub frame_delay: Duration,
    /// Block in `acquire` until a trigger is delivered through the probe
    #[serde(default)]
    pub external_trigger: bool,
}

fn default_width() -> usize {
    64
}

fn default_height() -> usize {
    48
}

fn default_mode() -> String {
    "single".to_string()
}

fn default_fast_kinetics() -> usize {
    4
}

fn default_kinetics() -> usize {
    1
}

fn default_exposure() -> f64 {
    0.02
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            acquisition_mode: default_mode(),
            number_fast_kinetics: default_fast_kinetics(),
            number_kinetics: default_kinetics(),
            exposure_time: default_exposure(),
            emccd_gain: 0,
            frame_delay: Duration::ZERO,
            external_trigger: false,
        }
    }
}

/// A call made into the simulated SDK.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkCall {
    /// `setup_acquisition` with the attributes it received.
    Setup(AttributeSet),
    /// `acquire`.
    Acquire,
    /// `download_acquisition`.
    Download,
    /// `abort_acquisition`.
    Abort,
    /// `shutdown`.
    Shutdown,
    /// `set_armed`.
    Arm(bool),
}

#[derive(Default)]
struct MockState {
    calls: Vec<SdkCall>,
    pending_triggers: usize,
    aborted: bool,
    acquired: bool,
    acquisitions: usize,
    armed: bool,
    fail_on_acquire: Option<usize>,
}

struct Shared {
    state: Mutex<MockState>,
    trigger: Condvar,
}

/// Simulated camera.
pub struct MockSdk {
    config: MockCameraConfig,
    shared: Arc<Shared>,
}

impl MockSdk {
    /// Simulated camera with `config`.
    pub fn new(config: MockCameraConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(MockState::default()),
                trigger: Condvar::new(),
            }),
        }
    }

    /// Handle for inspecting and driving the camera after it has been moved
    /// into an engine.
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            shared: self.shared.clone(),
        }
    }

    /// Factory producing a fresh simulated camera per call.
    pub fn factory(config: MockCameraConfig) -> SdkFactory {
        Arc::new(move || Ok(Box::new(MockSdk::new(config.clone())) as Box<dyn CameraSdk>))
    }

    fn record(&self, call: SdkCall) {
        debug!("MockSdk: {:?}", call);
        self.shared.state.lock().calls.push(call);
    }

    fn frames_per_download(&self) -> usize {
        match AcquisitionMode::parse(&self.config.acquisition_mode) {
            AcquisitionMode::Single => 1,
            AcquisitionMode::FastKinetics => self.config.number_fast_kinetics,
            AcquisitionMode::KineticSeries | AcquisitionMode::Other(_) => {
                self.config.number_kinetics
            }
        }
    }
}

fn as_usize(name: &str, value: &AttributeValue) -> AppResult<usize> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| CameraError::AcquisitionFailure(format!("'{}' must be a non-negative integer, got {}", name, value)))
}

fn as_f64(name: &str, value: &AttributeValue) -> AppResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| CameraError::AcquisitionFailure(format!("'{}' must be a number, got {}", name, value)))
}

impl CameraSdk for MockSdk {
    fn setup_acquisition(&mut self, attributes: &AttributeSet) -> AppResult<()> {
        self.record(SdkCall::Setup(attributes.clone()));
        self.shared.state.lock().aborted = false;

        for (name, value) in attributes {
            match name.as_str() {
                "acquisition" => {
                    self.config.acquisition_mode = value
                        .as_str()
                        .ok_or_else(|| {
                            CameraError::AcquisitionFailure(format!(
                                "'acquisition' must be a string, got {}",
                                value
                            ))
                        })?
                        .to_string();
                }
                "exposure_time" => self.config.exposure_time = as_f64(name, value)?,
                "emccd_gain" => {
                    self.config.emccd_gain = value.as_i64().ok_or_else(|| {
                        CameraError::AcquisitionFailure(format!(
                            "'emccd_gain' must be an integer, got {}",
                            value
                        ))
                    })?
                }
                "number_kinetics" => self.config.number_kinetics = as_usize(name, value)?,
                "number_fast_kinetics" => {
                    self.config.number_fast_kinetics = as_usize(name, value)?
                }
                "width" => self.config.width = as_usize(name, value)?,
                "height" => self.config.height = as_usize(name, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn acquire(&mut self) -> AppResult<()> {
        self.record(SdkCall::Acquire);

        let mut state = self.shared.state.lock();
        let index = state.acquisitions;
        if state.fail_on_acquire == Some(index) {
            return Err(CameraError::AcquisitionFailure(format!(
                "simulated failure on acquisition {}",
                index
            )));
        }

        if self.config.external_trigger {
            while state.pending_triggers == 0 && !state.aborted {
                self.shared.trigger.wait(&mut state);
            }
            if state.aborted {
                state.aborted = false;
                return Err(CameraError::AcquisitionFailure(
                    "acquisition aborted while waiting for trigger".to_string(),
                ));
            }
            state.pending_triggers -= 1;
        }

        state.acquired = true;
        state.acquisitions += 1;
        drop(state);

        if !self.config.frame_delay.is_zero() {
            std::thread::sleep(self.config.frame_delay);
        }
        Ok(())
    }

    fn download_acquisition(&mut self) -> AppResult<Acquisition> {
        self.record(SdkCall::Download);

        let mut state = self.shared.state.lock();
        if !state.acquired {
            return Err(CameraError::AcquisitionFailure(
                "no acquisition to download".to_string(),
            ));
        }
        state.acquired = false;
        let acquisition = state.acquisitions - 1;
        drop(state);

        let shape = (
            self.frames_per_download(),
            self.config.height,
            self.config.width,
        );
        Ok(Array3::from_shape_fn(shape, |(frame, row, col)| {
            (acquisition * 1000 + frame * 100 + row + col) as u16
        }))
    }

    fn aborter(&self) -> Arc<dyn SdkAborter> {
        Arc::new(self.probe())
    }

    fn shutdown(&mut self) -> AppResult<()> {
        self.record(SdkCall::Shutdown);
        Ok(())
    }

    fn set_armed(&mut self, armed: bool) {
        self.record(SdkCall::Arm(armed));
        self.shared.state.lock().armed = armed;
    }

    fn acquisition_mode(&self) -> AcquisitionMode {
        AcquisitionMode::parse(&self.config.acquisition_mode)
    }

    fn exposure_time(&self) -> f64 {
        self.config.exposure_time
    }

    fn readout_time(&self) -> f64 {
        self.config.frame_delay.as_secs_f64()
    }

    fn keep_clean_time(&self) -> f64 {
        0.0
    }

    fn horizontal_shift_speed(&self) -> f64 {
        1.0
    }

    fn vs_speed(&self) -> f64 {
        3.3
    }

    fn emccd_gain(&self) -> i64 {
        self.config.emccd_gain
    }

    fn number_fast_kinetics(&self) -> usize {
        self.config.number_fast_kinetics
    }

    fn number_kinetics(&self) -> usize {
        self.config.number_kinetics
    }

    fn kinetics_timing(&self) -> f64 {
        self.config.exposure_time + self.readout_time()
    }

    fn default_acquisition_attrs(&self) -> AttributeSet {
        [
            ("acquisition", json!(self.config.acquisition_mode)),
            ("exposure_time", json!(self.config.exposure_time)),
            ("emccd_gain", json!(self.config.emccd_gain)),
            ("number_kinetics", json!(self.config.number_kinetics)),
            ("number_fast_kinetics", json!(self.config.number_fast_kinetics)),
            ("width", json!(self.config.width)),
            ("height", json!(self.config.height)),
            ("trigger", json!("external")),
            ("readout", json!("full_image")),
        ]
        .into_iter()
        .collect()
    }
}

/// Inspection and control handle for a [`MockSdk`].
#[derive(Clone)]
pub struct MockProbe {
    shared: Arc<Shared>,
}

impl MockProbe {
    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<SdkCall> {
        self.shared.state.lock().calls.clone()
    }

    /// Number of calls recorded.
    pub fn call_count(&self) -> usize {
        self.shared.state.lock().calls.len()
    }

    /// Number of completed `acquire` calls.
    pub fn acquisitions(&self) -> usize {
        self.shared.state.lock().acquisitions
    }

    /// Whether the camera is armed.
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().armed
    }

    /// Deliver one external trigger.
    pub fn trigger(&self) {
        let mut state = self.shared.state.lock();
        state.pending_triggers += 1;
        self.shared.trigger.notify_all();
    }

    /// Make the `index`-th acquisition (0-based) fail.
    pub fn fail_on_acquire(&self, index: usize) {
        self.shared.state.lock().fail_on_acquire = Some(index);
    }
}

impl SdkAborter for MockProbe {
    fn abort_acquisition(&self) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        state.calls.push(SdkCall::Abort);
        state.aborted = true;
        self.shared.trigger.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_download_requires_acquire() {
        let mut sdk = MockSdk::new(MockCameraConfig::default());
        assert!(sdk.download_acquisition().is_err());

        sdk.acquire().unwrap();
        let frames = sdk.download_acquisition().unwrap();
        assert_eq!(frames.shape(), &[1, 48, 64]);
    }

    #[test]
    fn test_fast_kinetics_download_is_a_series() {
        let config = MockCameraConfig {
            acquisition_mode: "fast_kinetics".to_string(),
            number_fast_kinetics: 3,
            ..Default::default()
        };
        let mut sdk = MockSdk::new(config);
        sdk.acquire().unwrap();
        let frames = sdk.download_acquisition().unwrap();
        assert_eq!(frames.shape()[0], 3);
        assert_eq!(frames[[2, 0, 0]], 200);
    }

    #[test]
    fn test_setup_applies_and_validates_attributes() {
        let mut sdk = MockSdk::new(MockCameraConfig::default());
        let mut attrs = AttributeSet::new();
        attrs.set("acquisition", "kinetic_series");
        attrs.set("number_kinetics", 5);
        sdk.setup_acquisition(&attrs).unwrap();

        assert_eq!(sdk.acquisition_mode(), AcquisitionMode::KineticSeries);
        assert_eq!(sdk.number_kinetics(), 5);

        attrs.set("exposure_time", "long");
        assert!(matches!(
            sdk.setup_acquisition(&attrs),
            Err(CameraError::AcquisitionFailure(_))
        ));
    }

    #[test]
    fn test_external_trigger_blocks_until_triggered() {
        let config = MockCameraConfig {
            external_trigger: true,
            ..Default::default()
        };
        let mut sdk = MockSdk::new(config);
        let probe = sdk.probe();

        let handle = thread::spawn(move || sdk.acquire());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.acquisitions(), 0);

        probe.trigger();
        handle.join().unwrap().unwrap();
        assert_eq!(probe.acquisitions(), 1);
    }

    #[test]
    fn test_abort_unblocks_pending_acquire() {
        let config = MockCameraConfig {
            external_trigger: true,
            ..Default::default()
        };
        let mut sdk = MockSdk::new(config);
        let aborter = sdk.aborter();
        let probe = sdk.probe();

        let handle = thread::spawn(move || sdk.acquire());
        thread::sleep(Duration::from_millis(20));
        aborter.abort_acquisition().unwrap();

        assert!(handle.join().unwrap().is_err());
        assert!(probe.calls().contains(&SdkCall::Abort));
    }
}
