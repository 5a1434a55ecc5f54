//! Common test utilities for labcam integration tests
//!
//! This module provides reusable test helpers for:
//! - Writing run files into temporary directories
//! - Building workers around the simulated camera
//! - Polling for background-thread progress

#![allow(dead_code)] // Utilities may not all be used by every test file

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use labcam::engine::AcquisitionEngine;
use labcam::mock::{MockCameraConfig, MockProbe, MockSdk};
use labcam::run_file::{DeviceProperties, ExposureRecord, JsonRunFile};
use labcam::{CameraWorker, WorkerConfig};
use serde_json::Value;
use tempfile::TempDir;

pub const DEVICE: &str = "andor";

/// A run file living in its own temporary directory.
pub struct RunFileFixture {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl RunFileFixture {
    /// Parsed contents, including anything written back by the worker.
    pub fn read(&self) -> Value {
        let text = fs::read_to_string(&self.path).expect("run file readable");
        serde_json::from_str(&text).expect("run file is JSON")
    }

    /// Saved frames of one exposure group.
    pub fn saved_frames(&self, name: &str, frame_type: &str) -> Value {
        self.read()["images"][DEVICE]["frames"][name][frame_type].clone()
    }
}

/// Write a run file with one device group.
pub fn write_run_file(
    exposures: Option<Vec<ExposureRecord>>,
    properties: &DeviceProperties,
) -> RunFileFixture {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("shot.json");
    write_run_file_at(&path, exposures, properties);
    RunFileFixture { dir, path }
}

pub fn write_run_file_at(
    path: &Path,
    exposures: Option<Vec<ExposureRecord>>,
    properties: &DeviceProperties,
) {
    let mut run_file = JsonRunFile::new(path);
    run_file
        .set_device(DEVICE, exposures.as_deref(), properties)
        .expect("device group");
    run_file.save().expect("run file written");
}

/// `n` exposures of `img/atoms`, with `actions` placed at the given rows.
pub fn exposures(n: usize, actions: &[(usize, &str)]) -> Vec<ExposureRecord> {
    (0..n)
        .map(|i| {
            let record = ExposureRecord::new("img", "atoms", 0.1 * (i + 1) as f64);
            match actions.iter().find(|(row, _)| *row == i) {
                Some((_, action)) => record.with_action(*action),
                None => record,
            }
        })
        .collect()
}

pub fn worker_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.worker.device_name = DEVICE.to_string();
    config.worker.mock = true;
    config
}

pub fn small_camera() -> MockCameraConfig {
    MockCameraConfig {
        width: 4,
        height: 3,
        ..Default::default()
    }
}

/// Worker on a simulated camera, with the probe for inspecting SDK calls.
pub fn mock_worker(config: WorkerConfig, camera: MockCameraConfig) -> (CameraWorker, MockProbe) {
    let sdk = MockSdk::new(camera);
    let probe = sdk.probe();
    let engine = AcquisitionEngine::new(Box::new(sdk));
    let worker = CameraWorker::with_engine(config, engine).expect("worker starts");
    (worker, probe)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
