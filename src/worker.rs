//! Buffered-transition worker.
//!
//! [`CameraWorker`] is the face the experiment-control host sees. A shot runs
//! through three calls:
//!
//! 1. [`transition_to_buffered`](CameraWorker::transition_to_buffered) reads the
//!    run file, reprograms changed attributes, configures the camera and starts
//!    the acquisition thread, then returns without waiting for frames.
//! 2. The camera is triggered externally while the thread fills the buffer.
//! 3. [`transition_to_manual`](CameraWorker::transition_to_manual) waits for the
//!    thread, surfaces failures and writes the images to the run file.
//!
//! The engine is owned by exactly one party at a time: the worker, the
//! acquisition thread during a shot, or the live loop while it runs. Calls that
//! need the engine while it is lent out fail with `AcquisitionInProgress`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionHandle, SpawnError};
use crate::action::{ActionContext, ActionRunner};
use crate::attributes::{AttributeSet, VisibilityLevel};
use crate::config::{DeviceKind, WorkerConfig};
use crate::continuous::ContinuousLoop;
use crate::engine::AcquisitionEngine;
use crate::error::{AppResult, CameraError};
use crate::mock::MockSdk;
use crate::run_file::{self, ExposureTable, ShotImages};
use crate::sdk::{Acquisition, SdkFactory};

/// Values returned to the host from a transition (always empty: a camera has
/// no final output values).
pub type TransitionValues = BTreeMap<String, Value>;

/// State of one buffered shot, from `transition_to_buffered` to
/// `transition_to_manual`.
struct BufferedCycle {
    device_name: String,
    run_file_path: PathBuf,
    exposures: ExposureTable,
    stop_timeout: Duration,
    exception_on_failed_shot: bool,
    attributes_to_save: Option<AttributeSet>,
    acquisition: AcquisitionHandle,
}

/// Camera worker driven by the experiment-control host.
pub struct CameraWorker {
    config: WorkerConfig,
    engine: Option<AcquisitionEngine>,
    /// Last value programmed per attribute
    smart_cache: AttributeSet,
    /// Attributes reprogrammed by the last buffered transition
    last_programmed: AttributeSet,
    cycle: Option<BufferedCycle>,
    continuous: Option<ContinuousLoop>,
    /// Interval of a live loop paused for a shot
    paused_continuous: Option<Duration>,
}

impl CameraWorker {
    /// Create a worker. Without a factory the worker needs `worker.mock`.
    pub fn new(config: WorkerConfig, factory: Option<SdkFactory>) -> AppResult<Self> {
        let factory = match factory {
            Some(factory) => factory,
            None if config.worker.mock => MockSdk::factory(config.mock.clone()),
            None => {
                return Err(CameraError::AcquisitionFailure(format!(
                    "no camera SDK available for {}; provide a factory or set worker.mock",
                    config.worker.kind
                )))
            }
        };

        let actions = ActionRunner::new(config.worker.device_name.clone(), config.actions.clone());
        let engine = AcquisitionEngine::from_factory(&factory)?.with_actions(actions);
        Self::with_engine(config, engine)
    }

    /// Create a worker around an existing engine and apply the configured
    /// start-up and manual-mode attributes.
    pub fn with_engine(config: WorkerConfig, engine: AcquisitionEngine) -> AppResult<Self> {
        info!(
            "Starting {} worker '{}'{}",
            config.worker.kind,
            config.worker.device_name,
            if config.worker.mock { " (mock camera)" } else { "" }
        );

        let mut worker = Self {
            config,
            engine: Some(engine),
            smart_cache: AttributeSet::new(),
            last_programmed: AttributeSet::new(),
            cycle: None,
            continuous: None,
            paused_continuous: None,
        };
        let startup = worker.config.worker.camera_attributes.clone();
        worker.set_attributes_smart(&startup)?;
        let manual = worker.config.worker.manual_mode_camera_attributes.clone();
        worker.set_attributes_smart(&manual)?;
        Ok(worker)
    }

    /// Device name from the configuration.
    pub fn device_name(&self) -> &str {
        &self.config.worker.device_name
    }

    /// Camera family.
    pub fn kind(&self) -> DeviceKind {
        self.config.worker.kind
    }

    /// Configuration the worker was built with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Attributes programmed so far, as tracked by the smart cache.
    pub fn smart_cache(&self) -> &AttributeSet {
        &self.smart_cache
    }

    /// Attributes reprogrammed by the last buffered transition.
    pub fn last_programmed(&self) -> &AttributeSet {
        &self.last_programmed
    }

    /// A buffered shot is in progress.
    pub fn is_acquiring(&self) -> bool {
        self.cycle.is_some()
    }

    /// Images stored so far in the current shot.
    pub fn images_acquired(&self) -> usize {
        self.cycle
            .as_ref()
            .map_or(0, |cycle| cycle.acquisition.images_acquired())
    }

    fn engine(&self) -> AppResult<&AcquisitionEngine> {
        self.engine.as_ref().ok_or(CameraError::AcquisitionInProgress)
    }

    fn engine_mut(&mut self) -> AppResult<&mut AcquisitionEngine> {
        self.engine.as_mut().ok_or(CameraError::AcquisitionInProgress)
    }

    /// Register an in-process action callback.
    pub fn register_action<F>(&mut self, name: impl Into<String>, callback: F) -> AppResult<()>
    where
        F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.engine_mut()?.actions_mut().register(name, callback);
        Ok(())
    }

    /// Program only the attributes whose value differs from the last one
    /// programmed. Returns how many were programmed.
    pub fn set_attributes_smart(&mut self, attributes: &AttributeSet) -> AppResult<usize> {
        Ok(self.program_changed(attributes)?.len())
    }

    fn program_changed(&mut self, attributes: &AttributeSet) -> AppResult<AttributeSet> {
        let changed: AttributeSet = attributes
            .iter()
            .filter(|(name, value)| self.smart_cache.as_map().get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        self.engine_mut()?.set_attributes(&changed);
        debug!("Programmed {} of {} attribute(s)", changed.len(), attributes.len());
        self.smart_cache
            .set_many(changed.iter().map(|(name, value)| (name.clone(), value.clone())));
        Ok(changed)
    }

    /// Attributes of the camera. The visibility level is accepted for
    /// interface compatibility; every attribute is returned.
    pub fn get_attributes_as_dict(&self, _visibility: VisibilityLevel) -> AppResult<AttributeSet> {
        Ok(self.engine()?.attributes().clone())
    }

    /// Attributes as `name: value` lines.
    pub fn get_attributes_as_text(&self, visibility: VisibilityLevel) -> AppResult<String> {
        Ok(self.get_attributes_as_dict(visibility)?.to_text())
    }

    /// Prepare the camera for a shot and start acquiring in the background.
    ///
    /// Returns immediately with an empty map. When the run file defines no
    /// exposures for `device_name` nothing is programmed and no thread starts.
    pub fn transition_to_buffered(
        &mut self,
        device_name: &str,
        run_file_path: &Path,
        _initial_values: &TransitionValues,
        fresh: bool,
    ) -> AppResult<TransitionValues> {
        if self.cycle.is_some() {
            return Err(CameraError::AcquisitionInProgress);
        }
        let path = self.config.worker.path_to_local(run_file_path);
        if self.continuous.is_some() {
            self.stop_continuous(true)?;
        }

        let started = self.begin_shot(device_name, path, fresh);
        if started.is_err() {
            if let Err(err) = self.resume_continuous() {
                warn!("Could not resume continuous acquisition: {}", err);
            }
        }
        started
    }

    fn begin_shot(
        &mut self,
        device_name: &str,
        path: PathBuf,
        fresh: bool,
    ) -> AppResult<TransitionValues> {
        let group = run_file::open(&path)?.device_group(device_name)?;
        let Some(exposures) = group.exposures else {
            info!("No exposures for '{}' in this shot", device_name);
            return Ok(TransitionValues::new());
        };
        let properties = group.properties;
        let n_images = exposures.len();
        let actions = exposures.actions();

        if fresh {
            self.smart_cache = AttributeSet::new();
        }
        self.last_programmed = self.program_changed(&properties.camera_attributes)?;
        let attributes_to_save = properties
            .saved_attribute_visibility_level
            .map(|level| self.get_attributes_as_dict(level))
            .transpose()?;

        let mut engine = self.engine.take().ok_or(CameraError::AcquisitionInProgress)?;
        engine.set_exception_on_failed_shot(properties.exception_on_failed_shot);
        info!("Configuring camera for {} images.", n_images);
        if let Err(err) = engine.configure_acquisition(Some(n_images)) {
            self.engine = Some(engine);
            return Err(err);
        }

        let acquisition = match AcquisitionHandle::spawn(engine, n_images, actions) {
            Ok(acquisition) => acquisition,
            Err(SpawnError { error, engine }) => {
                self.engine = engine;
                return Err(error);
            }
        };
        self.cycle = Some(BufferedCycle {
            device_name: device_name.to_string(),
            run_file_path: path,
            exposures,
            stop_timeout: properties.stop_timeout(self.config.worker.default_stop_timeout),
            exception_on_failed_shot: properties.exception_on_failed_shot,
            attributes_to_save,
            acquisition,
        });
        Ok(TransitionValues::new())
    }

    /// Finish the shot: wait for the acquisition thread, then save the images.
    ///
    /// The thread gets `stop_acquisition_timeout` to finish before it is
    /// aborted. A failed or short acquisition is an error when the run file
    /// asks for `exception_on_failed_shot`; otherwise it is logged and the
    /// images acquired so far are saved with `failed_shot` set.
    pub fn transition_to_manual(&mut self) -> AppResult<bool> {
        let Some(cycle) = self.cycle.take() else {
            info!("No camera exposures in this shot.");
            self.resume_continuous()?;
            return Ok(true);
        };
        let BufferedCycle {
            device_name,
            run_file_path,
            exposures,
            stop_timeout,
            exception_on_failed_shot,
            attributes_to_save,
            acquisition,
        } = cycle;

        if !acquisition.wait_timeout(stop_timeout) {
            warn!(
                "Acquisition did not finish within {:?} ({} of {} images); aborting",
                stop_timeout,
                acquisition.images_acquired(),
                acquisition.expected()
            );
            if let Err(err) = acquisition.abort() {
                warn!("Abort failed: {}", err);
            }
        }
        let (engine, mut report) = acquisition.join()?;
        engine.reset_abort();
        self.engine = Some(engine);

        let failure = report.take_error();
        let failed_shot = failure.is_some();
        if let Some(err) = failure {
            if exception_on_failed_shot {
                self.restore_manual_mode()?;
                return Err(err);
            }
            error!(
                "{}. Saving {} acquired image(s) anyway.",
                err,
                report.acquired()
            );
        }
        info!("Stopping acquisition after {} image(s)", report.acquired());

        let mut shot = ShotImages::from_exposures(&exposures, report.images);
        shot.attributes = attributes_to_save;
        shot.failed_shot = failed_shot;
        run_file::open(&run_file_path)?.save_shot(&device_name, &shot)?;

        self.restore_manual_mode()?;
        Ok(true)
    }

    /// Abort the current shot and discard its images.
    pub fn abort_buffered(&mut self) -> AppResult<bool> {
        if let Some(cycle) = self.cycle.take() {
            if let Err(err) = cycle.acquisition.abort() {
                warn!("Abort failed: {}", err);
            }
            let (engine, report) = cycle.acquisition.join()?;
            engine.reset_abort();
            self.engine = Some(engine);
            info!("Shot aborted; discarded {} image(s)", report.acquired());
        }
        self.restore_manual_mode()?;
        Ok(true)
    }

    /// Same as [`abort_buffered`](Self::abort_buffered).
    pub fn abort_transition_to_buffered(&mut self) -> AppResult<bool> {
        self.abort_buffered()
    }

    /// Cameras have no manually programmable outputs.
    pub fn program_manual(&mut self, _values: &TransitionValues) -> AppResult<TransitionValues> {
        Ok(TransitionValues::new())
    }

    fn restore_manual_mode(&mut self) -> AppResult<()> {
        let manual = self.config.worker.manual_mode_camera_attributes.clone();
        self.set_attributes_smart(&manual)?;
        self.resume_continuous()
    }

    /// Take a single acquisition. A running live loop is paused around it.
    pub fn snap(&mut self) -> AppResult<Acquisition> {
        if self.cycle.is_some() {
            return Err(CameraError::AcquisitionInProgress);
        }
        let live = self.continuous.as_ref().map(ContinuousLoop::dt);
        if live.is_some() {
            self.stop_continuous(true)?;
        }
        let result = self.engine_mut().and_then(|engine| engine.snap());
        if live.is_some() {
            self.resume_continuous()?;
        }
        result
    }

    /// Start (or restart) the live loop with a minimum frame interval `dt`.
    pub fn start_continuous(&mut self, dt: Duration) -> AppResult<()> {
        if self.cycle.is_some() {
            return Err(CameraError::AcquisitionInProgress);
        }
        if self.continuous.is_some() {
            self.stop_continuous(false)?;
        }
        let engine = self.engine.take().ok_or(CameraError::AcquisitionInProgress)?;
        match ContinuousLoop::start(engine, dt) {
            Ok(live) => {
                self.continuous = Some(live);
                self.paused_continuous = None;
                Ok(())
            }
            Err(SpawnError { error, engine }) => {
                self.engine = engine;
                Err(error)
            }
        }
    }

    /// Stop the live loop. With `pause`, it restarts after the next shot.
    pub fn stop_continuous(&mut self, pause: bool) -> AppResult<()> {
        let Some(live) = self.continuous.take() else {
            return Ok(());
        };
        let dt = live.dt();
        self.engine = Some(live.stop()?);
        self.paused_continuous = pause.then_some(dt);
        Ok(())
    }

    fn resume_continuous(&mut self) -> AppResult<()> {
        match self.paused_continuous.take() {
            Some(dt) => self.start_continuous(dt),
            None => Ok(()),
        }
    }

    /// Whether the live loop is running.
    pub fn is_continuous_running(&self) -> bool {
        self.continuous.is_some()
    }

    /// Whether a live loop is paused until the next transition to manual.
    pub fn is_continuous_paused(&self) -> bool {
        self.paused_continuous.is_some()
    }

    /// Latest frame of the live loop.
    pub fn latest_continuous_image(&self) -> Option<Acquisition> {
        self.continuous.as_ref().and_then(ContinuousLoop::latest)
    }

    /// Frames grabbed by the live loop since it started.
    pub fn continuous_frames(&self) -> usize {
        self.continuous.as_ref().map_or(0, ContinuousLoop::frames)
    }

    /// Stop everything and release the camera.
    pub fn shutdown(mut self) -> AppResult<()> {
        self.paused_continuous = None;
        self.stop_continuous(false)?;
        if self.cycle.is_some() {
            self.abort_buffered()?;
        }
        match self.engine.take() {
            Some(engine) => engine.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCameraConfig;

    fn mock_config() -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.worker.mock = true;
        config.worker.device_name = "andor".to_string();
        config.mock = MockCameraConfig {
            width: 4,
            height: 4,
            ..Default::default()
        };
        config
    }

    #[test]
    fn test_requires_factory_or_mock() {
        let err = CameraWorker::new(WorkerConfig::default(), None).err().unwrap();
        assert!(matches!(err, CameraError::AcquisitionFailure(_)));
    }

    #[test]
    fn test_startup_attributes_are_applied() {
        let mut config = mock_config();
        config.worker.camera_attributes.set("exposure_time", 0.5);
        config.worker.manual_mode_camera_attributes.set("emccd_gain", 10);

        let worker = CameraWorker::new(config, None).unwrap();
        let attributes = worker.get_attributes_as_dict(VisibilityLevel::Simple).unwrap();

        assert_eq!(attributes.get("exposure_time").unwrap(), &serde_json::json!(0.5));
        assert_eq!(attributes.get("emccd_gain").unwrap(), &serde_json::json!(10));
        assert_eq!(worker.smart_cache().len(), 2);
    }

    #[test]
    fn test_smart_programming_skips_unchanged_values() {
        let mut worker = CameraWorker::new(mock_config(), None).unwrap();
        let mut attributes = AttributeSet::new();
        attributes.set("exposure_time", 0.1);
        attributes.set("emccd_gain", 5);

        assert_eq!(worker.set_attributes_smart(&attributes).unwrap(), 2);
        assert_eq!(worker.set_attributes_smart(&attributes).unwrap(), 0);

        attributes.set("emccd_gain", 6);
        assert_eq!(worker.set_attributes_smart(&attributes).unwrap(), 1);
    }

    #[test]
    fn test_attributes_as_text() {
        let mut worker = CameraWorker::new(mock_config(), None).unwrap();
        let mut attributes = AttributeSet::new();
        attributes.set("emccd_gain", 5);
        worker.set_attributes_smart(&attributes).unwrap();

        let text = worker.get_attributes_as_text(VisibilityLevel::Advanced).unwrap();
        assert!(text.contains("emccd_gain: 5\n"));
    }

    #[test]
    fn test_program_manual_returns_nothing() {
        let mut worker = CameraWorker::new(mock_config(), None).unwrap();
        assert!(worker.program_manual(&TransitionValues::new()).unwrap().is_empty());
    }

    #[test]
    fn test_snap_and_shutdown() {
        let worker = CameraWorker::new(mock_config(), None);
        let mut worker = worker.unwrap();
        let frames = worker.snap().unwrap();
        assert_eq!(frames.shape(), &[1, 4, 4]);
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_manual_transition_without_shot_is_a_no_op() {
        let mut worker = CameraWorker::new(mock_config(), None).unwrap();
        assert!(worker.transition_to_manual().unwrap());
        assert!(!worker.is_acquiring());
    }
}
