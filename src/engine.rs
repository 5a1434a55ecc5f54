//! Acquisition engine.
//!
//! Owns the vendor camera handle and the attribute store, and runs one of
//! three acquisition protocols selected by the SDK's acquisition mode:
//!
//! | Mode            | Loop                                   | Stored per iteration     |
//! |-----------------|----------------------------------------|--------------------------|
//! | single          | `n_images` acquisitions                | the whole download       |
//! | fast kinetics   | `n_images / series_len` series         | every sub-frame          |
//! | anything else   | exactly one batch                      | every sub-frame          |
//!
//! Fast-kinetics shots whose image count is not a multiple of the series
//! length drop the remainder. In the one-batch modes the batch runs action
//! index 0.
//!
//! All protocol steps block in the SDK. [`AcquisitionEngine::grab_multiple`]
//! is meant to run on a dedicated thread (see [`crate::acquisition`]); the
//! [`AbortHandle`] is the only way to reach it from outside while it runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::action::ActionRunner;
use crate::attributes::{AttributeSet, AttributeValue, VisibilityLevel};
use crate::buffer::ImageBuffer;
use crate::error::{AppResult, CameraError};
use crate::sdk::{split_frames, Acquisition, AcquisitionMode, CameraSdk, SdkAborter, SdkFactory};

/// Cancels an acquisition from another thread.
///
/// Aborting raises a flag that the engine checks before every acquire and
/// asks the SDK to cancel. Whether a call already blocked in the SDK returns
/// depends on the SDK honouring the cancel.
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    sdk: Arc<dyn SdkAborter>,
}

impl AbortHandle {
    /// Abort the acquisition in progress and raise the abort flag.
    pub fn abort(&self) -> AppResult<()> {
        self.aborted.store(true, Ordering::SeqCst);
        self.sdk.abort_acquisition()
    }

    /// Whether an abort has been requested since the last reset.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }
}

/// Camera driver that executes snap, grab and buffered acquisitions.
pub struct AcquisitionEngine {
    sdk: Box<dyn CameraSdk>,
    attributes: AttributeSet,
    actions: ActionRunner,
    abort: AbortHandle,
    exception_on_failed_shot: bool,
}

impl AcquisitionEngine {
    /// Wrap an SDK handle. The attribute store starts from the camera's
    /// default acquisition attributes.
    pub fn new(sdk: Box<dyn CameraSdk>) -> Self {
        let attributes = sdk.default_acquisition_attrs();
        let abort = AbortHandle {
            aborted: Arc::new(AtomicBool::new(false)),
            sdk: sdk.aborter(),
        };
        Self {
            sdk,
            attributes,
            actions: ActionRunner::default(),
            abort,
            exception_on_failed_shot: true,
        }
    }

    /// Build the SDK handle through an injected factory.
    pub fn from_factory(factory: &SdkFactory) -> AppResult<Self> {
        Ok(Self::new(factory()?))
    }

    /// Use `actions` for per-frame actions.
    pub fn with_actions(mut self, actions: ActionRunner) -> Self {
        self.actions = actions;
        self
    }

    /// Action runner used by `grab_multiple`.
    pub fn actions(&self) -> &ActionRunner {
        &self.actions
    }

    /// Mutable access to the action runner.
    pub fn actions_mut(&mut self) -> &mut ActionRunner {
        &mut self.actions
    }

    /// Set one attribute. Takes effect on the next configure.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.set(name, value);
    }

    /// Merge `attributes` into the stored set.
    pub fn set_attributes(&mut self, attributes: &AttributeSet) {
        self.attributes
            .set_many(attributes.iter().map(|(name, value)| (name.clone(), value.clone())));
    }

    /// Stored value of `name`.
    pub fn get_attribute(&self, name: &str) -> AppResult<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Names of every stored attribute.
    pub fn attribute_names(&self, visibility: VisibilityLevel, writeable_only: bool) -> Vec<String> {
        self.attributes.names(visibility, writeable_only)
    }

    /// Every stored attribute.
    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Whether a failed shot is reported as an error.
    pub fn exception_on_failed_shot(&self) -> bool {
        self.exception_on_failed_shot
    }

    /// Set whether a failed shot is reported as an error.
    pub fn set_exception_on_failed_shot(&mut self, value: bool) {
        self.exception_on_failed_shot = value;
    }

    /// Acquisition mode currently programmed on the camera.
    pub fn acquisition_mode(&self) -> AcquisitionMode {
        self.sdk.acquisition_mode()
    }

    /// Merge `attributes` into the store and push the full set to the SDK.
    pub fn configure(&mut self, attributes: &AttributeSet) -> AppResult<()> {
        self.set_attributes(attributes);
        self.configure_acquisition(None)
    }

    /// Push the full attribute set to the SDK. Must precede any acquire.
    pub fn configure_acquisition(&mut self, buffer_count: Option<usize>) -> AppResult<()> {
        debug!(?buffer_count, attributes = self.attributes.len(), "Setting up acquisition");
        self.sdk.setup_acquisition(&self.attributes)
    }

    /// Configure, acquire and download a single acquisition.
    ///
    /// The result may hold several sub-frames in multi-frame modes.
    pub fn snap(&mut self) -> AppResult<Acquisition> {
        self.configure_acquisition(None)?;
        self.sdk.acquire()?;
        let frames = self.sdk.download_acquisition()?;
        info!("Exposure time was {}", self.sdk.exposure_time());
        Ok(frames)
    }

    /// Grab the last/single image (same as [`snap`](Self::snap)).
    pub fn grab(&mut self) -> AppResult<Acquisition> {
        self.snap()
    }

    /// Number of images a buffered shot of `n_images` will produce in the
    /// current mode. One-batch modes report `n_images`.
    pub fn expected_images(&self, n_images: usize) -> usize {
        match self.sdk.acquisition_mode() {
            AcquisitionMode::FastKinetics => {
                let series_len = self.sdk.number_fast_kinetics();
                if series_len == 0 {
                    0
                } else {
                    (n_images / series_len) * series_len
                }
            }
            _ => n_images,
        }
    }

    /// Run a buffered acquisition of `n_images`, storing frames in `images`.
    ///
    /// `actions[i]` (when present) runs after the i-th download and before its
    /// frames are stored. Returns the number of images appended. SDK failures
    /// are not caught; the images stored so far stay in the buffer.
    pub fn grab_multiple(
        &mut self,
        n_images: usize,
        images: &ImageBuffer,
        actions: &[Option<String>],
    ) -> AppResult<usize> {
        let mode = self.sdk.acquisition_mode();
        self.log_timing_report(&mode, n_images);

        let start = images.len();
        let result = self.run_protocol(&mode, n_images, images, actions);
        self.sdk.set_armed(false);
        result?;

        Ok(images.len() - start)
    }

    fn run_protocol(
        &mut self,
        mode: &AcquisitionMode,
        n_images: usize,
        images: &ImageBuffer,
        actions: &[Option<String>],
    ) -> AppResult<()> {
        match mode {
            AcquisitionMode::Single => {
                for index in 0..n_images {
                    let downloaded = self.acquire_and_download(index)?;
                    self.run_action(actions, index, images, &downloaded)?;
                    images.push(downloaded.into_dyn());
                    self.sdk.set_armed(true);
                }
                info!("Got {} of {} acquisition(s).", images.len(), n_images);
            }
            AcquisitionMode::FastKinetics => {
                let series_len = self.sdk.number_fast_kinetics();
                if series_len == 0 {
                    return Err(CameraError::AcquisitionFailure(
                        "fast-kinetics series length is zero".to_string(),
                    ));
                }
                let n_series = n_images / series_len;
                let remainder = n_images % series_len;
                if remainder > 0 {
                    warn!(
                        "{} image(s) requested but series length is {}: the last {} image(s) will not be acquired",
                        n_images, series_len, remainder
                    );
                }
                for index in 0..n_series {
                    let downloaded = self.acquire_and_download(index)?;
                    self.run_action(actions, index, images, &downloaded)?;
                    images.extend(split_frames(&downloaded));
                    self.sdk.set_armed(true);
                }
                info!(
                    "Got {} images in {} FK series acquisition(s).",
                    images.len(),
                    n_series
                );
            }
            AcquisitionMode::KineticSeries | AcquisitionMode::Other(_) => {
                let downloaded = self.acquire_and_download(0)?;
                info!(
                    "    images {}-{}: Download complete",
                    images.len(),
                    images.len() + downloaded.dim().0
                );
                self.run_action(actions, 0, images, &downloaded)?;
                images.extend(split_frames(&downloaded));
                info!("Got {} of {} acquisition(s).", images.len(), n_images);
            }
        }
        Ok(())
    }

    fn acquire_and_download(&mut self, index: usize) -> AppResult<Acquisition> {
        if self.abort.is_aborted() {
            return Err(CameraError::Aborted);
        }
        self.sdk.acquire().map_err(|e| self.aborted_or(e))?;
        info!("    {}: Acquire complete", index);
        let downloaded = self
            .sdk
            .download_acquisition()
            .map_err(|e| self.aborted_or(e))?;
        info!("    {}: Download complete", index);
        Ok(downloaded)
    }

    fn aborted_or(&self, err: CameraError) -> CameraError {
        if self.abort.is_aborted() {
            debug!("SDK call ended by abort: {}", err);
            CameraError::Aborted
        } else {
            err
        }
    }

    fn run_action(
        &self,
        actions: &[Option<String>],
        index: usize,
        images: &ImageBuffer,
        frames: &Acquisition,
    ) -> AppResult<()> {
        match actions.get(index).and_then(|action| action.as_deref()) {
            Some(action) => self.execute_action(action, index, images.len(), frames),
            None => Ok(()),
        }
    }

    /// Run one action. A missing action file is logged and skipped; any other
    /// failure is returned.
    pub fn execute_action(
        &self,
        action: &str,
        index: usize,
        images_acquired: usize,
        frames: &Acquisition,
    ) -> AppResult<()> {
        match self.actions.run(action, index, images_acquired, frames) {
            Err(CameraError::ActionNotFound(path)) => {
                warn!("Error: The file '{}' does not exist.", path.display());
                Ok(())
            }
            other => other,
        }
    }

    fn log_timing_report(&self, mode: &AcquisitionMode, n_images: usize) {
        info!("Camera configured in {} mode.", mode);
        info!("Actual readout time is {} s.", self.sdk.readout_time());
        info!("Keep clean cycle time is {} s.", self.sdk.keep_clean_time());
        if *mode == AcquisitionMode::KineticSeries {
            info!("Kinetics number is {}.", self.sdk.number_kinetics());
            info!("Actual kinetics period is {} s.", self.sdk.kinetics_timing());
        }
        info!("Actual exposure time is {} s.", self.sdk.exposure_time());
        info!(
            "Actual digitization speed (HSpeed) is {} MHz.",
            self.sdk.horizontal_shift_speed()
        );
        info!("Actual vertical shift speed is {} us.", self.sdk.vs_speed());
        info!(" ---> EMCCD Gain value is {}.", self.sdk.emccd_gain());
        if *mode == AcquisitionMode::FastKinetics {
            info!(
                "FK mode Kinetics Number is {}.",
                self.sdk.number_fast_kinetics()
            );
        }
        info!("    ---> Attempting to grab {} acquisition(s).", n_images);
    }

    /// Cancel an in-flight acquisition and raise the aborted flag.
    pub fn abort(&self) -> AppResult<()> {
        self.abort.abort()
    }

    /// Handle that aborts from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Whether an abort has been requested since the last reset.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Clear the abort flag.
    pub fn reset_abort(&self) {
        self.abort.reset();
    }

    /// Shut down the camera. Taking `self` by value guarantees no acquisition
    /// thread still holds the engine.
    pub fn close(mut self) -> AppResult<()> {
        info!("Closing camera");
        self.sdk.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionContext, ActionSettings};
    use crate::mock::{MockCameraConfig, MockProbe, MockSdk, SdkCall};
    use parking_lot::Mutex;

    fn engine_with(config: MockCameraConfig) -> (AcquisitionEngine, MockProbe) {
        let sdk = MockSdk::new(config);
        let probe = sdk.probe();
        (AcquisitionEngine::new(Box::new(sdk)), probe)
    }

    fn mode(mode: &str) -> MockCameraConfig {
        MockCameraConfig {
            acquisition_mode: mode.to_string(),
            width: 4,
            height: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_attributes_start_from_sdk_defaults() {
        let (engine, _) = engine_with(MockCameraConfig::default());
        assert_eq!(
            engine.get_attribute("acquisition").unwrap(),
            &serde_json::json!("single")
        );
        assert!(engine.exception_on_failed_shot());
    }

    #[test]
    fn test_snap_configures_before_acquiring() {
        let (mut engine, probe) = engine_with(mode("single"));
        let frames = engine.snap().unwrap();

        assert_eq!(frames.shape(), &[1, 3, 4]);
        let calls = probe.calls();
        assert!(matches!(calls[0], SdkCall::Setup(_)));
        assert_eq!(&calls[1..], &[SdkCall::Acquire, SdkCall::Download]);
    }

    #[test]
    fn test_single_mode_appends_one_image_per_exposure() {
        let (mut engine, probe) = engine_with(mode("single"));
        let images = ImageBuffer::new();

        let appended = engine.grab_multiple(3, &images, &[]).unwrap();

        assert_eq!(appended, 3);
        assert_eq!(images.len(), 3);
        assert_eq!(probe.acquisitions(), 3);
        assert!(!probe.is_armed());
        // Whole downloads are stored in single-image mode
        assert_eq!(images.snapshot()[2].shape(), &[1, 3, 4]);
    }

    #[test]
    fn test_single_mode_action_runs_before_append() {
        let (engine, _) = engine_with(mode("single"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut runner = ActionRunner::new("andor", ActionSettings::default());
        runner.register("mark", move |ctx: &ActionContext<'_>| {
            sink.lock().push((ctx.index, ctx.images_acquired));
            Ok(())
        });
        let mut engine = engine.with_actions(runner);

        let images = ImageBuffer::new();
        let actions = vec![None, Some("mark".to_string()), None, Some("mark".to_string())];
        engine.grab_multiple(4, &images, &actions).unwrap();

        assert_eq!(seen.lock().as_slice(), &[(1, 1), (3, 3)]);
        assert_eq!(images.len(), 4);
    }

    #[test]
    fn test_fast_kinetics_truncates_remainder() {
        let mut config = mode("fast_kinetics");
        config.number_fast_kinetics = 4;
        let (mut engine, probe) = engine_with(config);
        let images = ImageBuffer::new();

        let appended = engine.grab_multiple(10, &images, &[]).unwrap();

        assert_eq!(appended, 8);
        assert_eq!(engine.expected_images(10), 8);
        assert_eq!(probe.acquisitions(), 2);
        assert_eq!(images.snapshot()[0].shape(), &[3, 4]);
    }

    #[test]
    fn test_fast_kinetics_action_per_series() {
        let mut config = mode("fast_kinetics");
        config.number_fast_kinetics = 2;
        let (engine, _) = engine_with(config);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut runner = ActionRunner::default();
        runner.register("series", move |ctx: &ActionContext<'_>| {
            sink.lock().push((ctx.index, ctx.frames.dim().0));
            Ok(())
        });
        let mut engine = engine.with_actions(runner);

        let images = ImageBuffer::new();
        let actions = vec![Some("series".to_string()), Some("series".to_string())];
        engine.grab_multiple(4, &images, &actions).unwrap();

        assert_eq!(seen.lock().as_slice(), &[(0, 2), (1, 2)]);
        assert_eq!(images.len(), 4);
    }

    #[test]
    fn test_fast_kinetics_fewer_images_than_series_acquires_nothing() {
        let mut config = mode("fast_kinetics");
        config.number_fast_kinetics = 4;
        let (mut engine, probe) = engine_with(config);
        let images = ImageBuffer::new();

        assert_eq!(engine.grab_multiple(3, &images, &[]).unwrap(), 0);
        assert_eq!(probe.acquisitions(), 0);
    }

    #[test]
    fn test_other_mode_produces_exactly_one_batch() {
        let mut config = mode("kinetic_series");
        config.number_kinetics = 3;
        let (engine, probe) = engine_with(config);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut runner = ActionRunner::default();
        runner.register("batch", move |ctx: &ActionContext<'_>| {
            sink.lock().push(ctx.index);
            Ok(())
        });
        let mut engine = engine.with_actions(runner);

        let images = ImageBuffer::new();
        let actions = vec![Some("batch".to_string()); 7];
        let appended = engine.grab_multiple(7, &images, &actions).unwrap();

        assert_eq!(appended, 3);
        assert_eq!(probe.acquisitions(), 1);
        assert_eq!(seen.lock().as_slice(), &[0]);
    }

    #[test]
    fn test_other_mode_runs_even_for_zero_images() {
        let (mut engine, probe) = engine_with(mode("run_till_abort"));
        let images = ImageBuffer::new();

        assert_eq!(engine.grab_multiple(0, &images, &[]).unwrap(), 1);
        assert_eq!(probe.acquisitions(), 1);
    }

    #[test]
    fn test_sdk_failure_propagates_and_keeps_partial_images() {
        let (mut engine, probe) = engine_with(mode("single"));
        probe.fail_on_acquire(2);
        let images = ImageBuffer::new();

        let err = engine.grab_multiple(5, &images, &[]).unwrap_err();

        assert!(matches!(err, CameraError::AcquisitionFailure(_)));
        assert_eq!(images.len(), 2);
        assert!(!probe.is_armed());
    }

    #[test]
    fn test_abort_stops_before_next_acquire() {
        let (mut engine, probe) = engine_with(mode("single"));
        engine.abort().unwrap();
        let images = ImageBuffer::new();

        let err = engine.grab_multiple(3, &images, &[]).unwrap_err();

        assert!(matches!(err, CameraError::Aborted));
        assert_eq!(probe.acquisitions(), 0);
        assert!(probe.calls().contains(&SdkCall::Abort));

        engine.reset_abort();
        assert_eq!(engine.grab_multiple(1, &images, &[]).unwrap(), 1);
    }

    #[test]
    fn test_missing_action_file_is_recovered() {
        let (mut engine, _) = engine_with(mode("single"));
        let images = ImageBuffer::new();
        let actions = vec![Some("/no/such/action.py".to_string())];

        assert_eq!(engine.grab_multiple(1, &images, &actions).unwrap(), 1);
    }

    #[test]
    fn test_failing_action_propagates() {
        let (engine, _) = engine_with(mode("single"));
        let mut runner = ActionRunner::default();
        runner.register("explode", |_ctx: &ActionContext<'_>| anyhow::bail!("bad frame"));
        let mut engine = engine.with_actions(runner);
        let images = ImageBuffer::new();
        let actions = vec![None, Some("explode".to_string())];

        let err = engine.grab_multiple(3, &images, &actions).unwrap_err();
        assert!(matches!(err, CameraError::ActionFailed { .. }));
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn test_close_shuts_down_sdk() {
        let (engine, probe) = engine_with(MockCameraConfig::default());
        engine.close().unwrap();
        assert_eq!(probe.calls(), vec![SdkCall::Shutdown]);
    }
}
