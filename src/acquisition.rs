//! Background acquisition thread.
//!
//! The worker moves its [`AcquisitionEngine`] into a dedicated thread that
//! runs [`AcquisitionEngine::grab_multiple`] and gets it back through
//! [`AcquisitionHandle::join`]. While the thread runs, the worker only holds
//! the shared [`ImageBuffer`], the [`Completion`] carrying the thread's
//! result, and an [`AbortHandle`].
//!
//! A panic inside the protocol is caught so that the engine (and with it the
//! camera handle) always comes back to the worker. If the thread cannot be
//! started at all, the engine is handed back inside [`SpawnError`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::buffer::{Completion, ImageBuffer};
use crate::engine::{AbortHandle, AcquisitionEngine};
use crate::error::{AppResult, CameraError};
use crate::sdk::Image;

/// A thread that should have taken over the engine could not be started.
pub struct SpawnError {
    /// Why the thread did not start.
    pub error: CameraError,
    /// The engine the thread would have owned.
    pub engine: Option<AcquisitionEngine>,
}

impl fmt::Debug for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("error", &self.error)
            .field("engine_returned", &self.engine.is_some())
            .finish()
    }
}

impl From<SpawnError> for CameraError {
    fn from(err: SpawnError) -> Self {
        err.error
    }
}

/// Run `body` on a thread built by `builder`, giving it ownership of `engine`.
///
/// The engine sits in a slot the thread empties when it starts, so a failed
/// spawn leaves it there for the caller.
pub(crate) fn spawn_with_engine<F>(
    builder: thread::Builder,
    engine: AcquisitionEngine,
    body: F,
) -> Result<JoinHandle<Option<AcquisitionEngine>>, SpawnError>
where
    F: FnOnce(AcquisitionEngine) -> AcquisitionEngine + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(engine)));
    let handed_over = slot.clone();
    builder
        .spawn(move || {
            let engine = handed_over.lock().take()?;
            Some(body(engine))
        })
        .map_err(|err| SpawnError {
            error: err.into(),
            engine: slot.lock().take(),
        })
}

/// Outcome of one buffered acquisition.
#[derive(Debug)]
pub struct AcquisitionReport {
    /// Images the shot should have produced.
    pub expected: usize,
    /// Images appended by the acquisition thread, in order.
    pub images: Vec<Image>,
    /// Result of `grab_multiple` as returned on the acquisition thread.
    pub outcome: AppResult<usize>,
}

impl AcquisitionReport {
    /// Number of images acquired.
    pub fn acquired(&self) -> usize {
        self.images.len()
    }

    /// Whether the shot finished without error and with every expected image.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_ok() && self.images.len() >= self.expected
    }

    /// Error describing why the shot failed, if it did. Consumes the outcome.
    ///
    /// An aborted shot that came up short is reported as a partial acquisition.
    pub fn take_error(&mut self) -> Option<CameraError> {
        let outcome = std::mem::replace(&mut self.outcome, Ok(self.images.len()));
        match outcome {
            Err(CameraError::Aborted) if self.images.len() < self.expected => {
                Some(CameraError::PartialAcquisition {
                    expected: self.expected,
                    acquired: self.images.len(),
                })
            }
            Err(err) => Some(err),
            Ok(_) if self.images.len() < self.expected => Some(CameraError::PartialAcquisition {
                expected: self.expected,
                acquired: self.images.len(),
            }),
            Ok(_) => None,
        }
    }

    /// The images, or the failure that cut the shot short.
    pub fn into_images(mut self) -> AppResult<Vec<Image>> {
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(self.images),
        }
    }
}

/// Handle on a running buffered acquisition.
pub struct AcquisitionHandle {
    thread: JoinHandle<Option<AcquisitionEngine>>,
    completion: Arc<Completion<AppResult<usize>>>,
    images: ImageBuffer,
    abort: AbortHandle,
    expected: usize,
}

impl std::fmt::Debug for AcquisitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionHandle")
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl AcquisitionHandle {
    /// Move `engine` onto a new thread and start acquiring `n_images`.
    pub fn spawn(
        engine: AcquisitionEngine,
        n_images: usize,
        actions: Vec<Option<String>>,
    ) -> Result<Self, SpawnError> {
        Self::spawn_on(
            thread::Builder::new().name("acquisition".to_string()),
            engine,
            n_images,
            actions,
        )
    }

    fn spawn_on(
        builder: thread::Builder,
        engine: AcquisitionEngine,
        n_images: usize,
        actions: Vec<Option<String>>,
    ) -> Result<Self, SpawnError> {
        engine.reset_abort();
        let abort = engine.abort_handle();
        let expected = engine.expected_images(n_images);
        let images = ImageBuffer::new();
        let completion = Arc::new(Completion::new());

        let thread = {
            let images = images.clone();
            let completion = completion.clone();
            spawn_with_engine(builder, engine, move |mut engine| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.grab_multiple(n_images, &images, &actions)
                }))
                .unwrap_or_else(|_| Err(CameraError::ThreadPanicked));

                if let Err(err) = &outcome {
                    error!("Acquisition thread stopped: {}", err);
                }
                completion.complete(outcome);
                engine
            })?
        };
        info!("Acquisition thread started for {} image(s)", n_images);

        Ok(Self {
            thread,
            completion,
            images,
            abort,
            expected,
        })
    }

    /// Images the shot should produce.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Images appended so far.
    pub fn images_acquired(&self) -> usize {
        self.images.len()
    }

    /// Whether the thread has published its result.
    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }

    /// Block until the thread signals completion or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    /// Abort the acquisition in progress.
    pub fn abort(&self) -> AppResult<()> {
        self.abort.abort()
    }

    /// Wait for the thread and recover the engine with the shot's outcome.
    pub fn join(self) -> AppResult<(AcquisitionEngine, AcquisitionReport)> {
        let engine = self
            .thread
            .join()
            .map_err(|_| CameraError::ThreadPanicked)?
            .ok_or(CameraError::ThreadPanicked)?;
        let outcome = self
            .completion
            .take()
            .unwrap_or(Err(CameraError::ThreadPanicked));

        Ok((
            engine,
            AcquisitionReport {
                expected: self.expected,
                images: self.images.take(),
                outcome,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCameraConfig, MockProbe, MockSdk};

    fn engine(config: MockCameraConfig) -> (AcquisitionEngine, MockProbe) {
        let sdk = MockSdk::new(config);
        let probe = sdk.probe();
        (AcquisitionEngine::new(Box::new(sdk)), probe)
    }

    fn triggered() -> MockCameraConfig {
        MockCameraConfig {
            width: 4,
            height: 2,
            external_trigger: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_join_returns_engine_and_images() {
        let (engine, _) = engine(MockCameraConfig::default());
        let handle = AcquisitionHandle::spawn(engine, 3, vec![]).unwrap();

        assert!(handle.wait_timeout(Duration::from_secs(5)));
        let (_engine, report) = handle.join().unwrap();

        assert!(report.is_complete());
        assert_eq!(report.into_images().unwrap().len(), 3);
    }

    #[test]
    fn test_thread_waits_for_triggers() {
        let (engine, probe) = engine(triggered());
        let handle = AcquisitionHandle::spawn(engine, 2, vec![]).unwrap();

        assert!(!handle.wait_timeout(Duration::from_millis(30)));
        assert_eq!(handle.images_acquired(), 0);

        probe.trigger();
        probe.trigger();
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert_eq!(handle.images_acquired(), 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_abort_surfaces_as_partial_shot() {
        let (engine, probe) = engine(triggered());
        let handle = AcquisitionHandle::spawn(engine, 3, vec![]).unwrap();

        probe.trigger();
        // Let the first frame land before aborting the second acquire
        for _ in 0..200 {
            if handle.images_acquired() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.abort().unwrap();

        assert!(handle.wait_timeout(Duration::from_secs(5)));
        let (engine, mut report) = handle.join().unwrap();
        assert_eq!(report.acquired(), 1);
        assert!(matches!(
            report.take_error(),
            Some(CameraError::PartialAcquisition {
                expected: 3,
                acquired: 1
            })
        ));
        assert!(engine.is_aborted());
    }

    /// A stack no address space can hold, so the thread never starts.
    fn unstartable() -> thread::Builder {
        thread::Builder::new().stack_size(usize::MAX / 4)
    }

    #[test]
    fn test_failed_spawn_hands_engine_back() {
        let (engine, probe) = engine(MockCameraConfig::default());
        let err = AcquisitionHandle::spawn_on(unstartable(), engine, 2, vec![]).unwrap_err();

        assert!(matches!(err.error, CameraError::Io(_)));
        let mut engine = err.engine.unwrap();
        assert_eq!(probe.acquisitions(), 0);
        assert_eq!(engine.snap().unwrap().shape()[0], 1);
    }

    #[test]
    fn test_short_buffer_is_reported_as_partial() {
        let report = AcquisitionReport {
            expected: 4,
            images: vec![ndarray::ArrayD::zeros(vec![2, 2])],
            outcome: Ok(1),
        };
        assert!(matches!(
            report.into_images(),
            Err(CameraError::PartialAcquisition {
                expected: 4,
                acquired: 1
            })
        ));
    }
}
