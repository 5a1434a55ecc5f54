//! Live (continuous) acquisition loop.
//!
//! Outside of buffered shots a worker can run the camera continuously for
//! monitoring. The loop owns the engine while it runs and keeps only the
//! latest frame. Stopping returns the engine.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::acquisition::{spawn_with_engine, SpawnError};
use crate::engine::{AbortHandle, AcquisitionEngine};
use crate::error::{AppResult, CameraError};
use crate::sdk::Acquisition;

/// Granularity of the wait between frames.
const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct LiveState {
    stop: AtomicBool,
    frames: AtomicUsize,
    latest: Mutex<Option<Acquisition>>,
}

/// Background loop grabbing frames until stopped.
pub struct ContinuousLoop {
    thread: JoinHandle<Option<AcquisitionEngine>>,
    state: Arc<LiveState>,
    abort: AbortHandle,
    dt: Duration,
}

impl ContinuousLoop {
    /// Start grabbing frames at most every `dt`.
    pub fn start(engine: AcquisitionEngine, dt: Duration) -> Result<Self, SpawnError> {
        Self::start_on(
            thread::Builder::new().name("continuous".to_string()),
            engine,
            dt,
        )
    }

    fn start_on(
        builder: thread::Builder,
        engine: AcquisitionEngine,
        dt: Duration,
    ) -> Result<Self, SpawnError> {
        let abort = engine.abort_handle();
        let state = Arc::new(LiveState::default());

        let thread = {
            let state = state.clone();
            spawn_with_engine(builder, engine, move |engine| run(engine, dt, &state))?
        };
        info!("Continuous acquisition started (dt = {:?})", dt);

        Ok(Self {
            thread,
            state,
            abort,
            dt,
        })
    }

    /// Minimum interval between frames.
    pub fn dt(&self) -> Duration {
        self.dt
    }

    /// Frames grabbed since the loop started.
    pub fn frames(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }

    /// Most recent frame, if any.
    pub fn latest(&self) -> Option<Acquisition> {
        self.state.latest.lock().clone()
    }

    /// Whether the loop ended on its own (after an acquisition error).
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop the loop and recover the engine.
    pub fn stop(self) -> AppResult<AcquisitionEngine> {
        self.state.stop.store(true, Ordering::SeqCst);
        // A grab may be between setup and acquire when the first abort lands,
        // so keep aborting until the loop has exited.
        while !self.thread.is_finished() {
            if let Err(err) = self.abort.abort() {
                debug!("Abort while stopping continuous acquisition: {}", err);
            }
            thread::sleep(STOP_POLL);
        }
        let frames = self.frames();
        let engine = self
            .thread
            .join()
            .map_err(|_| CameraError::ThreadPanicked)?
            .ok_or(CameraError::ThreadPanicked)?;
        engine.reset_abort();
        info!("Continuous acquisition stopped after {} frame(s)", frames);
        Ok(engine)
    }
}

fn run(mut engine: AcquisitionEngine, dt: Duration, state: &LiveState) -> AcquisitionEngine {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        while !state.stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            match engine.grab() {
                Ok(frame) => {
                    *state.latest.lock() = Some(frame);
                    state.frames.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) if state.stop.load(Ordering::SeqCst) => break,
                Err(err) => {
                    error!("Continuous acquisition stopped: {}", err);
                    break;
                }
            }
            while started.elapsed() < dt && !state.stop.load(Ordering::SeqCst) {
                thread::sleep(STOP_POLL.min(dt.saturating_sub(started.elapsed())));
            }
        }
    }));
    if result.is_err() {
        error!("Continuous acquisition panicked");
    }
    engine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCameraConfig, MockSdk};

    fn engine(external_trigger: bool) -> AcquisitionEngine {
        let config = MockCameraConfig {
            width: 4,
            height: 4,
            external_trigger,
            ..Default::default()
        };
        AcquisitionEngine::new(Box::new(MockSdk::new(config)))
    }

    #[test]
    fn test_loop_keeps_latest_frame() {
        let live = ContinuousLoop::start(engine(false), Duration::from_millis(5)).unwrap();
        for _ in 0..200 {
            if live.frames() >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(live.frames() >= 3);
        assert_eq!(live.latest().unwrap().shape(), &[1, 4, 4]);
        let engine = live.stop().unwrap();
        assert!(!engine.is_aborted());
    }

    #[test]
    fn test_stop_unblocks_waiting_grab() {
        let live = ContinuousLoop::start(engine(true), Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(live.frames(), 0);

        live.stop().unwrap();
    }

    #[test]
    fn test_failed_start_returns_engine() {
        let builder = thread::Builder::new().stack_size(usize::MAX / 4);
        let err = ContinuousLoop::start_on(builder, engine(false), Duration::from_millis(1))
            .err()
            .unwrap();

        let mut engine = err.engine.unwrap();
        assert_eq!(engine.snap().unwrap().shape(), &[1, 4, 4]);
    }
}
