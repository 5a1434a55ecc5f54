//! Per-frame actions.
//!
//! An exposure may name an *action* to run once its frame (or fast-kinetics
//! series) has been downloaded and before it is stored. Actions run inline on
//! the acquisition thread, so a slow action delays the next acquire.
//!
//! # Action kinds
//!
//! A reference is resolved in this order:
//!
//! 1. **Registered callback**: a Rust closure registered under that exact name
//!    with [`ActionRunner::register`].
//! 2. **Rhai script** (`*.rhai`): evaluated in a sandboxed Rhai engine with an
//!    operation limit. The script sees read-only constants `device`, `index`,
//!    `images_acquired`, `n_frames`, `rows`, `cols`, `mean`, `min` and `max`
//!    and can fail the action with `throw`.
//! 3. **Subprocess**: any other existing file is run as a program with the
//!    argument contract `<device> <index> <n_frames> <rows> <cols>`. Files whose
//!    extension has a configured interpreter are passed to that interpreter
//!    instead. A non-zero exit status fails the action.
//!
//! References are never executed as in-process code. Subprocess actions run
//! with the worker's privileges; disable them with `allow_subprocess = false`
//! when run files come from untrusted sources.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use rhai::{Engine, Scope};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppResult, CameraError};
use crate::sdk::Acquisition;

/// Signature of a registered action.
pub type ActionCallback = Arc<dyn Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// What an action gets to see.
pub struct ActionContext<'a> {
    /// Device the shot belongs to
    pub device_name: &'a str,
    /// Exposure index (single-image mode) or series index (fast kinetics)
    pub index: usize,
    /// Images already in the shot buffer; the current frames are not yet stored
    pub images_acquired: usize,
    /// The downloaded frames
    pub frames: &'a Acquisition,
}

/// Summary statistics over every pixel of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    /// Mean pixel value.
    pub mean: f64,
    /// Darkest pixel.
    pub min: u16,
    /// Brightest pixel.
    pub max: u16,
}

impl ActionContext<'_> {
    /// Pixel statistics of the frames.
    pub fn stats(&self) -> FrameStats {
        if self.frames.is_empty() {
            return FrameStats {
                mean: 0.0,
                min: 0,
                max: 0,
            };
        }
        let sum: u64 = self.frames.iter().map(|&v| v as u64).sum();
        FrameStats {
            mean: sum as f64 / self.frames.len() as f64,
            min: self.frames.iter().copied().min().unwrap_or(0),
            max: self.frames.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Action runner settings (`[actions]` config section).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSettings {
    /// Allow actions that start external programs
    #[serde(default = "default_allow_subprocess")]
    pub allow_subprocess: bool,
    /// Interpreter per file extension, e.g. `py = "python3"`
    #[serde(default)]
    pub interpreters: BTreeMap<String, String>,
    /// Maximum Rhai operations per script evaluation
    #[serde(default = "default_operation_limit")]
    pub script_operation_limit: u64,
    /// Base directory for relative action paths, and working directory of subprocesses
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_allow_subprocess() -> bool {
    true
}

fn default_operation_limit() -> u64 {
    100_000
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            allow_subprocess: default_allow_subprocess(),
            interpreters: BTreeMap::new(),
            script_operation_limit: default_operation_limit(),
            working_dir: None,
        }
    }
}

/// Resolves and runs action references.
pub struct ActionRunner {
    device_name: String,
    settings: ActionSettings,
    callbacks: HashMap<String, ActionCallback>,
    scripts: Engine,
}

fn script_engine(max_operations: u64) -> Engine {
    let mut engine = Engine::new();

    // Safety: Limit operations to prevent runaway scripts stalling the acquisition thread
    engine.on_progress(move |count| {
        if count > max_operations {
            Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
        } else {
            None
        }
    });
    engine.on_print(|text| info!("[action] {}", text));

    engine
}

impl ActionRunner {
    /// Runner for `device_name` with no registered callbacks.
    pub fn new(device_name: impl Into<String>, settings: ActionSettings) -> Self {
        let scripts = script_engine(settings.script_operation_limit);
        Self {
            device_name: device_name.into(),
            settings,
            callbacks: HashMap::new(),
            scripts,
        }
    }

    /// Device passed to every action.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Change the device passed to every action.
    pub fn set_device_name(&mut self, device_name: impl Into<String>) {
        self.device_name = device_name.into();
    }

    /// Register a callback under `name`. Registered names take precedence over
    /// files of the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(callback));
    }

    /// Whether a callback is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    /// Run one action.
    ///
    /// # Errors
    ///
    /// - [`CameraError::ActionNotFound`] if the reference is neither registered
    ///   nor an existing file
    /// - [`CameraError::ActionFailed`] if the action itself fails
    pub fn run(
        &self,
        action: &str,
        index: usize,
        images_acquired: usize,
        frames: &Acquisition,
    ) -> AppResult<()> {
        info!("Executing action: {}", action);
        let ctx = ActionContext {
            device_name: &self.device_name,
            index,
            images_acquired,
            frames,
        };

        if let Some(callback) = self.callbacks.get(action) {
            return callback(&ctx).map_err(|e| CameraError::ActionFailed {
                action: action.to_string(),
                reason: format!("{:#}", e),
            });
        }

        let path = self.resolve(action);
        if !path.is_file() {
            return Err(CameraError::ActionNotFound(path));
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("rhai") => self.run_script(action, &path, &ctx),
            _ => self.run_subprocess(action, &path, &ctx),
        }
    }

    fn resolve(&self, action: &str) -> PathBuf {
        let path = PathBuf::from(action);
        match &self.settings.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }

    fn run_script(&self, action: &str, path: &Path, ctx: &ActionContext<'_>) -> AppResult<()> {
        let script = fs::read_to_string(path)?;
        let (n_frames, rows, cols) = ctx.frames.dim();
        let stats = ctx.stats();

        let mut scope = Scope::new();
        scope.push_constant("device", ctx.device_name.to_string());
        scope.push_constant("index", ctx.index as i64);
        scope.push_constant("images_acquired", ctx.images_acquired as i64);
        scope.push_constant("n_frames", n_frames as i64);
        scope.push_constant("rows", rows as i64);
        scope.push_constant("cols", cols as i64);
        scope.push_constant("mean", stats.mean);
        scope.push_constant("min", stats.min as i64);
        scope.push_constant("max", stats.max as i64);

        self.scripts
            .run_with_scope(&mut scope, &script)
            .map_err(|e| CameraError::ActionFailed {
                action: action.to_string(),
                reason: e.to_string(),
            })
    }

    fn run_subprocess(&self, action: &str, path: &Path, ctx: &ActionContext<'_>) -> AppResult<()> {
        let failed = |reason: String| CameraError::ActionFailed {
            action: action.to_string(),
            reason,
        };

        if !self.settings.allow_subprocess {
            return Err(failed("subprocess actions are disabled".to_string()));
        }

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let mut command = match self.settings.interpreters.get(extension) {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(path);
                command
            }
            None => Command::new(path),
        };

        let (n_frames, rows, cols) = ctx.frames.dim();
        command
            .arg(ctx.device_name)
            .arg(ctx.index.to_string())
            .arg(n_frames.to_string())
            .arg(rows.to_string())
            .arg(cols.to_string());
        if let Some(dir) = &self.settings.working_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .map_err(|e| failed(format!("failed to start: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("Action {} output: {}", action, stdout.trim());
        }
        if !output.status.success() {
            return Err(failed(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Default for ActionRunner {
    fn default() -> Self {
        Self::new("camera", ActionSettings::default())
    }
}
