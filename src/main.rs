//! `labcam` command line: run a buffered shot or a snap on the simulated camera,
//! or check a configuration file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use labcam::action::ActionRunner;
use labcam::mock::MockSdk;
use labcam::{logging, AcquisitionEngine, CameraWorker, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "labcam")]
#[command(about = "Buffered-acquisition camera worker")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = labcam::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one buffered shot against a run file.
    Shot {
        #[arg(long)]
        run_file: PathBuf,
        /// Device group to read (defaults to worker.device_name).
        #[arg(long)]
        device: Option<String>,
        /// Reprogram every attribute.
        #[arg(long)]
        fresh: bool,
        /// Interval between simulated external triggers.
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration, default_value = "10ms")]
        trigger_interval: Duration,
    },
    /// Take a single image and print its statistics.
    Snap,
    /// Load and validate the configuration.
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init(&config.application.log_level);

    match cli.command {
        Command::CheckConfig => {
            println!(
                "{}: {} worker '{}' (mock: {})",
                cli.config.display(),
                config.worker.kind,
                config.worker.device_name,
                config.worker.mock
            );
            Ok(())
        }
        Command::Snap => {
            let (mut worker, trigger) = mock_worker(config)?;
            if let Some(probe) = &trigger {
                probe.trigger();
            }
            let frames = worker.snap()?;
            let max = frames.iter().copied().max().unwrap_or(0);
            println!("shape {:?}, max {}", frames.shape(), max);
            worker.shutdown()?;
            Ok(())
        }
        Command::Shot {
            run_file,
            device,
            fresh,
            trigger_interval,
        } => {
            let (mut worker, trigger) = mock_worker(config)?;
            let device = device.unwrap_or_else(|| worker.device_name().to_string());

            worker.transition_to_buffered(&device, &run_file, &BTreeMap::new(), fresh)?;
            let stop = Arc::new(AtomicBool::new(false));
            let triggers = trigger.map(|probe| {
                let stop = stop.clone();
                thread::Builder::new()
                    .name("trigger".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::SeqCst) {
                            probe.trigger();
                            thread::sleep(trigger_interval);
                        }
                    })
            });
            let triggers = match triggers.transpose() {
                Ok(triggers) => triggers,
                Err(err) => {
                    worker.abort_buffered()?;
                    return Err(err).context("Failed to start trigger thread");
                }
            };

            let result = worker.transition_to_manual();
            stop_triggers(&stop, triggers);
            result?;

            info!("Shot complete: {}", run_file.display());
            worker.shutdown()?;
            Ok(())
        }
    }
}

/// Stop the trigger thread and wait for it. Returns whether it ended cleanly.
fn stop_triggers(stop: &AtomicBool, triggers: Option<JoinHandle<()>>) -> bool {
    stop.store(true, Ordering::SeqCst);
    match triggers.map(JoinHandle::join) {
        Some(Err(_)) => {
            error!("Trigger thread panicked; the shot may have missed triggers");
            false
        }
        _ => true,
    }
}

/// Worker on the simulated camera, plus its probe when it waits for triggers.
fn mock_worker(config: WorkerConfig) -> Result<(CameraWorker, Option<labcam::mock::MockProbe>)> {
    anyhow::ensure!(
        config.worker.mock,
        "no vendor SDK binding is built in; set worker.mock = true"
    );
    let sdk = MockSdk::new(config.mock.clone());
    let probe = config.mock.external_trigger.then(|| sdk.probe());
    let actions = ActionRunner::new(config.worker.device_name.clone(), config.actions.clone());
    let engine = AcquisitionEngine::new(Box::new(sdk)).with_actions(actions);
    Ok((CameraWorker::with_engine(config, engine)?, probe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_triggers_ends_loop() {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        assert!(stop_triggers(&stop, Some(handle)));
        assert!(stop_triggers(&stop, None));
    }

    #[test]
    fn test_stop_triggers_reports_panicked_thread() {
        let stop = AtomicBool::new(false);
        let handle = thread::spawn(|| panic!("trigger line lost"));

        assert!(!stop_triggers(&stop, Some(handle)));
        assert!(stop.load(Ordering::SeqCst));
    }
}
