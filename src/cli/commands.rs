//! Subcommand handlers for list-devices, run and config actions.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use super::args::{ConfigAction, RunArgs};
use crate::camera::{CameraDriver, DeviceCatalog, PixelFormat, SessionLifecycle};
use crate::config::{self, Config};
use crate::detection::PipelineEvent;
use crate::sim::{CoverClassifier, SimulatedDriver};

/// Brightness of an uncovered simulated lens.
const OPEN_LUMA: u8 = 200;
/// Brightness of a covered simulated lens.
const COVERED_LUMA: u8 = 15;
/// How long the simulated lens stays in each state.
const SCENE_PERIOD: Duration = Duration::from_secs(2);

/// List available cameras and print them to stdout.
pub fn list_devices(driver: Arc<dyn CameraDriver>) {
    let devices = DeviceCatalog::new(driver).list_devices();
    if devices.is_empty() {
        println!("No cameras found.");
    } else {
        println!("Available cameras:");
        for device in devices {
            println!("  {}", device);
        }
        println!();
        println!("Use --device <id> to select a camera.");
    }
}

/// Handle config subcommand actions.
pub fn handle_config_action(
    action: ConfigAction,
    config_path: Option<&Path>,
) -> Result<(), config::ConfigError> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_path);

    match action {
        ConfigAction::Show => {
            let config = Config::load(Some(&path))?;
            println!("Current configuration:");
            println!("  Device: {}", config.camera.device);
            println!("  Pixel format: {}", config.camera.pixel_format);
            println!("  Required tier: {}", config.camera.required_tier);
            println!("  Threshold: {}%", config.detection.threshold);
            println!();
            if path.exists() {
                println!("Config file: {} (exists)", path.display());
            } else {
                println!("Config file: {} (not found)", path.display());
            }
        }
        ConfigAction::Init => {
            config::write_default(&path)?;
            println!("Created config file: {}", path.display());
        }
    }
    Ok(())
}

/// One-line description of an event for the terminal.
fn status_line(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::Detection(d) if d.blocked => {
            format!("Blocked: {} ({}%)", d.label, d.probability)
        }
        PipelineEvent::Detection(d) => {
            format!("Almost blocked: {} ({}%)", d.label, d.probability)
        }
        PipelineEvent::NoDetection => "Clear".to_string(),
        PipelineEvent::OrientationChanged(degrees) => format!("Orientation: {} degrees", degrees),
        PipelineEvent::Error(e) => format!("Error: {}", e),
    }
}

/// Run the detection pipeline against the simulated camera until the time
/// limit, Ctrl+C or a fatal camera error.
pub async fn run(args: RunArgs, config_path: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let config = Config::load(config_path)?;
    let mut options = config.lifecycle_options();
    if let Some(pct) = args.threshold {
        options.threshold = f32::from(pct) / 100.0;
    }
    if let Some(tier) = args.min_tier {
        options.required_tier = tier.into();
    }
    let device = args.device.unwrap_or(config.camera.device);
    let format: PixelFormat = args
        .format
        .map(Into::into)
        .unwrap_or(config.camera.pixel_format);

    let driver = Arc::new(SimulatedDriver::new());
    let (lifecycle, mut events) = SessionLifecycle::new(
        driver.clone(),
        Arc::new(CoverClassifier::default()),
        options,
    )?;

    let interrupted = Arc::new(Notify::new());
    let notify = Arc::clone(&interrupted);
    ctrlc::set_handler(move || notify.notify_one())?;

    let size = lifecycle.start(&device, format, Vec::new()).await?;
    println!(
        "Watching camera {} at {} {} (threshold {:.0}%). Press Ctrl+C to stop.",
        device,
        size,
        format,
        options.threshold * 100.0
    );
    lifecycle.on_device_orientation(0);

    // Alternate between an open and a covered lens.
    let scene_driver = Arc::clone(&driver);
    let scene = tokio::spawn(async move {
        let mut covered = false;
        loop {
            tokio::time::sleep(SCENE_PERIOD).await;
            covered = !covered;
            scene_driver.set_luma(if covered { COVERED_LUMA } else { OPEN_LUMA });
        }
    });

    let limit = args.seconds.map(Duration::from_secs);
    let timeout = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timeout);

    let mut last_status: Option<String> = None;
    let mut failure = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let line = status_line(&event);
                if last_status.as_deref() != Some(line.as_str()) {
                    println!("{}", line);
                    last_status = Some(line);
                }
                if let PipelineEvent::Error(e) = event {
                    failure = Some(e);
                    break;
                }
            }
            _ = &mut timeout => break,
            _ = interrupted.notified() => {
                println!();
                break;
            }
        }
    }

    scene.abort();
    lifecycle.stop();
    if let Some(stats) = lifecycle.gate_stats() {
        println!(
            "Classified {} frame(s), skipped {} while busy.",
            stats.classified, stats.dropped
        );
    }

    let workers = lifecycle.workers().clone();
    let drained =
        tokio::task::spawn_blocking(move || workers.await_termination(Duration::from_secs(2)))
            .await?;
    if !drained {
        log::warn!("Camera workers did not stop in time");
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
