//! epdtrial - Repeatable image trials for e-paper and other display panels
//!
//! Main entry point for the command-line runner.
//!
//! # Overview
//!
//! The binary reads its settings and the trial to run from `Trial Data/`, shows every
//! image on the configured display and prints a summary. It initializes:
//! - Logging infrastructure (daily file rotation + optional console output)
//! - Tokio async runtime (run loop, chunked delays, blocking panel I/O)
//! - Configuration loading ([`ConfigManager`])
//! - The [`TestController`] with a console progress observer
//!
//! # Execution Flow
//!
//! 1. Load `Trial Settings.yaml` (defaults when missing)
//! 2. Initialize logging → logs/epdtrial.<date>
//! 3. Create the tokio runtime
//! 4. Load `Trial Run.yaml` (or the legacy `Trial Run.json`)
//! 5. Initialize the controller. No panel driver is linked into this binary, so a
//!    hardware display falls back to the virtual one.
//! 6. Run the trial; Ctrl-C requests a stop and the partial result is reported
//! 7. Clean up and log the metrics summary
//!
//! # Configuration Files
//!
//! Expected in `Trial Data/` directory:
//! - `Trial Settings.yaml`: display, controller and logging settings
//! - `Trial Run.yaml`: image paths, delay, repetitions and transformations. Relative
//!   image paths resolve against `Trial Data/`.

use anyhow::{Context, Result};
use epdtrial::models::{RunContext, RunState};
use epdtrial::services::{
    FileImageSource, create_display, create_transform_pipeline, unavailable_panel,
};
use epdtrial::{APP_NAME, ConfigManager, RunResult, TestController, VERSION};
use std::sync::Mutex;

const DATA_DIR: &str = "Trial Data";

fn main() -> Result<()> {
    let config_manager = ConfigManager::new(DATA_DIR)?;
    let settings = config_manager.load_settings()?;

    // Keep the guard alive until exit so buffered log lines are flushed
    let _log_guard = epdtrial::logging::setup_logging(&settings.logging)?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("epdtrial-worker")
        .build()
        .context("Failed to build tokio runtime")?;

    let run_config = config_manager.load_run_config()?;

    let controller = TestController::new(
        FileImageSource::with_base_dir(config_manager.config_dir().to_path_buf()),
        settings.controller.clone(),
    );
    controller.register_observer(console_progress());

    let display_settings = settings.display.clone();
    let result = runtime.block_on(async {
        let initialized = controller
            .initialize(
                move || create_display(&display_settings, unavailable_panel),
                create_transform_pipeline,
            )
            .await;
        if !initialized {
            let error = controller
                .context()
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            anyhow::bail!("Controller initialization failed: {}", error);
        }

        let run = controller.run_test(&run_config);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping test...");
                controller.stop_test().await;
                run.await
            }
        };

        controller.cleanup().await;
        Ok(result)
    });

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{:#}", e);
            controller.metrics().log_summary();
            return Err(e);
        }
    };

    print_summary(&result);
    controller.metrics().log_summary();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Prints a line to stdout whenever the status text or state changes
fn console_progress() -> impl Fn(RunState, &RunContext) + Send + Sync {
    let last = Mutex::new((RunState::NotStarted, String::new()));

    move |state: RunState, context: &RunContext| {
        let mut last = last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if last.0 == state && last.1 == context.status {
            return;
        }
        *last = (state, context.status.clone());

        if state.is_active() {
            println!(
                "[{:>5.1}%] {}",
                context.progress * 100.0,
                context.status
            );
        } else {
            println!("[{}] {}", state, context.status);
        }
    }
}

fn print_summary(result: &RunResult) {
    println!();
    println!("{}", result.summary());

    for item in result.item_results.iter().filter(|item| !item.success) {
        println!(
            "  FAILED {}: {}",
            item.path,
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
}
