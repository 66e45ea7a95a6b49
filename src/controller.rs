// Test controller - runs display trials
//
// This module contains the TestController which coordinates between:
// - StateMachine (run lifecycle and progress, observer fan-out)
// - ImageSource (loading images)
// - TransformationPipeline (per-run transforms)
// - DisplayAdapter (showing the result)
//
// Image work runs on the blocking pool since panel I/O blocks. Stop and pause
// requests travel over watch channels and are raced against the inter-image
// delay with tokio::select!.

use crate::metrics::Metrics;
use crate::models::{
    ConfigError, ControllerSettings, ItemResult, RunConfig, RunContext, RunResult, RunState,
    TransformSpec,
};
use crate::services::display::{DisplayAdapter, DisplayKind};
use crate::services::image_source::{ImageLoadError, ImageSource};
use crate::services::transform::TransformationPipeline;
use crate::state::observers::panic_message;
use crate::state::{ContextUpdate, ObserverId, StateError, StateEvent, StateMachine, StateObserver};
use camino::Utf8Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;

/// Reasons a run could not go ahead
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Test already running")]
    AlreadyRunning,

    #[error("Controller not initialized")]
    NotInitialized,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Why a single image failed; recorded in its [`ItemResult`]
#[derive(Error, Debug)]
pub enum ItemError {
    #[error(transparent)]
    Load(#[from] ImageLoadError),

    #[error("Display did not accept the image")]
    RenderFailed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Processing panicked: {0}")]
    Panicked(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

type SharedDisplay = Arc<Mutex<Box<dyn DisplayAdapter>>>;

/// Display and pipeline built by `initialize`
#[derive(Clone)]
struct RunResources {
    display: SharedDisplay,
    pipeline: Arc<TransformationPipeline>,
}

/// Runs display trials: one image sequence at a time, with progress reporting
///
/// Lifecycle:
/// 1. [`initialize()`](Self::initialize) builds the display and pipeline
/// 2. [`run_test()`](Self::run_test) shows every image of a [`RunConfig`]
/// 3. [`stop_test()`](Self::stop_test), [`pause_test()`](Self::pause_test) and
///    [`resume_test()`](Self::resume_test) steer a run from another task
/// 4. [`cleanup()`](Self::cleanup) releases the display
///
/// Only one run may be in flight; a second `run_test` is rejected without
/// disturbing the first.
///
/// # Example
/// ```ignore
/// let controller = TestController::new(FileImageSource::new(), settings.controller.clone());
/// controller
///     .initialize(move || create_display(&display, unavailable_panel), create_transform_pipeline)
///     .await;
/// let result = controller.run_test(&run_config).await;
/// controller.cleanup().await;
/// ```
pub struct TestController {
    machine: Arc<StateMachine>,
    resources: Mutex<Option<RunResources>>,
    images: Arc<dyn ImageSource>,
    settings: ControllerSettings,

    /// Held for the whole of a run (and of initialize/cleanup)
    run_guard: tokio::sync::Mutex<()>,

    /// Send `true` to request the active run to stop
    cancel_tx: watch::Sender<bool>,

    /// `true` while a pause is requested
    pause_tx: watch::Sender<bool>,

    metrics: Arc<Metrics>,
    last_result: Mutex<Option<RunResult>>,
}

impl TestController {
    pub fn new(images: impl ImageSource + 'static, settings: ControllerSettings) -> Self {
        Self::with_metrics(images, settings, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(
        images: impl ImageSource + 'static,
        settings: ControllerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let machine = Arc::new(StateMachine::with_metrics(metrics.clone()));
        if let Err(e) = machine.transition_to(RunState::Idle, ContextUpdate::new().status("Idle")) {
            tracing::error!("Controller could not enter idle state: {}", e);
        }

        let (cancel_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);

        Self {
            machine,
            resources: Mutex::new(None),
            images: Arc::new(images),
            settings,
            run_guard: tokio::sync::Mutex::new(()),
            cancel_tx,
            pause_tx,
            metrics,
            last_result: Mutex::new(None),
        }
    }

    /// Build the display and transformation pipeline and prepare the display.
    ///
    /// Returns true once initialized; calling again afterwards is a no-op that
    /// also returns true. A factory that panics or a display that fails to
    /// prepare leaves the controller in `Failed`.
    pub async fn initialize<D, T>(&self, display_factory: D, transform_factory: T) -> bool
    where
        D: FnOnce() -> Box<dyn DisplayAdapter> + Send + 'static,
        T: FnOnce() -> TransformationPipeline + Send + 'static,
    {
        if self.is_initialized() {
            tracing::debug!("Controller already initialized");
            return true;
        }

        let Ok(_guard) = self.run_guard.try_lock() else {
            tracing::warn!("Cannot initialize while the controller is busy");
            return false;
        };

        let setup = ContextUpdate::new().status("Initializing...").clear_error();
        if let Err(e) = self.enter_setup(setup) {
            tracing::error!("Initialization refused: {}", e);
            return false;
        }

        let built = tokio::task::spawn_blocking(move || {
            let mut display = display_factory();
            display.prepare()?;
            let pipeline = transform_factory();
            Ok::<_, crate::services::display::DisplayError>((display, pipeline))
        })
        .await;

        let failure = match built {
            Ok(Ok((adapter, pipeline))) => {
                let (kind, (width, height)) = (adapter.kind(), adapter.dimensions());
                tracing::info!(
                    "Controller initialized with {} display {}x{}",
                    kind,
                    width,
                    height
                );
                *lock(&self.resources) = Some(RunResources {
                    display: Arc::new(Mutex::new(adapter)),
                    pipeline: Arc::new(pipeline),
                });
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(join_failure(e).to_string()),
        };

        self.clear_requests();
        match failure {
            None => self.transition_logged(RunState::Ready, ContextUpdate::new().status("Ready")),
            Some(error) => {
                tracing::error!("Initialization error: {}", error);
                self.transition_logged(
                    RunState::Failed,
                    ContextUpdate::new()
                        .status("Initialization failed")
                        .error(error),
                );
                false
            }
        }
    }

    /// Show every image of `config`, in order, and report the outcome.
    ///
    /// Per-image failures are recorded and the run carries on. The returned
    /// result is unsuccessful only if the run could not start or was stopped.
    pub async fn run_test(&self, config: &RunConfig) -> RunResult {
        let Ok(_guard) = self.run_guard.try_lock() else {
            return self.reject(RunError::AlreadyRunning);
        };
        let Some(resources) = lock(&self.resources).clone() else {
            return self.reject(RunError::NotInitialized);
        };

        let outcome = self.execute(config, &resources).await;
        self.clear_requests();

        let result = match outcome {
            Ok(result) => result,
            Err(RunError::Config(e)) => {
                tracing::warn!("Test configuration rejected: {}", e);
                self.metrics.record_run_rejected();
                self.transition_logged(
                    RunState::Failed,
                    ContextUpdate::new()
                        .status(format!("Error: {}", e))
                        .error(e.to_string()),
                );
                RunResult::rejected(e)
            }
            Err(e) => {
                tracing::error!("Test execution error: {}", e);
                self.transition_logged(
                    RunState::Error,
                    ContextUpdate::new()
                        .status(format!("Error: {}", e))
                        .error(e.to_string()),
                );
                RunResult::rejected(e)
            }
        };

        *lock(&self.last_result) = Some(result.clone());
        result
    }

    /// Ask the active run to stop, then give it `stop_grace` to notice.
    ///
    /// Returns false if nothing is running.
    pub async fn stop_test(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        tracing::info!("Stop requested");
        self.cancel_tx.send_replace(true);
        tokio::time::sleep(self.settings.stop_grace).await;
        true
    }

    /// Park the active run before its next image
    pub fn pause_test(&self) -> bool {
        if !self.is_running() || *self.pause_tx.borrow() {
            return false;
        }
        tracing::info!("Pause requested");
        self.pause_tx.send_replace(true);
        true
    }

    pub fn resume_test(&self) -> bool {
        if !self.is_running() || !*self.pause_tx.borrow() {
            return false;
        }
        tracing::info!("Resume requested");
        self.pause_tx.send_replace(false);
        true
    }

    /// Stop any run, wait for it to finish, release the display and return to `Idle`
    pub async fn cleanup(&self) -> bool {
        if self.is_running() {
            self.stop_test().await;
        }
        let _guard = self.run_guard.lock().await;
        self.clear_requests();

        let mut released = true;
        let resources = lock(&self.resources).take();
        if let Some(resources) = resources {
            let display = resources.display;
            let outcome = tokio::task::spawn_blocking(move || lock(&*display).release()).await;
            if let Err(e) = outcome {
                tracing::error!("Error releasing display: {}", join_failure(e));
                released = false;
            }
        }

        if self.machine.state() != RunState::Idle {
            self.transition_logged(
                RunState::Idle,
                ContextUpdate::new().status("Cleaned up").clear_current_item(),
            );
        }

        tracing::info!("Controller cleaned up");
        released
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    pub fn context(&self) -> RunContext {
        self.machine.context()
    }

    /// Observer called right away with the current state, then on every change
    pub fn register_observer(&self, observer: impl StateObserver + 'static) -> ObserverId {
        self.machine.register_observer(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.machine.unregister_observer(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.machine.subscribe()
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Result of the most recent run, including one refused for its configuration
    pub fn last_result(&self) -> Option<RunResult> {
        lock(&self.last_result).clone()
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.resources).is_some()
    }

    pub fn display_kind(&self) -> Option<DisplayKind> {
        let resources = lock(&self.resources).clone()?;
        let kind = lock(&*resources.display).kind();
        Some(kind)
    }

    async fn execute(
        &self,
        config: &RunConfig,
        resources: &RunResources,
    ) -> Result<RunResult, RunError> {
        self.machine.reset_context();
        self.enter_setup(ContextUpdate::new().status("Starting test"))?;
        config.validate()?;

        let paths = config.expanded_image_paths();
        let specs = Arc::new(config.transform_specs());
        let total = paths.len();
        let delay = config.delay_between_images;

        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut pause_rx = self.pause_tx.subscribe();

        self.machine.transition_to(
            RunState::Running,
            ContextUpdate::new()
                .progress(0.0)
                .total_images(total)
                .processed_images(0)
                .status(format!("Running {} images", total)),
        )?;
        tracing::info!(
            "Starting test: {} images ({} x{}), {} transforms, {:.2}s delay",
            total,
            config.image_paths.len(),
            config.repetitions,
            specs.len(),
            delay.as_secs_f64()
        );

        let started = Instant::now();
        let mut items = Vec::with_capacity(total);

        for (i, path) in paths.iter().enumerate() {
            if !self.checkpoint(&mut cancel_rx, &mut pause_rx).await? {
                return self.finish_stopped(total, items, started);
            }

            self.machine.update_context(
                ContextUpdate::new()
                    .progress(i as f64 / total as f64)
                    .processed_images(i)
                    .current_item(path.as_str())
                    .status(format!(
                        "Processing image {}/{}: {}",
                        i + 1,
                        total,
                        path.file_name().unwrap_or(path.as_str())
                    )),
            );

            let item = self.process_item(resources, path, specs.clone()).await;
            self.metrics.record_item(item.success, item.processing_time);
            items.push(item);

            if i + 1 < total && !delay.is_zero() {
                self.wait_between(i, total, delay, &mut cancel_rx).await;
            }
        }

        let result = RunResult::completed(total, items, started.elapsed());
        self.machine.transition_to(
            RunState::Completed,
            ContextUpdate::new()
                .progress(1.0)
                .processed_images(total)
                .clear_current_item()
                .status("Test completed successfully"),
        )?;
        self.metrics.record_run_completed();
        tracing::info!("Test completed: {}", result.summary());
        Ok(result)
    }

    /// Pause point before each image. Returns false when the run must stop.
    async fn checkpoint(
        &self,
        cancel_rx: &mut watch::Receiver<bool>,
        pause_rx: &mut watch::Receiver<bool>,
    ) -> Result<bool, RunError> {
        if *cancel_rx.borrow() {
            return Ok(false);
        }
        if !*pause_rx.borrow() {
            return Ok(true);
        }

        self.machine
            .transition_to(RunState::Paused, ContextUpdate::new().status("Paused"))?;
        tracing::info!("Test paused");

        loop {
            tokio::select! {
                _ = pause_rx.changed() => {
                    if !*pause_rx.borrow() {
                        break;
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        return Ok(false);
                    }
                }
            }
        }

        self.machine
            .transition_to(RunState::Running, ContextUpdate::new().status("Resumed"))?;
        tracing::info!("Test resumed");
        Ok(!*cancel_rx.borrow())
    }

    /// Sleep `delay` in slices, reporting progress and waking early on stop
    async fn wait_between(
        &self,
        index: usize,
        total: usize,
        delay: Duration,
        cancel_rx: &mut watch::Receiver<bool>,
    ) {
        let total_f = total as f64;
        self.machine.update_context(
            ContextUpdate::new()
                .progress((index as f64 + 0.5) / total_f)
                .status(format!("Waiting ({:.1}s)...", delay.as_secs_f64())),
        );

        let max_chunks = self.settings.max_delay_chunks.max(1);
        let chunks = ((delay.as_secs_f64() * 2.0) as u32).clamp(1, max_chunks);
        let slice = delay / chunks;

        for j in 0..chunks {
            if *cancel_rx.borrow() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        return;
                    }
                }
            }

            let fraction = 0.5 + 0.5 * (j + 1) as f64 / chunks as f64;
            self.machine.update_context(
                ContextUpdate::new().progress((index as f64 + fraction) / total_f),
            );
        }
    }

    async fn process_item(
        &self,
        resources: &RunResources,
        path: &Utf8Path,
        specs: Arc<Vec<TransformSpec>>,
    ) -> ItemResult {
        let started = Instant::now();

        let images = self.images.clone();
        let display = resources.display.clone();
        let pipeline = resources.pipeline.clone();
        let owned_path = path.to_path_buf();

        let task = tokio::task::spawn_blocking(move || -> Result<(), ItemError> {
            let image = images.load(&owned_path)?;
            let transformed = pipeline.apply(image, &specs);
            if lock(&*display).render(&transformed) {
                Ok(())
            } else {
                Err(ItemError::RenderFailed)
            }
        });

        let outcome = match self.settings.render_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => flatten(joined),
                Err(_) => Err(ItemError::Timeout(limit)),
            },
            None => flatten(task.await),
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                tracing::debug!("Displayed {} in {:?}", path, elapsed);
                ItemResult::succeeded(path, elapsed)
            }
            Err(e) => {
                tracing::error!("Failed to process image {}: {}", path, e);
                ItemResult::failed(path, e, elapsed)
            }
        }
    }

    fn finish_stopped(
        &self,
        total: usize,
        items: Vec<ItemResult>,
        started: Instant,
    ) -> Result<RunResult, RunError> {
        let done = items.len();
        self.machine.transition_to(
            RunState::Stopped,
            ContextUpdate::new()
                .progress(done as f64 / total as f64)
                .processed_images(done)
                .status("Test stopped by user"),
        )?;
        self.metrics.record_run_cancelled();

        let result = RunResult::cancelled(total, items, started.elapsed());
        tracing::info!("{}", result.summary());
        Ok(result)
    }

    /// Walk to `Initializing` from wherever the last run or init left off
    /// Drop stop and pause requests; callers hold the run guard
    fn clear_requests(&self) {
        self.cancel_tx.send_replace(false);
        self.pause_tx.send_replace(false);
    }

    fn enter_setup(&self, update: ContextUpdate) -> Result<(), StateError> {
        if self.machine.state() != RunState::Idle {
            self.machine.transition_to(RunState::Idle, ContextUpdate::new())?;
        }
        self.machine.transition_to(RunState::Initializing, update)
    }

    fn reject(&self, error: RunError) -> RunResult {
        tracing::warn!("Test rejected: {}", error);
        self.metrics.record_run_rejected();
        RunResult::rejected(error)
    }

    /// Transition whose failure is only worth a log line; returns whether it happened
    fn transition_logged(&self, target: RunState, update: ContextUpdate) -> bool {
        match self.machine.transition_to(target, update) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }
}

fn flatten(joined: Result<Result<(), ItemError>, JoinError>) -> Result<(), ItemError> {
    joined.unwrap_or_else(|e| Err(join_failure(e)))
}

fn join_failure(error: JoinError) -> ItemError {
    if error.is_panic() {
        ItemError::Panicked(panic_message(error.into_panic().as_ref()))
    } else {
        ItemError::Worker(error.to_string())
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
