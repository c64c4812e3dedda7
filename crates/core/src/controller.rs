//! Execution controller: drives one [`Application`] through its lifecycle.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::app::Application;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::id::AppId;
use crate::state::{legal, require_state, validate_transition, AppState};

/// State shared between the caller and the monitor task.
struct Shared<O> {
    state: AppState,
    /// Harvested result, set exactly once when the monitor settles
    outcome: Option<Result<O>>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner<A: Application> {
    id: AppId,
    name: String,
    app: tokio::sync::Mutex<A>,
    shared: Mutex<Shared<A::Output>>,
    /// Mirrors `shared.state`; only written while `shared` is locked
    state_tx: watch::Sender<AppState>,
    app_released: AtomicBool,
}

impl<A: Application> Inner<A> {
    fn lock(&self) -> MutexGuard<'_, Shared<A::Output>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, shared: &mut Shared<A::Output>, to: AppState) -> Result<()> {
        validate_transition(shared.state, to)?;
        debug!(app = %self.id, "{} -> {}", shared.state, to);
        shared.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// Settle a running application with the monitor's result.
    ///
    /// Returns `false` when a cancellation got there first; the result is
    /// then dropped.
    fn settle(&self, outcome: Result<A::Output>) -> bool {
        let mut shared = self.lock();
        if shared.state != AppState::Running {
            debug!(
                app = %self.id,
                "Discarding monitor result, application is already {}", shared.state
            );
            return false;
        }

        let to = if outcome.is_ok() {
            AppState::Finished
        } else {
            AppState::Failed
        };
        shared.outcome = Some(outcome);
        match self.transition(&mut shared, to) {
            Ok(()) => true,
            Err(err) => {
                error!(app = %self.id, "Failed to settle application: {}", err);
                false
            }
        }
    }

    /// Run the application's clean-up hook, at most once per controller.
    async fn release(&self, app: &mut A) {
        if self.app_released.swap(true, Ordering::AcqRel) {
            return;
        }
        app.clean_up().await;
        debug!(app = %self.id, "Application resources released");
    }

    async fn release_app(&self) {
        if self.app_released.load(Ordering::Acquire) {
            return;
        }
        let mut app = self.app.lock().await;
        self.release(&mut app).await;
    }
}

/// Lifecycle controller for a single run of an [`Application`].
///
/// ```text
/// let controller = Controller::new(app);
/// controller.start().await?;
/// let output = controller.join(Some(Duration::from_secs(30))).await?;
/// ```
///
/// All operations take `&self`, so a controller can be shared through an
/// `Arc` to cancel from one task while another is blocked in `join`.
/// A controller is single use. Dropping it while the application is still
/// running stops the monitor but does not run the application's clean-up.
pub struct Controller<A: Application> {
    inner: Arc<Inner<A>>,
    token: CancellationToken,
    config: ControllerConfig,
}

impl<A: Application> Controller<A> {
    /// Wrap an application; the controller starts in [`AppState::Created`].
    pub fn new(app: A) -> Self {
        let (state_tx, _) = watch::channel(AppState::Created);
        let inner = Inner {
            id: AppId::new(),
            name: app.name().to_string(),
            app: tokio::sync::Mutex::new(app),
            shared: Mutex::new(Shared {
                state: AppState::Created,
                outcome: None,
                monitor: None,
            }),
            state_tx,
            app_released: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
            token: CancellationToken::new(),
            config: ControllerConfig::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Identifier used in logs.
    pub fn id(&self) -> AppId {
        self.inner.id
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state. Never blocks on the application.
    pub fn get_app_state(&self) -> AppState {
        self.inner.lock().state
    }

    /// Launch the application and start monitoring it.
    ///
    /// Legal only in [`AppState::Created`]. If the launch hook fails the
    /// error is returned and the controller is left [`AppState::Failed`].
    pub async fn start(&self) -> Result<()> {
        require_state("start", self.get_app_state(), legal::START)?;

        // Held from the transition through `run()`, so a concurrent
        // cancel can only release the application after the launch hook.
        let mut app = self.inner.app.lock().await;
        {
            let mut shared = self.inner.lock();
            require_state("start", shared.state, legal::START)?;
            self.inner.transition(&mut shared, AppState::Running)?;
        }

        info!(app = %self.inner.id, name = %self.inner.name, "Starting application");

        if let Err(err) = app.run().await {
            error!(app = %self.inner.id, "Application failed to launch: {:#}", err);
            self.inner.release(&mut app).await;
            drop(app);
            {
                let mut shared = self.inner.lock();
                if shared.state == AppState::Running {
                    self.inner.transition(&mut shared, AppState::Failed)?;
                }
            }
            self.clean_up();
            return Err(ControllerError::Launch(err));
        }
        drop(app);

        let mut shared = self.inner.lock();
        if shared.state != AppState::Running {
            // Cancelled while the launch hook was running.
            debug!(app = %self.inner.id, "Not monitoring, application is {}", shared.state);
            return Ok(());
        }
        shared.monitor = Some(self.spawn_monitor());
        Ok(())
    }

    /// Wait for the application to finish and harvest its output.
    ///
    /// Legal in [`AppState::Running`], [`AppState::Finished`] and
    /// [`AppState::Failed`]. Without a timeout (and without a configured
    /// default) this waits indefinitely. On timeout the application keeps
    /// running and `join` may be called again.
    pub async fn join(&self, timeout: Option<Duration>) -> Result<A::Output> {
        {
            let shared = self.inner.lock();
            require_state("join", shared.state, legal::JOIN)?;
        }

        let mut rx = self.inner.state_tx.subscribe();
        match timeout.or(self.config.default_join_timeout) {
            Some(limit) => {
                if tokio::time::timeout(limit, wait_settled(&mut rx)).await.is_err() {
                    warn!(app = %self.inner.id, "Application still running after {:?}", limit);
                    if self.config.cancel_on_timeout {
                        return self.cancel_after_timeout(limit).await;
                    }
                    return Err(ControllerError::Timeout(limit));
                }
            }
            None => wait_settled(&mut rx).await,
        }

        self.harvest().await
    }

    /// Cancel a join that timed out. If the monitor settled in the
    /// meantime the cancel is rejected and the outcome is harvested instead.
    async fn cancel_after_timeout(&self, limit: Duration) -> Result<A::Output> {
        match self.cancel().await {
            Err(ControllerError::InvalidState {
                actual: AppState::Finished | AppState::Failed,
                ..
            }) => {
                debug!(app = %self.inner.id, "Settled while timing out, harvesting");
                self.harvest().await
            }
            Err(err) => {
                debug!(app = %self.inner.id, "Cancel after timeout skipped: {}", err);
                Err(ControllerError::Timeout(limit))
            }
            Ok(()) => Err(ControllerError::Timeout(limit)),
        }
    }

    async fn harvest(&self) -> Result<A::Output> {
        let outcome = {
            let mut shared = self.inner.lock();
            match (shared.state, shared.outcome.take()) {
                (AppState::Finished, Some(Ok(output))) => {
                    self.inner.transition(&mut shared, AppState::Joined)?;
                    Ok(output)
                }
                (AppState::Failed, Some(Err(err))) => Err(err),
                (actual, taken) => {
                    shared.outcome = taken;
                    Err(ControllerError::InvalidState {
                        operation: "join",
                        required: legal::JOIN,
                        actual,
                    })
                }
            }
        };

        if self.get_app_state().is_terminal() {
            self.inner.release_app().await;
            self.clean_up();
        }

        match &outcome {
            Ok(_) => info!(app = %self.inner.id, "Application joined"),
            Err(err) => warn!(app = %self.inner.id, "Join failed: {}", err),
        }
        outcome
    }

    /// Abort the application.
    ///
    /// Legal in [`AppState::Created`] and [`AppState::Running`]. Returns once
    /// the monitor has stopped and the application's clean-up hook ran.
    pub async fn cancel(&self) -> Result<()> {
        let monitor = {
            let mut shared = self.inner.lock();
            require_state("cancel", shared.state, legal::CANCEL)?;
            self.inner.transition(&mut shared, AppState::Cancelled)?;
            shared.monitor.take()
        };

        info!(app = %self.inner.id, "Cancelling application");
        self.token.cancel();

        if let Some(handle) = monitor {
            if let Err(err) = handle.await {
                warn!(app = %self.inner.id, "Monitor ended abnormally: {}", err);
            }
        }

        self.inner.release_app().await;
        self.clean_up();
        Ok(())
    }

    /// Release controller-held resources once the application has settled.
    ///
    /// Idempotent; does nothing while the application is created or running.
    pub fn clean_up(&self) {
        let monitor = {
            let mut shared = self.inner.lock();
            if !shared.state.is_settled() {
                debug!(app = %self.inner.id, "Skipping clean up, application is {}", shared.state);
                return;
            }
            shared.monitor.take()
        };

        self.token.cancel();
        if let Some(handle) = monitor {
            handle.abort();
        }
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let token = self.token.clone();
        let span = info_span!("monitor", app = %inner.id, name = %inner.name);

        tokio::spawn(
            async move {
                let polling = AssertUnwindSafe(monitor(Arc::clone(&inner), token));
                if let Err(panic) = polling.catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    error!("Monitor panicked: {}", message);
                    inner.release_app().await;
                    inner.settle(Err(ControllerError::MonitorPanicked(message)));
                }
            }
            .instrument(span),
        )
    }
}

impl<A: Application> Drop for Controller<A> {
    fn drop(&mut self) {
        let state = self.inner.lock().state;
        if state == AppState::Running {
            warn!(app = %self.inner.id, "Controller dropped while application is running");
        }
        self.token.cancel();
    }
}

impl<A: Application> std::fmt::Debug for Controller<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.get_app_state())
            .finish()
    }
}

/// Poll the application until it finishes, fails or is cancelled.
async fn monitor<A: Application>(inner: Arc<Inner<A>>, token: CancellationToken) {
    let mut polls: u64 = 0;

    loop {
        let interval = inner.app.lock().await.wait_interval();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Monitor stopped after {} polls", polls);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let mut app = inner.app.lock().await;
        if token.is_cancelled() {
            debug!("Monitor stopped after {} polls", polls);
            return;
        }

        polls += 1;
        match app.is_finished().await {
            Ok(false) => {
                debug!("Poll {}: still running", polls);
                continue;
            }
            Ok(true) => {}
            Err(err) => {
                error!("Poll {} failed: {:#}", polls, err);
                inner.release(&mut app).await;
                drop(app);
                inner.settle(Err(ControllerError::Poll(err)));
                return;
            }
        }

        if token.is_cancelled() {
            debug!("Finished after cancellation, not evaluating");
            return;
        }

        debug!("Finished after {} polls, evaluating", polls);
        match app.evaluate().await {
            Ok(output) => {
                drop(app);
                if inner.settle(Ok(output)) {
                    info!("Application finished");
                }
            }
            Err(err) => {
                error!("Evaluation failed: {:#}", err);
                inner.release(&mut app).await;
                drop(app);
                inner.settle(Err(ControllerError::Evaluation(err)));
            }
        }
        return;
    }
}

/// Wait until the state leaves `Running`.
async fn wait_settled(rx: &mut watch::Receiver<AppState>) {
    // The sender lives as long as the controller, so this cannot fail
    // while `join` is borrowing it.
    let _ = rx.wait_for(|state| *state != AppState::Running).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
