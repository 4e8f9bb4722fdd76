use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use napwatch_process::{ActionResult, ContainerStatus, LifecycleState};
use tokio::sync::{Mutex, watch};

use crate::config::LifecycleConfig;
use crate::container::ContainerRuntime;
use crate::port_listener::{self, PortListener, PortRelease};
use crate::support::{format_error_chain, human_duration};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub manual_stop: bool,
    pub maintenance_active: bool,
    pub serving: bool,
    pub last_status: ContainerStatus,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    /// An operator (or a sleep) stopped the server on purpose.
    manual_stop: bool,
    maintenance_active: bool,
    serving: bool,
    last_status: ContainerStatus,
    /// Outcome of the start in flight, for callers that arrive while it runs.
    start_outcome: Option<watch::Receiver<Option<ActionResult>>>,
}

/// Owns the lifecycle state of the game server container.
///
/// All transitions go through this type. `start` and `stop` are idempotent and
/// a second concurrent `start` waits for the first one and returns its result
/// instead of issuing its own container commands.
pub struct LifecycleController {
    runtime: Arc<dyn ContainerRuntime>,
    port: PortListener,
    cfg: LifecycleConfig,
    inner: Mutex<Inner>,
}

impl LifecycleController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cfg: LifecycleConfig) -> Self {
        Self {
            runtime,
            port: PortListener::new(cfg.force_release),
            cfg,
            inner: Mutex::new(Inner {
                state: LifecycleState::Stopped,
                manual_stop: false,
                maintenance_active: false,
                serving: false,
                last_status: ContainerStatus::unknown(),
                start_outcome: None,
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    async fn observe(&self) -> anyhow::Result<(bool, ContainerStatus)> {
        let status = self.runtime.status().await?;
        let serving = status.is_serving() && (!self.cfg.port_probe || port_listener::is_bound(self.cfg.port));
        Ok((serving, status))
    }

    /// Refreshes the cached observation and returns whether the server is
    /// serving. Inspect failures count as down.
    pub async fn check(&self) -> bool {
        let (serving, status) = match self.observe().await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %format_error_chain(&e), "container status unavailable");
                (false, ContainerStatus::unknown())
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.serving != serving {
            if serving {
                tracing::info!(status = %status, "server is up");
            } else if inner.state == LifecycleState::Running {
                tracing::warn!(status = %status, "server stopped unexpectedly");
            } else {
                tracing::info!(status = %status, "server is down");
            }
        }
        inner.serving = serving;
        inner.last_status = status;
        if !inner.state.is_transition() {
            inner.state = if serving {
                LifecycleState::Running
            } else {
                LifecycleState::Stopped
            };
        }
        serving
    }

    pub async fn start(&self) -> ActionResult {
        let observed = self.observe().await;
        let (initial, outcome) = {
            let mut inner = self.inner.lock().await;
            let state = inner.state;
            match state {
                LifecycleState::Starting => {
                    let pending = inner.start_outcome.clone();
                    drop(inner);
                    return match pending {
                        Some(rx) => join_start(rx).await,
                        None => ActionResult::failed("start already in progress"),
                    };
                }
                LifecycleState::Stopping => {
                    return ActionResult::failed("server is stopping; try again shortly");
                }
                LifecycleState::Running | LifecycleState::Stopped => {}
            }
            let initial = match observed {
                Ok((true, status)) => {
                    inner.state = LifecycleState::Running;
                    inner.serving = true;
                    inner.last_status = status;
                    return ActionResult::ok("server is already running");
                }
                Ok((false, status)) => status,
                Err(e) => {
                    tracing::warn!(error = %format_error_chain(&e), "container status unavailable before start");
                    ContainerStatus::unknown()
                }
            };
            let (tx, rx) = watch::channel(None);
            inner.state = LifecycleState::Starting;
            inner.manual_stop = false;
            inner.start_outcome = Some(rx);
            (initial, tx)
        };

        let result = self.run_start(&initial).await;

        {
            let mut inner = self.inner.lock().await;
            inner.state = if result.ok {
                LifecycleState::Running
            } else {
                LifecycleState::Stopped
            };
            inner.serving = result.ok;
            inner.start_outcome = None;
        }
        outcome.send_replace(Some(result.clone()));
        result
    }

    async fn run_start(&self, initial: &ContainerStatus) -> ActionResult {
        if self.port.release(self.cfg.port).await == PortRelease::Busy {
            tracing::warn!(port = self.cfg.port, "game port is held by another process");
        }

        // A container that runs but does not serve is wedged; restart it.
        let use_restart = initial.is_running();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let issued = if use_restart {
                self.runtime.restart().await
            } else {
                self.runtime.start().await
            };
            match issued {
                Ok(()) => break,
                Err(e) if attempt < self.cfg.start_retries => {
                    tracing::warn!(
                        attempt,
                        retries = self.cfg.start_retries,
                        error = %format_error_chain(&e),
                        "container start failed; retrying"
                    );
                    tokio::time::sleep(self.cfg.start_retry_delay).await;
                }
                Err(e) => {
                    let msg = format!("failed to start container: {}", format_error_chain(&e));
                    tracing::error!(attempt, "{msg}");
                    return ActionResult::failed(msg);
                }
            }
        }

        tracing::info!(restart = use_restart, "container start issued; waiting for server");
        match self
            .wait_for(|serving, _| serving, self.cfg.start_timeout)
            .await
        {
            Ok(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "server started");
                ActionResult::ok(format!("server is up after {}", human_duration(elapsed)))
            }
            Err(last) => {
                tracing::error!(status = %last, "server did not become ready; stopping container");
                if let Err(e) = self.runtime.stop().await {
                    tracing::warn!(error = %format_error_chain(&e), "stop after failed start also failed");
                }
                ActionResult::failed(format!(
                    "server did not come up within {} (last status: {last})",
                    human_duration(self.cfg.start_timeout)
                ))
            }
        }
    }

    pub async fn stop(&self) -> ActionResult {
        self.stop_with(false).await
    }

    /// Stops the server and leaves `manual_stop` at `hold`. The flag is
    /// written in the same critical section that publishes `Stopped`.
    pub async fn stop_with(&self, hold: bool) -> ActionResult {
        let prior = {
            let mut inner = self.inner.lock().await;
            let prior = inner.state;
            match prior {
                LifecycleState::Stopping => return ActionResult::ok("stop already in progress"),
                LifecycleState::Starting => {
                    return ActionResult::failed("server is starting; try again once it is up");
                }
                LifecycleState::Running | LifecycleState::Stopped => {}
            }
            inner.state = LifecycleState::Stopping;
            prior
        };

        let result = self.run_stop().await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(msg) => {
                inner.state = LifecycleState::Stopped;
                inner.serving = false;
                inner.manual_stop = hold;
                ActionResult::ok(msg)
            }
            Err((msg, still_running)) => {
                inner.state = match still_running {
                    Some(true) => LifecycleState::Running,
                    Some(false) => LifecycleState::Stopped,
                    None => prior,
                };
                ActionResult::failed(msg)
            }
        }
    }

    /// On failure also reports whether the container is still running, when
    /// that is known.
    async fn run_stop(&self) -> Result<String, (String, Option<bool>)> {
        let status = match self.runtime.status().await {
            Ok(s) => s,
            Err(e) => {
                let msg = format!("cannot inspect container: {}", format_error_chain(&e));
                tracing::error!("{msg}");
                return Err((msg, None));
            }
        };
        if !status.is_running() {
            self.port.release(self.cfg.port).await;
            return Ok("server is already stopped".to_string());
        }

        if let Err(e) = self.runtime.stop().await {
            let msg = format!("failed to stop container: {}", format_error_chain(&e));
            tracing::error!("{msg}");
            return Err((msg, Some(true)));
        }

        match self
            .wait_for(|_, status| !status.is_running(), self.cfg.stop_timeout)
            .await
        {
            Ok(elapsed) => {
                self.port.release(self.cfg.port).await;
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "server stopped");
                Ok("server stopped".to_string())
            }
            Err(last) => {
                let msg = format!(
                    "container still {} after {}",
                    last.state,
                    human_duration(self.cfg.stop_timeout)
                );
                tracing::error!("{msg}");
                Err((msg, Some(last.is_running())))
            }
        }
    }

    pub async fn restart(&self) -> ActionResult {
        let stopped = self.stop().await;
        if !stopped.ok {
            return stopped;
        }
        self.start().await
    }

    /// Polls until `done(serving, status)` holds or `timeout` elapses. On
    /// timeout returns the last observed status.
    async fn wait_for(
        &self,
        done: impl Fn(bool, &ContainerStatus) -> bool,
        timeout: Duration,
    ) -> Result<Duration, ContainerStatus> {
        let started = Instant::now();
        let mut last = ContainerStatus::unknown();
        loop {
            match self.observe().await {
                Ok((serving, status)) => {
                    let finished = done(serving, &status);
                    self.inner.lock().await.last_status = status.clone();
                    if finished {
                        return Ok(started.elapsed());
                    }
                    last = status;
                }
                Err(e) => {
                    tracing::debug!(error = %format_error_chain(&e), "status poll failed");
                }
            }
            if started.elapsed() >= timeout {
                return Err(last);
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    pub async fn set_manual_stop(&self, value: bool) {
        self.inner.lock().await.manual_stop = value;
    }

    pub async fn set_maintenance(&self, value: bool) {
        let mut inner = self.inner.lock().await;
        if inner.maintenance_active != value {
            tracing::info!(active = value, "maintenance flag changed");
        }
        inner.maintenance_active = value;
    }

    /// Manual stop or maintenance keeps the wake listener off.
    pub async fn auto_start_suppressed(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.manual_stop || inner.maintenance_active
    }

    pub async fn snapshot(&self) -> LifecycleSnapshot {
        let inner = self.inner.lock().await;
        LifecycleSnapshot {
            state: inner.state,
            manual_stop: inner.manual_stop,
            maintenance_active: inner.maintenance_active,
            serving: inner.serving,
            last_status: inner.last_status.clone(),
        }
    }
}

async fn join_start(mut rx: watch::Receiver<Option<ActionResult>>) -> ActionResult {
    tracing::debug!("start already in progress; waiting for its outcome");
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome)
            .clone()
            .unwrap_or_else(|| ActionResult::failed("start finished without an outcome")),
        Err(_) => ActionResult::failed("the start in progress was abandoned"),
    }
}
