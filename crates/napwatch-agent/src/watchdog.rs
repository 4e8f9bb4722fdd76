use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::watch;

use crate::connection_gate::ConnectionGate;
use crate::discord::Notifier;
use crate::lifecycle::LifecycleController;
use crate::port_listener::PortListener;
use crate::support::{format_error_chain, human_duration};

const TICK: Duration = Duration::from_secs(1);
const ERROR_PAUSE: Duration = Duration::from_secs(5);
const UPTIME_CHECK_EVERY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Shutdown,
    /// The uptime limit was reached; the supervisor is expected to restart us.
    UptimeRestart,
}

/// The wake-on-connect loop.
pub struct Watchdog {
    lifecycle: Arc<LifecycleController>,
    gate: Arc<ConnectionGate>,
    notifier: Arc<dyn Notifier>,
    listener: PortListener,
    accept_timeout: Duration,
    restart_interval: Option<Duration>,
    started: Instant,
    wake_source: Option<IpAddr>,
    was_serving: bool,
}

impl Watchdog {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        gate: Arc<ConnectionGate>,
        notifier: Arc<dyn Notifier>,
        listener: PortListener,
        accept_timeout: Duration,
        restart_interval: Option<Duration>,
    ) -> Self {
        Self {
            lifecycle,
            gate,
            notifier,
            listener,
            accept_timeout,
            restart_interval,
            started: Instant::now(),
            wake_source: None,
            was_serving: false,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WatchdogExit {
        let mut last_uptime_check = Instant::now();
        loop {
            let ticked = tokio::select! {
                _ = shutdown.changed() => return WatchdogExit::Shutdown,
                res = self.tick() => res,
            };
            if let Err(e) = ticked {
                tracing::warn!(error = %format_error_chain(&e), "watchdog iteration failed");
                tokio::select! {
                    _ = shutdown.changed() => return WatchdogExit::Shutdown,
                    _ = tokio::time::sleep(ERROR_PAUSE) => {}
                }
            }

            if last_uptime_check.elapsed() >= UPTIME_CHECK_EVERY {
                last_uptime_check = Instant::now();
                if self.uptime_exceeded() {
                    let uptime = self.started.elapsed();
                    tracing::info!(uptime = %human_duration(uptime), "uptime limit reached; exiting for restart");
                    self.notifier
                        .broadcast("🔄 Watchdog is restarting (uptime limit reached)")
                        .await;
                    return WatchdogExit::UptimeRestart;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return WatchdogExit::Shutdown,
                _ = tokio::time::sleep(TICK) => {}
            }
        }
    }

    fn uptime_exceeded(&self) -> bool {
        self.restart_interval
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    /// One pass: observe, then listen for a wake connection if the server is
    /// down and auto-start is allowed.
    pub async fn tick(&mut self) -> anyhow::Result<()> {
        let serving = self.lifecycle.check().await;
        if self.was_serving && !serving {
            if let Some(source) = self.wake_source.take() {
                self.gate.session_ended(source);
            }
        }
        self.was_serving = serving;

        if serving || self.lifecycle.auto_start_suppressed().await {
            return Ok(());
        }
        if self.lifecycle.snapshot().await.state.is_transition() {
            return Ok(());
        }

        let port = self.lifecycle.port();
        let Some(peer) = self.listener.listen(port, self.accept_timeout).await? else {
            return Ok(());
        };
        let source = peer.ip();
        if !self.gate.record_attempt(source, false) {
            return Ok(());
        }

        self.notifier
            .broadcast("🚀 Connection detected - server is starting up!")
            .await;
        let res = self.lifecycle.start().await;
        if res.ok {
            self.gate.record_attempt(source, true);
            self.wake_source = Some(source);
            self.was_serving = true;
            tracing::info!(%source, message = %res.message, "server woken by connection");
            self.notifier.broadcast("✅ Server is up - join now!").await;
        } else {
            tracing::error!(%source, message = %res.message, "wake start failed");
            self.notifier
                .console(&format!("❌ Failed to start server after connection: {}", res.message))
                .await;
        }
        Ok(())
    }
}
