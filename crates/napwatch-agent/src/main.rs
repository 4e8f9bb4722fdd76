use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};

use chrono::NaiveTime;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Instrument, info_span};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod calendar;
mod commands;
mod config;
mod connection_gate;
mod container;
mod discord;
mod emptiness;
mod lifecycle;
mod log_tail;
mod op_log;
mod port_listener;
mod schedule;
mod sleep;
mod support;
#[cfg(test)]
mod testing;
mod watchdog;

use crate::calendar::Calendar;
use crate::commands::CommandHandler;
use crate::config::Config;
use crate::connection_gate::ConnectionGate;
use crate::container::{ContainerRuntime, DockerCli};
use crate::discord::{DiscordClient, Notifier};
use crate::emptiness::EmptinessMonitor;
use crate::lifecycle::LifecycleController;
use crate::log_tail::LogFollower;
use crate::op_log::OpLog;
use crate::port_listener::PortListener;
use crate::schedule::ScheduleRunner;
use crate::sleep::{SleepService, SleepTrigger};
use crate::support::format_error_chain;
use crate::watchdog::{Watchdog, WatchdogExit};

const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine; the environment may be set by the supervisor.
    let _ = dotenvy::dotenv();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            init_logging(None);
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let _log_guard = match open_log_file(&cfg.paths.watchdog_log) {
        Ok((writer, guard)) => {
            init_logging(Some(writer));
            Some(guard)
        }
        Err(e) => {
            init_logging(None);
            tracing::warn!(
                path = %cfg.paths.watchdog_log.display(),
                error = %format_error_chain(&e),
                "log file unavailable; logging to stdout only"
            );
            None
        }
    };

    match run(cfg).await {
        Ok(exit) => {
            tracing::info!(?exit, "napwatch exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format_error_chain(&e), "napwatch failed");
            ExitCode::FAILURE
        }
    }
}

/// Truncates the log file; every run starts with a fresh one.
fn open_log_file(
    path: &Path,
) -> anyhow::Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    use anyhow::Context;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("create log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}

fn init_logging(file: Option<tracing_appender::non_blocking::NonBlocking>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = file.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}

async fn run(cfg: Config) -> anyhow::Result<WatchdogExit> {
    tracing::info!(
        container = %cfg.runtime.container,
        port = cfg.lifecycle.port,
        restart_interval = ?cfg.restart_interval,
        "napwatch starting"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::from_config(&cfg.runtime));
    let notifier: Arc<dyn Notifier> = Arc::new(DiscordClient::new(&cfg.discord)?);
    let lifecycle = Arc::new(LifecycleController::new(runtime, cfg.lifecycle.clone()));
    let gate = Arc::new(ConnectionGate::new(cfg.gate.clone()));
    let monitor = Arc::new(EmptinessMonitor::new(
        lifecycle.clone(),
        cfg.presence_window_lines,
    ));
    let calendar = Calendar::new(&cfg.calendar);
    let sleep = Arc::new(SleepService::new(
        lifecycle.clone(),
        monitor.clone(),
        notifier.clone(),
        SleepTrigger::new(
            cfg.paths.sleep_trigger_dir.clone(),
            cfg.paths.sleep_trigger_file.clone(),
        ),
        calendar.clone(),
        cfg.maintenance_max_wait,
    ));

    sleep
        .restore_overlays(chrono::Local::now().naive_local())
        .await;
    lifecycle.check().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let op_log = match OpLog::open(cfg.paths.op_log.clone(), cfg.op_log_names.clone()).await {
        Ok(log) => Some(log),
        Err(e) => {
            tracing::warn!(path = %cfg.paths.op_log.display(), error = %e, "op log disabled");
            None
        }
    };
    let follower = LogFollower::new(cfg.paths.game_log.clone(), monitor.clone(), op_log);
    let span = info_span!("log_follower", path = %cfg.paths.game_log.display());
    tokio::spawn(follower.run(shutdown_rx.clone()).instrument(span));

    let mut schedule = ScheduleRunner::new();
    sleep.register(&mut schedule);
    let sweep_gate = gate.clone();
    schedule.every(
        &crate::calendar::WEEK,
        NaiveTime::from_hms_opt(4, 0, 0).unwrap_or_default(),
        "gate-sweep",
        move || {
            let gate = sweep_gate.clone();
            async move {
                let evicted = gate.evict_stale(std::time::Instant::now());
                tracing::info!(evicted, tracked = gate.tracked_sources(), "connection gate swept");
            }
        },
    );
    tracing::info!(entries = schedule.len(), "schedule armed");
    tokio::spawn(schedule.run(shutdown_rx.clone()).instrument(info_span!("schedule")));

    let commands = Arc::new(CommandHandler::new(
        lifecycle.clone(),
        monitor.clone(),
        gate.clone(),
        sleep.clone(),
        notifier.clone(),
        cfg.discord.poll_interval,
    ));
    tokio::spawn(commands.run(shutdown_rx.clone()).instrument(info_span!("console")));

    notifier
        .broadcast("👀 Watchdog is now monitoring the server!")
        .await;

    let watchdog = Watchdog::new(
        lifecycle.clone(),
        gate,
        notifier.clone(),
        PortListener::new(cfg.lifecycle.force_release),
        cfg.accept_timeout,
        cfg.restart_interval,
    );
    let span = info_span!("watchdog", port = cfg.lifecycle.port);
    let main_loop = tokio::spawn(watchdog.run(shutdown_rx).instrument(span));

    supervise(main_loop, shutdown_signal(), shutdown_tx, notifier.as_ref()).await
}

/// Waits for either the watchdog to exit or a shutdown signal, then stops the
/// background tasks. The watchdog handle is awaited at most once after it has
/// completed.
async fn supervise(
    mut main_loop: JoinHandle<WatchdogExit>,
    signal: impl Future<Output = ()>,
    shutdown_tx: watch::Sender<bool>,
    notifier: &dyn Notifier,
) -> anyhow::Result<WatchdogExit> {
    let finished = tokio::select! {
        _ = signal => None,
        res = &mut main_loop => Some(res),
    };

    match finished {
        Some(Ok(exit)) => {
            let _ = shutdown_tx.send(true);
            Ok(exit)
        }
        Some(Err(e)) => {
            let _ = shutdown_tx.send(true);
            anyhow::bail!("watchdog task failed: {e}")
        }
        None => {
            tracing::info!("shutdown signal received");
            let notice = notifier.broadcast("⚠️ Watchdog is shutting down...");
            if tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, notice).await.is_err() {
                tracing::warn!("shutdown notice timed out");
            }
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(WATCHDOG_STOP_TIMEOUT, &mut main_loop)
                .await
                .is_err()
            {
                tracing::warn!("watchdog did not stop in time; aborting it");
                main_loop.abort();
            }
            Ok(WatchdogExit::Shutdown)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
