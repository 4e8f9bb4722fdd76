use std::{sync::Arc, time::{Duration, Instant}};

use tokio::sync::watch;

use crate::connection_gate::ConnectionGate;
use crate::discord::Notifier;
use crate::emptiness::EmptinessMonitor;
use crate::lifecycle::LifecycleController;
use crate::sleep::{SleepReason, SleepService};
use crate::support::{format_error_chain, human_duration};

const ERROR_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
    Sleep,
    Players,
    Help,
}

impl Command {
    /// Exact tokens only, case-insensitive, with an optional `/` or `!`.
    pub fn parse(text: &str) -> Option<Self> {
        let t = text.trim();
        let t = t
            .strip_prefix('/')
            .or_else(|| t.strip_prefix('!'))
            .unwrap_or(t);
        match t.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "status" => Some(Self::Status),
            "sleep" => Some(Self::Sleep),
            "players" => Some(Self::Players),
            "help" => Some(Self::Help),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
            Self::Sleep => "sleep",
            Self::Players => "players",
            Self::Help => "help",
        }
    }
}

const HELP: &str = "**Commands**\n\
`/start` start the server\n\
`/stop` stop the server (no auto-start until the next start)\n\
`/restart` restart the server\n\
`/status` lifecycle, container and player status\n\
`/players` who is online\n\
`/sleep` stop the server and put the host to sleep";

/// Executes console channel commands.
pub struct CommandHandler {
    lifecycle: Arc<LifecycleController>,
    monitor: Arc<EmptinessMonitor>,
    gate: Arc<ConnectionGate>,
    sleep: Arc<SleepService>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
}

impl CommandHandler {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        monitor: Arc<EmptinessMonitor>,
        gate: Arc<ConnectionGate>,
        sleep: Arc<SleepService>,
        notifier: Arc<dyn Notifier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            lifecycle,
            monitor,
            gate,
            sleep,
            notifier,
            poll_interval,
        }
    }

    pub async fn handle(&self, cmd: Command) {
        tracing::info!(command = cmd.name(), "chat command received");
        match cmd {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Restart => self.restart().await,
            Command::Sleep => self.sleep().await,
            Command::Status => {
                let report = self.status_report().await;
                self.notifier.console(&report).await;
            }
            Command::Players => {
                let players = self.monitor.online_participants();
                let text = if players.is_empty() {
                    "👥 Nobody is online".to_string()
                } else {
                    format!("👥 Online ({}): {}", players.len(), players.join(", "))
                };
                self.notifier.console(&text).await;
            }
            Command::Help => self.notifier.console(HELP).await,
        }
    }

    async fn start(&self) {
        self.notifier.console("⚙️ Processing start command...").await;
        if self.lifecycle.check().await {
            self.notifier.console("ℹ️ Server is already running!").await;
            return;
        }
        self.notifier.broadcast("🚀 Server is starting up!").await;
        let res = self.lifecycle.start().await;
        if res.ok {
            self.notifier
                .console(&format!("✅ Server started successfully! ({})", res.message))
                .await;
        } else {
            self.notifier
                .console(&format!("❌ Failed to start server: {}", res.message))
                .await;
        }
    }

    async fn stop(&self) {
        self.notifier.console("⚙️ Processing stop command...").await;
        if !self.lifecycle.check().await {
            // Still honor the intent: keep the wake listener off.
            self.lifecycle.set_manual_stop(true).await;
            self.notifier.console("ℹ️ Server is already stopped!").await;
            return;
        }
        let res = self.lifecycle.stop_with(true).await;
        if res.ok {
            self.notifier.broadcast("🛑 Server has been stopped").await;
            self.notifier.console("✅ Server stopped successfully!").await;
        } else {
            self.notifier
                .console(&format!("❌ Failed to stop server: {}", res.message))
                .await;
        }
    }

    async fn restart(&self) {
        self.notifier.console("⚙️ Processing restart command...").await;
        let res = self.lifecycle.restart().await;
        if res.ok {
            self.notifier.broadcast("🔄 Server has been restarted").await;
            self.notifier.console("✅ Server restarted successfully!").await;
        } else {
            self.notifier
                .console(&format!("❌ Failed to restart server: {}", res.message))
                .await;
        }
    }

    async fn sleep(&self) {
        self.notifier.console("⚙️ Processing sleep command...").await;
        if self.lifecycle.check().await {
            self.notifier.console("🛑 Stopping server first...").await;
            let res = self.lifecycle.stop_with(true).await;
            if !res.ok {
                self.notifier
                    .console(&format!("❌ Failed to stop server: {}", res.message))
                    .await;
                return;
            }
        }
        let res = self.sleep.initiate_sleep(SleepReason::Manual).await;
        if res.ok {
            self.notifier.console("✅ Sleep initiated successfully!").await;
        } else {
            self.notifier
                .console(&format!("❌ Failed to initiate sleep: {}", res.message))
                .await;
        }
    }

    pub async fn status_report(&self) -> String {
        let serving = self.lifecycle.check().await;
        let snap = self.lifecycle.snapshot().await;

        let auto_start = match (snap.maintenance_active, snap.manual_stop) {
            (true, _) => "paused (maintenance)",
            (false, true) => "paused (manual stop)",
            (false, false) => "armed",
        };
        let players = if serving {
            let online = self.monitor.online_participants();
            if online.is_empty() {
                "none".to_string()
            } else {
                online.join(", ")
            }
        } else {
            "none (server down)".to_string()
        };
        let cooldowns = self.gate.cooldowns_at(Instant::now());
        let gated = if cooldowns.is_empty() {
            "none".to_string()
        } else {
            cooldowns
                .iter()
                .map(|c| format!("{} (level {}, {} left)", c.source, c.level, human_duration(c.remaining)))
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "📊 **Server status**\n\
             State: {}\n\
             Container: {}\n\
             Auto-start: {auto_start}\n\
             Players: {players}\n\
             Cooldowns: {gated}",
            snap.state, snap.last_status
        )
    }

    /// Polls the console channel until shutdown. Messages that predate the
    /// loop are never replayed.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let channel = self.notifier.console_channel().to_string();

        let mut last_id = loop {
            match self.notifier.fetch_latest_id(&channel).await {
                Ok(id) => break id,
                Err(e) => {
                    tracing::warn!(error = %format_error_chain(&e), "cannot read console channel; retrying");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                }
            }
        };
        tracing::info!(channel = %channel, "console command loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let mut messages = match self.notifier.fetch_after(&channel, last_id.as_deref()).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %format_error_chain(&e), "console poll failed");
                    tokio::time::sleep(ERROR_PAUSE).await;
                    continue;
                }
            };
            messages.sort_by_key(|m| m.sort_key());

            for msg in messages {
                last_id = Some(msg.id.clone());
                if msg.from_bot() {
                    continue;
                }
                if let Some(cmd) = Command::parse(&msg.content) {
                    let (author_id, author) = msg
                        .author
                        .as_ref()
                        .map(|a| (a.id.as_str(), a.username.as_str()))
                        .unwrap_or(("-", "unknown"));
                    tracing::debug!(command = cmd.name(), author, author_id, "console message parsed");
                    self.handle(cmd).await;
                }
            }
        }
        tracing::debug!("console command loop stopped");
    }
}
