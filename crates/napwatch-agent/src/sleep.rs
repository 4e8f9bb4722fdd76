use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::NaiveDate;
use napwatch_process::ActionResult;
use tokio::io::AsyncWriteExt;

use crate::calendar::Calendar;
use crate::discord::Notifier;
use crate::emptiness::EmptinessMonitor;
use crate::lifecycle::LifecycleController;
use crate::schedule::ScheduleRunner;
use crate::support::{format_error_chain, human_duration};

const MAINTENANCE_POLL: Duration = Duration::from_secs(5 * 60);

/// Drops a file that the host watches to put the machine to sleep.
#[derive(Debug, Clone)]
pub struct SleepTrigger {
    dir: PathBuf,
    file: PathBuf,
}

impl SleepTrigger {
    pub fn new(dir: PathBuf, file: PathBuf) -> Self {
        Self { dir, file }
    }

    pub async fn signal(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create sleep trigger dir {}", self.dir.display()))?;

        let stamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string();
        let mut f = tokio::fs::File::create(&self.file)
            .await
            .with_context(|| format!("create sleep trigger {}", self.file.display()))?;
        f.write_all(stamp.as_bytes())
            .await
            .context("write sleep trigger")?;
        f.sync_all().await.context("sync sleep trigger")?;
        drop(f);

        tokio::fs::metadata(&self.file)
            .await
            .with_context(|| format!("verify sleep trigger {}", self.file.display()))?;
        tracing::info!(path = %self.file.display(), %stamp, "sleep trigger written");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    Nightly,
    Maintenance { resume_day: &'static str },
    Manual,
}

impl fmt::Display for SleepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nightly => f.write_str("nightly"),
            Self::Maintenance { .. } => f.write_str("maintenance"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Nightly, maintenance and on-demand sleep flows.
pub struct SleepService {
    lifecycle: Arc<LifecycleController>,
    monitor: Arc<EmptinessMonitor>,
    notifier: Arc<dyn Notifier>,
    trigger: SleepTrigger,
    calendar: Calendar,
    maintenance_poll: Duration,
    maintenance_max_wait: Duration,
}

impl SleepService {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        monitor: Arc<EmptinessMonitor>,
        notifier: Arc<dyn Notifier>,
        trigger: SleepTrigger,
        calendar: Calendar,
        maintenance_max_wait: Duration,
    ) -> Self {
        Self {
            lifecycle,
            monitor,
            notifier,
            trigger,
            calendar,
            maintenance_poll: MAINTENANCE_POLL,
            maintenance_max_wait,
        }
    }

    pub fn with_maintenance_poll(mut self, poll: Duration) -> Self {
        self.maintenance_poll = poll;
        self
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Stops the server and signals the host to sleep, but only when nobody
    /// is online.
    pub async fn initiate_sleep(&self, reason: SleepReason) -> ActionResult {
        tracing::info!(%reason, "initiating sleep");
        if !self.monitor.is_empty().await {
            tracing::info!(%reason, "players online; skipping sleep");
            return ActionResult::failed("players are online; not sleeping");
        }

        let stopped = self.lifecycle.stop_with(true).await;
        if !stopped.ok {
            tracing::error!(%reason, error = %stopped.message, "sleep aborted: server did not stop");
            self.notifier
                .broadcast(&format!("⚠️ Error during {reason} sleep: {}", stopped.message))
                .await;
            return stopped;
        }

        // Announce before the trigger: the host may suspend right after it.
        let message = match reason {
            SleepReason::Nightly => format!(
                "💤 Server entering night mode - Will wake up at {}!",
                self.calendar.wake_label()
            ),
            SleepReason::Maintenance { resume_day } => format!(
                "🔧 **MAINTENANCE MODE**\nServer will be down until {resume_day} {}",
                self.calendar.wake_label()
            ),
            SleepReason::Manual => "💤 Server is going to sleep...".to_string(),
        };
        self.notifier.broadcast(&message).await;

        match self.trigger.signal().await {
            Ok(()) => ActionResult::ok(format!("{reason} sleep signalled")),
            Err(e) => {
                let msg = format!("failed to signal sleep: {}", format_error_chain(&e));
                tracing::error!("{msg}");
                self.notifier.console(&format!("⚠️ {msg}")).await;
                ActionResult::failed(msg)
            }
        }
    }

    /// Holds the server in maintenance from the eve until the resume day's
    /// wake time. Waits for players to leave, bounded by the max wait.
    pub async fn run_maintenance(&self, eve: NaiveDate) -> ActionResult {
        tracing::info!(%eve, "initiating maintenance");
        self.lifecycle.set_maintenance(true).await;

        let started = Instant::now();
        while !self.monitor.is_empty().await {
            let waited = started.elapsed();
            if waited >= self.maintenance_max_wait {
                self.lifecycle.set_maintenance(false).await;
                let msg = format!(
                    "maintenance postponed: players still online after {}",
                    human_duration(waited)
                );
                tracing::warn!("{msg}");
                self.notifier.broadcast(&format!("⚠️ {msg}")).await;
                return ActionResult::failed(msg);
            }
            tracing::info!(
                recheck_in = %human_duration(self.maintenance_poll),
                "players online; waiting before maintenance"
            );
            let remaining = self.maintenance_max_wait.saturating_sub(waited);
            tokio::time::sleep(self.maintenance_poll.min(remaining)).await;
        }

        let resume_day = self.calendar.resume_day_name(eve);
        let slept = self
            .initiate_sleep(SleepReason::Maintenance { resume_day })
            .await;
        if !slept.ok {
            self.lifecycle.set_maintenance(false).await;
        }
        slept
    }

    /// Thirty-minute heads-up before the nightly sleep or maintenance.
    pub async fn send_warning(&self, today: NaiveDate) {
        if self.calendar.is_maintenance_eve(today) {
            self.notifier
                .broadcast("⚠️ Server entering maintenance mode in 30 minutes!")
                .await;
        } else if self.lifecycle.check().await {
            self.notifier
                .broadcast("💤 Server will sleep in 30 minutes if no players are online!")
                .await;
        }
    }

    pub async fn morning_wake(&self) {
        self.lifecycle.set_maintenance(false).await;
        self.lifecycle.set_manual_stop(false).await;
        let res = self.lifecycle.start().await;
        if res.ok {
            tracing::info!(message = %res.message, "morning wake");
        } else {
            tracing::error!(message = %res.message, "morning wake failed");
            self.notifier
                .console(&format!("❌ Morning start failed: {}", res.message))
                .await;
        }
    }

    /// Re-applies the maintenance overlay after a restart inside the window.
    pub async fn restore_overlays(&self, now: chrono::NaiveDateTime) {
        if self.calendar.in_maintenance_period(now) {
            tracing::info!("inside the maintenance window; auto-start stays off");
            self.lifecycle.set_maintenance(true).await;
        }
    }

    /// Registers the warning, nightly sleep, maintenance and morning wake
    /// entries.
    pub fn register(self: &Arc<Self>, runner: &mut ScheduleRunner) {
        let cal = &self.calendar;
        let all_days = cal.regular_eves().into_iter().chain(cal.maintenance_eves()).collect::<Vec<_>>();

        let svc = self.clone();
        runner.every(&all_days, cal.warning_at(), "sleep-warning", move || {
            let svc = svc.clone();
            async move { svc.send_warning(chrono::Local::now().date_naive()).await }
        });

        let svc = self.clone();
        runner.every(&cal.regular_eves(), cal.sleep_at(), "nightly-sleep", move || {
            let svc = svc.clone();
            async move {
                svc.initiate_sleep(SleepReason::Nightly).await;
            }
        });

        let svc = self.clone();
        runner.every(&cal.maintenance_eves(), cal.sleep_at(), "maintenance", move || {
            let svc = svc.clone();
            async move {
                svc.run_maintenance(chrono::Local::now().date_naive()).await;
            }
        });

        let svc = self.clone();
        runner.every(&cal.wake_days(), cal.wake_at(), "morning-wake", move || {
            let svc = svc.clone();
            async move { svc.morning_wake().await }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;
    use crate::config::CalendarConfig;
    use crate::testing::{self, FakeNotifier, FakeRuntime};

    const JOIN_ALEX: &str = "[12:00:01] [Server thread/INFO]: alex joined the game";

    struct Fixture {
        _dir: tempfile::TempDir,
        trigger_file: PathBuf,
        rt: Arc<FakeRuntime>,
        lifecycle: Arc<LifecycleController>,
        monitor: Arc<EmptinessMonitor>,
        notifier: Arc<FakeNotifier>,
        svc: Arc<SleepService>,
    }

    fn fixture(rt: FakeRuntime) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let trigger_dir = dir.path().join("trigger");
        let trigger_file = trigger_dir.join("sleep_trigger");
        let rt = Arc::new(rt);
        let lifecycle = testing::controller(&rt);
        let monitor = Arc::new(EmptinessMonitor::new(lifecycle.clone(), 100));
        monitor.reset();
        let notifier = Arc::new(FakeNotifier::default());
        let svc = SleepService::new(
            lifecycle.clone(),
            monitor.clone(),
            notifier.clone(),
            SleepTrigger::new(trigger_dir, trigger_file.clone()),
            Calendar::new(&CalendarConfig::default()),
            Duration::from_millis(60),
        )
        .with_maintenance_poll(Duration::from_millis(10));
        Fixture {
            _dir: dir,
            trigger_file,
            rt,
            lifecycle,
            monitor,
            notifier,
            svc: Arc::new(svc),
        }
    }

    // 2024-01-01 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn trigger_creates_directory_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("sleep_trigger");
        SleepTrigger::new(file.parent().unwrap().to_path_buf(), file.clone())
            .signal()
            .await
            .unwrap();
        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.starts_with("20"), "{text}");
    }

    #[tokio::test]
    async fn occupied_server_does_not_sleep() {
        let f = fixture(FakeRuntime::running());
        f.monitor.push_line(JOIN_ALEX);
        let res = f.svc.initiate_sleep(SleepReason::Nightly).await;
        assert!(!res.ok);
        assert_eq!(f.rt.stops(), 0);
        assert!(!f.trigger_file.exists());
    }

    #[tokio::test]
    async fn empty_server_sleeps() {
        let f = fixture(FakeRuntime::running());
        let res = f.svc.initiate_sleep(SleepReason::Nightly).await;
        assert!(res.ok, "{}", res.message);
        assert_eq!(f.rt.stops(), 1);
        assert!(f.trigger_file.exists());
        assert!(f.lifecycle.snapshot().await.manual_stop);
        let sent = f.notifier.texts("b1");
        assert_eq!(sent, vec!["💤 Server entering night mode - Will wake up at 8 AM!"]);
        assert_eq!(f.notifier.texts("b2").len(), 1);
    }

    #[tokio::test]
    async fn maintenance_gives_up_when_players_stay() {
        let f = fixture(FakeRuntime::running());
        f.monitor.push_line(JOIN_ALEX);
        let res = f.svc.run_maintenance(monday()).await;
        assert!(!res.ok);
        let snap = f.lifecycle.snapshot().await;
        assert!(!snap.maintenance_active);
        assert!(f.notifier.texts("b1")[0].contains("maintenance postponed"));
        assert!(!f.trigger_file.exists());
    }

    #[tokio::test]
    async fn maintenance_sleeps_until_resume_day() {
        let f = fixture(FakeRuntime::running());
        let res = f.svc.run_maintenance(monday()).await;
        assert!(res.ok, "{}", res.message);
        let snap = f.lifecycle.snapshot().await;
        assert!(snap.maintenance_active);
        assert!(snap.manual_stop);
        assert!(f.lifecycle.auto_start_suppressed().await);
        let sent = f.notifier.texts("b1");
        assert!(sent[0].contains("down until Wednesday 8 AM"), "{sent:?}");
        assert!(f.trigger_file.exists());
    }

    #[tokio::test]
    async fn warning_depends_on_eve() {
        let f = fixture(FakeRuntime::running());
        f.svc.send_warning(monday()).await;
        let tuesday = monday().succ_opt().unwrap();
        f.svc.send_warning(tuesday).await;
        let sent = f.notifier.texts("b1");
        assert!(sent[0].contains("maintenance mode in 30 minutes"));
        assert!(sent[1].contains("sleep in 30 minutes"));
    }

    #[tokio::test]
    async fn morning_wake_clears_overlays_and_starts() {
        let f = fixture(FakeRuntime::stopped());
        f.lifecycle.set_maintenance(true).await;
        f.lifecycle.set_manual_stop(true).await;
        f.svc.morning_wake().await;
        assert!(!f.lifecycle.auto_start_suppressed().await);
        assert_eq!(f.rt.starts(), 1);
    }

    #[tokio::test]
    async fn restore_inside_window_sets_maintenance() {
        let f = fixture(FakeRuntime::stopped());
        let tuesday_noon = monday().succ_opt().unwrap().and_hms_opt(12, 0, 0).unwrap();
        f.svc.restore_overlays(tuesday_noon).await;
        assert!(f.lifecycle.snapshot().await.maintenance_active);
    }

    #[test]
    fn registers_four_entries() {
        let f = fixture(FakeRuntime::stopped());
        let mut runner = ScheduleRunner::new();
        f.svc.register(&mut runner);
        assert_eq!(runner.len(), 4);
        // The eves together cover the whole week.
        assert_eq!(
            f.svc.calendar().regular_eves().len() + f.svc.calendar().maintenance_eves().len(),
            7
        );
        assert!(f.svc.calendar().maintenance_eves().contains(&Weekday::Mon));
    }
}
