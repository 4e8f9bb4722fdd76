use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use tokio::sync::watch;
use tracing::{Instrument, info_span};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Action = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

/// A tick that lands this late after the scheduled minute still fires (the
/// host may have been suspended or the runtime busy).
const LATE_GRACE_SECS: i64 = 120;

struct ScheduleEntry {
    name: String,
    days: Vec<Weekday>,
    at: NaiveTime,
    action: Action,
    last_fired: Option<NaiveDate>,
}

impl ScheduleEntry {
    fn is_due(&self, now: NaiveDateTime) -> bool {
        if self.last_fired == Some(now.date()) || !self.days.contains(&now.weekday()) {
            return false;
        }
        let late = now.time().signed_duration_since(self.at).num_seconds();
        (0..LATE_GRACE_SECS).contains(&late)
    }
}

/// Weekday plus time-of-day triggers driven by a single ticker.
#[derive(Default)]
pub struct ScheduleRunner {
    entries: Vec<ScheduleEntry>,
}

impl ScheduleRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn every<F, Fut>(&mut self, days: &[Weekday], at: NaiveTime, name: impl Into<String>, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(entry = %name, at = %at.format("%H:%M"), days = ?days, "schedule entry registered");
        self.entries.push(ScheduleEntry {
            name,
            days: days.to_vec(),
            // Minute granularity.
            at: NaiveTime::from_hms_opt(at.hour(), at.minute(), 0).unwrap_or(at),
            action: Arc::new(move || Box::pin(action()) as BoxFuture),
            last_fired: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries due at `now`. Each returned entry is marked fired for the day.
    pub fn due(&mut self, now: NaiveDateTime) -> Vec<(String, Action)> {
        let mut out = Vec::new();
        for entry in &mut self.entries {
            if entry.is_due(now) {
                entry.last_fired = Some(now.date());
                out.push((entry.name.clone(), entry.action.clone()));
            }
        }
        out
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            let now = chrono::Local::now().naive_local();
            for (name, action) in self.due(now) {
                tracing::info!(entry = %name, "running scheduled task");
                let span = info_span!("schedule", entry = %name);
                // Long actions (maintenance) must not hold up the ticker.
                tokio::spawn(action().instrument(span));
            }
        }
        tracing::debug!("schedule runner stopped");
    }
}
