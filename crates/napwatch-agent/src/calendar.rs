//! Weekly sleep and maintenance timing.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};

use crate::config::CalendarConfig;

pub const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// A maintenance day keeps the server down from the sleep time of the day
/// before it (the eve) until the wake time of the day after it.
#[derive(Debug, Clone)]
pub struct Calendar {
    maintenance_days: Vec<Weekday>,
    sleep_at: NaiveTime,
    wake_at: NaiveTime,
}

impl Calendar {
    pub fn new(cfg: &CalendarConfig) -> Self {
        Self {
            maintenance_days: cfg.maintenance_days.clone(),
            sleep_at: cfg.sleep_at,
            wake_at: cfg.wake_at,
        }
    }

    pub fn sleep_at(&self) -> NaiveTime {
        self.sleep_at
    }

    pub fn wake_at(&self) -> NaiveTime {
        self.wake_at
    }

    /// Thirty minutes before the sleep time, wrapping around midnight.
    pub fn warning_at(&self) -> NaiveTime {
        self.sleep_at.overflowing_sub_signed(Duration::minutes(30)).0
    }

    pub fn is_maintenance_weekday(&self, day: Weekday) -> bool {
        self.maintenance_days.contains(&day)
    }

    pub fn is_maintenance_day(&self, date: NaiveDate) -> bool {
        self.is_maintenance_weekday(date.weekday())
    }

    pub fn is_maintenance_eve(&self, date: NaiveDate) -> bool {
        self.is_maintenance_weekday(date.weekday().succ())
    }

    pub fn maintenance_eves(&self) -> Vec<Weekday> {
        WEEK.into_iter()
            .filter(|d| self.is_maintenance_weekday(d.succ()))
            .collect()
    }

    pub fn regular_eves(&self) -> Vec<Weekday> {
        WEEK.into_iter()
            .filter(|d| !self.is_maintenance_weekday(d.succ()))
            .collect()
    }

    /// Days whose morning should bring the server back.
    pub fn wake_days(&self) -> Vec<Weekday> {
        WEEK.into_iter()
            .filter(|d| !self.is_maintenance_weekday(*d))
            .collect()
    }

    pub fn in_maintenance_period(&self, now: NaiveDateTime) -> bool {
        let today = now.date();
        [today - Duration::days(1), today, today + Duration::days(1)]
            .into_iter()
            .filter(|d| self.is_maintenance_day(*d))
            .any(|d| {
                let start = (d - Duration::days(1)).and_time(self.sleep_at);
                let end = (d + Duration::days(1)).and_time(self.wake_at);
                start <= now && now < end
            })
    }

    /// First non-maintenance day after `eve`, as shown to players.
    pub fn resume_day_name(&self, eve: NaiveDate) -> &'static str {
        let mut day = eve.weekday().succ();
        for _ in 0..7 {
            if !self.is_maintenance_weekday(day) {
                break;
            }
            day = day.succ();
        }
        weekday_name(day)
    }

    /// "8 AM", "7:30 AM".
    pub fn wake_label(&self) -> String {
        if self.wake_at.minute() == 0 {
            self.wake_at.format("%-I %p").to_string()
        } else {
            self.wake_at.format("%-I:%M %p").to_string()
        }
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
