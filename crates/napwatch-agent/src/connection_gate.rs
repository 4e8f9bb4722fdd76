//! Per-source gate for wake-on-connect attempts.
//!
//! Each source address gets a sliding window of failed attempts. Reaching the
//! threshold inside the window puts the source in cooldown, and every new
//! cooldown doubles the previous one. Expired cooldowns keep their level; only
//! a successful session that lasts past the grace period forgives a source.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::config::GateConfig;
use crate::support::{doubling, human_duration};

#[derive(Debug, Clone)]
struct ConnectionRecord {
    attempts: VecDeque<Instant>,
    cooldown_level: u32,
    cooldown_started_at: Option<Instant>,
    last_successful_session_start: Option<Instant>,
    last_seen: Instant,
}

impl ConnectionRecord {
    fn new(now: Instant) -> Self {
        Self {
            attempts: VecDeque::new(),
            cooldown_level: 0,
            cooldown_started_at: None,
            last_successful_session_start: None,
            last_seen: now,
        }
    }

    fn forgive(&mut self) {
        self.attempts.clear();
        self.cooldown_level = 0;
        self.cooldown_started_at = None;
        self.last_successful_session_start = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownInfo {
    pub source: IpAddr,
    pub level: u32,
    pub remaining: Duration,
}

#[derive(Debug)]
pub struct ConnectionGate {
    cfg: GateConfig,
    records: Mutex<HashMap<IpAddr, ConnectionRecord>>,
}

impl ConnectionGate {
    pub fn new(cfg: GateConfig) -> Self {
        Self {
            cfg,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown_for_level(&self, level: u32) -> Duration {
        doubling(self.cfg.base_cooldown, level)
    }

    pub fn record_attempt(&self, source: IpAddr, successful: bool) -> bool {
        self.record_attempt_at(source, successful, Instant::now())
    }

    /// Returns whether the attempt should be honored.
    pub fn record_attempt_at(&self, source: IpAddr, successful: bool, now: Instant) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = records
            .entry(source)
            .or_insert_with(|| ConnectionRecord::new(now));
        rec.last_seen = now;

        if successful {
            rec.last_successful_session_start = Some(now);
            return true;
        }

        if let Some(remaining) = self.refresh(source, rec, now) {
            tracing::info!(
                %source,
                level = rec.cooldown_level,
                remaining = %human_duration(remaining),
                "connection attempt rejected: source in cooldown"
            );
            return false;
        }

        rec.attempts.push_back(now);
        while let Some(first) = rec.attempts.front() {
            if now.saturating_duration_since(*first) > self.cfg.attempt_window {
                rec.attempts.pop_front();
            } else {
                break;
            }
        }

        if rec.attempts.len() >= self.cfg.threshold {
            let mut level = rec.cooldown_level.saturating_add(1);
            if let Some(max) = self.cfg.max_level {
                level = level.min(max.max(1));
            }
            rec.cooldown_level = level;
            rec.cooldown_started_at = Some(now);
            tracing::warn!(
                %source,
                level,
                duration = %human_duration(self.cooldown_for_level(level)),
                attempts = rec.attempts.len(),
                "source placed in cooldown for repeated connection attempts"
            );
            return false;
        }

        true
    }

    pub fn is_in_cooldown(&self, source: IpAddr) -> bool {
        self.is_in_cooldown_at(source, Instant::now())
    }

    pub fn is_in_cooldown_at(&self, source: IpAddr, now: Instant) -> bool {
        self.cooldown_remaining_at(source, now).is_some()
    }

    pub fn cooldown_remaining(&self, source: IpAddr) -> Option<Duration> {
        self.cooldown_remaining_at(source, Instant::now())
    }

    pub fn cooldown_remaining_at(&self, source: IpAddr, now: Instant) -> Option<Duration> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = records.get_mut(&source)?;
        self.refresh(source, rec, now)
    }

    /// The session started by a successful wake from `source` is over.
    pub fn session_ended(&self, source: IpAddr) {
        self.session_ended_at(source, Instant::now());
    }

    pub fn session_ended_at(&self, source: IpAddr, now: Instant) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rec) = records.get_mut(&source) else {
            return;
        };
        let Some(started) = rec.last_successful_session_start else {
            return;
        };
        if now.saturating_duration_since(started) >= self.cfg.success_grace {
            rec.forgive();
            tracing::info!(%source, "cooldown history cleared after a sustained session");
        } else {
            rec.last_successful_session_start = None;
            tracing::debug!(%source, "short session ended; cooldown history kept");
        }
    }

    pub fn cooldowns_at(&self, now: Instant) -> Vec<CooldownInfo> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for (source, rec) in records.iter_mut() {
            if let Some(remaining) = self.refresh(*source, rec, now) {
                out.push(CooldownInfo {
                    source: *source,
                    level: rec.cooldown_level,
                    remaining,
                });
            }
        }
        out.sort_by_key(|c| c.source);
        out
    }

    /// Drops records that have been idle past the retention period and carry
    /// nothing that is still in effect.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        let retention = self.cfg.retention;
        records.retain(|source, rec| {
            if self.refresh(*source, rec, now).is_some() {
                return true;
            }
            rec.last_successful_session_start.is_some()
                || now.saturating_duration_since(rec.last_seen) < retention
        });
        before - records.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Applies forgiveness and expiry, then returns the remaining cooldown.
    fn refresh(&self, source: IpAddr, rec: &mut ConnectionRecord, now: Instant) -> Option<Duration> {
        if let Some(success) = rec.last_successful_session_start {
            if now.saturating_duration_since(success) > self.cfg.success_grace {
                let had_history = rec.cooldown_level > 0 || !rec.attempts.is_empty();
                rec.forgive();
                if had_history {
                    tracing::info!(%source, "cooldown reset after a successful connection");
                }
                return None;
            }
        }

        let started = rec.cooldown_started_at?;
        let duration = self.cooldown_for_level(rec.cooldown_level);
        match started.checked_add(duration) {
            // Past the representable range: effectively permanent.
            None => Some(duration.saturating_sub(now.saturating_duration_since(started))),
            Some(end) if now < end => Some(end - now),
            Some(_) => {
                rec.cooldown_started_at = None;
                rec.attempts.clear();
                tracing::debug!(%source, level = rec.cooldown_level, "cooldown expired");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    fn gate() -> ConnectionGate {
        ConnectionGate::new(GateConfig::default())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_attempt_is_allowed() {
        let g = gate();
        let t0 = Instant::now();
        assert!(g.record_attempt_at(ip("10.0.0.1"), false, t0));
        assert!(!g.is_in_cooldown_at(ip("10.0.0.1"), t0));
    }

    #[test]
    fn threshold_trips_cooldown_until_it_elapses() {
        let g = gate();
        let src = ip("10.0.0.2");
        let t0 = Instant::now();
        assert!(g.record_attempt_at(src, false, t0));
        assert!(!g.record_attempt_at(src, false, t0 + MIN));

        for m in [2u32, 10, 20, 30] {
            assert!(g.is_in_cooldown_at(src, t0 + MIN * m), "minute {m}");
        }
        assert!(!g.is_in_cooldown_at(src, t0 + MIN * 32));
    }

    #[test]
    fn attempts_outside_window_do_not_count() {
        let g = gate();
        let src = ip("10.0.0.3");
        let t0 = Instant::now();
        assert!(g.record_attempt_at(src, false, t0));
        assert!(g.record_attempt_at(src, false, t0 + MIN * 16));
        assert!(!g.is_in_cooldown_at(src, t0 + MIN * 16));
    }

    #[test]
    fn cooldown_doubles_per_level() {
        let g = gate();
        assert_eq!(g.cooldown_for_level(1), MIN * 30);
        assert_eq!(g.cooldown_for_level(2), MIN * 60);
        assert_eq!(g.cooldown_for_level(3), MIN * 120);
    }

    #[test]
    fn escalation_scenario() {
        let g = gate();
        let src = ip("10.0.0.5");
        let t0 = Instant::now();

        assert!(g.record_attempt_at(src, false, t0));
        assert!(!g.record_attempt_at(src, false, t0 + MIN * 5));
        // Third attempt is rejected by the active cooldown.
        assert!(!g.record_attempt_at(src, false, t0 + MIN * 6));

        // 31 minutes after the cooldown began, the source may try again.
        let t1 = t0 + MIN * 5 + MIN * 31;
        assert!(g.record_attempt_at(src, false, t1));

        // Failing again escalates to level 2 (60 minutes), not back to 30.
        assert!(!g.record_attempt_at(src, false, t1 + MIN));
        let remaining = g.cooldown_remaining_at(src, t1 + MIN).unwrap();
        assert_eq!(remaining, MIN * 60);
        assert!(g.is_in_cooldown_at(src, t1 + MIN * 45));
        assert!(!g.is_in_cooldown_at(src, t1 + MIN * 62));
    }

    #[test]
    fn rejected_attempts_do_not_extend_cooldown() {
        let g = gate();
        let src = ip("10.0.0.6");
        let t0 = Instant::now();
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, false, t0);
        for m in 1..20u32 {
            assert!(!g.record_attempt_at(src, false, t0 + MIN * m));
        }
        assert_eq!(g.cooldown_remaining_at(src, t0 + MIN * 20), Some(MIN * 10));
    }

    #[test]
    fn success_is_never_rejected() {
        let g = gate();
        let src = ip("10.0.0.7");
        let t0 = Instant::now();
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, false, t0);
        assert!(g.is_in_cooldown_at(src, t0));
        assert!(g.record_attempt_at(src, true, t0 + MIN));
    }

    #[test]
    fn sustained_session_clears_history_and_level() {
        let g = gate();
        let src = ip("10.0.0.8");
        let t0 = Instant::now();
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, false, t0);
        assert!(g.record_attempt_at(src, true, t0 + MIN));

        assert!(g.is_in_cooldown_at(src, t0 + MIN * 10));
        assert!(!g.is_in_cooldown_at(src, t0 + MIN * 17));

        // Level was reset: the next trip is level 1 again.
        let t1 = t0 + MIN * 18;
        assert!(g.record_attempt_at(src, false, t1));
        assert!(!g.record_attempt_at(src, false, t1));
        assert_eq!(g.cooldown_remaining_at(src, t1), Some(MIN * 30));
    }

    #[test]
    fn short_session_does_not_clear_cooldown() {
        let g = gate();
        let src = ip("10.0.0.9");
        let t0 = Instant::now();
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, true, t0 + MIN);
        g.session_ended_at(src, t0 + MIN * 5);

        assert!(g.is_in_cooldown_at(src, t0 + MIN * 20));
        assert!(g.is_in_cooldown_at(src, t0 + MIN * 29));
        assert!(!g.is_in_cooldown_at(src, t0 + MIN * 31));

        // Level survived, so the next trip is 60 minutes.
        let t1 = t0 + MIN * 40;
        g.record_attempt_at(src, false, t1);
        assert!(!g.record_attempt_at(src, false, t1));
        assert_eq!(g.cooldown_remaining_at(src, t1), Some(MIN * 60));
    }

    #[test]
    fn long_session_end_forgives() {
        let g = gate();
        let src = ip("10.0.0.10");
        let t0 = Instant::now();
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, false, t0);
        g.record_attempt_at(src, true, t0);
        g.session_ended_at(src, t0 + MIN * 15);
        assert!(!g.is_in_cooldown_at(src, t0 + MIN * 15));
    }

    #[test]
    fn sources_are_independent() {
        let g = gate();
        let t0 = Instant::now();
        g.record_attempt_at(ip("10.0.0.11"), false, t0);
        g.record_attempt_at(ip("10.0.0.11"), false, t0);
        assert!(g.record_attempt_at(ip("10.0.0.12"), false, t0));
        assert_eq!(g.cooldowns_at(t0).len(), 1);
    }

    #[test]
    fn max_level_caps_escalation() {
        let g = ConnectionGate::new(GateConfig {
            max_level: Some(2),
            ..GateConfig::default()
        });
        let src = ip("10.0.0.13");
        let mut t = Instant::now();
        for _ in 0..5 {
            g.record_attempt_at(src, false, t);
            g.record_attempt_at(src, false, t);
            t += MIN * 200;
        }
        g.record_attempt_at(src, false, t);
        g.record_attempt_at(src, false, t);
        assert_eq!(g.cooldown_remaining_at(src, t), Some(MIN * 60));
    }

    #[test]
    fn evict_stale_keeps_active_cooldowns() {
        let g = gate();
        let t0 = Instant::now();
        g.record_attempt_at(ip("10.0.0.20"), false, t0);
        g.record_attempt_at(ip("10.0.0.21"), false, t0);
        g.record_attempt_at(ip("10.0.0.21"), false, t0);
        assert_eq!(g.tracked_sources(), 2);

        assert_eq!(g.evict_stale(t0 + MIN), 0);
        let week = Duration::from_secs(7 * 24 * 3600);
        assert_eq!(g.evict_stale(t0 + week + MIN), 2);
        assert_eq!(g.tracked_sources(), 0);
    }
}
