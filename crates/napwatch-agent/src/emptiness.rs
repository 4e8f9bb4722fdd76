//! Player presence derived from the game log.

use std::{
    collections::{BTreeMap, VecDeque},
    io::SeekFrom,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::lifecycle::LifecycleController;

const SERVER_THREAD_MARKER: &str = "[Server thread/INFO]";
const JOINED_SUFFIX: &str = " joined the game";
const LEFT_SUFFIX: &str = " left the game";
/// Bytes read per window line when priming from an existing log.
const PRIME_BYTES_PER_LINE: u64 = 256;

#[derive(Debug)]
struct LineWindow {
    max_lines: usize,
    lines: VecDeque<String>,
    degraded: bool,
}

impl LineWindow {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }
}

pub struct EmptinessMonitor {
    lifecycle: Arc<LifecycleController>,
    window: Mutex<LineWindow>,
}

impl EmptinessMonitor {
    pub fn new(lifecycle: Arc<LifecycleController>, max_lines: usize) -> Self {
        Self {
            lifecycle,
            window: Mutex::new(LineWindow {
                max_lines: max_lines.max(1),
                lines: VecDeque::new(),
                // Occupied until the log has been read at least once.
                degraded: true,
            }),
        }
    }

    /// Replaces the window with the last lines of `path`. Only a bounded
    /// tail of the file is read. Returns the offset read up to, which is
    /// where following should continue.
    pub async fn prime_from(&self, path: &Path) -> anyhow::Result<u64> {
        let max_lines = self.window.lock().unwrap_or_else(|e| e.into_inner()).max_lines;

        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open game log {}", path.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("stat game log {}", path.display()))?
            .len();
        let start = tail_start(size, max_lines);
        // One byte early, to tell whether `start` falls on a line boundary.
        let from = start.saturating_sub(1);
        file.seek(SeekFrom::Start(from))
            .await
            .with_context(|| format!("seek game log {}", path.display()))?;
        let mut buf = Vec::new();
        file.take(size - from)
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("read game log {}", path.display()))?;
        let end = from + buf.len() as u64;

        let body = if start > 0 {
            // Drop the line the window cut into.
            match buf.iter().position(|b| *b == b'\n') {
                Some(i) => &buf[i + 1..],
                None => &[][..],
            }
        } else {
            &buf[..]
        };
        let text = String::from_utf8_lossy(body);

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.lines.clear();
        for line in text.lines() {
            window.push_line(line.to_string());
        }
        window.degraded = false;
        tracing::debug!(
            path = %path.display(),
            skipped_bytes = start,
            lines = window.lines.len(),
            "presence window primed"
        );
        Ok(end)
    }

    pub fn push_line(&self, line: impl Into<String>) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_line(line.into());
        window.degraded = false;
    }

    /// Forget everything seen so far (the log was truncated or rotated).
    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.lines.clear();
        window.degraded = false;
    }

    pub fn set_degraded(&self, degraded: bool) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.degraded != degraded {
            tracing::info!(degraded, "presence tracking state changed");
        }
        window.degraded = degraded;
    }

    /// True when nobody is connected. A server that is not serving is empty by
    /// definition; an unreadable log is treated as occupied.
    pub async fn is_empty(&self) -> bool {
        if !self.lifecycle.check().await {
            return true;
        }
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.degraded {
            tracing::warn!("game log unavailable; assuming players are online");
            return false;
        }
        participants(window.lines.iter().map(String::as_str)).is_empty()
    }

    pub fn online_participants(&self) -> Vec<String> {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        participants(window.lines.iter().map(String::as_str))
    }
}

fn tail_start(size: u64, max_lines: usize) -> u64 {
    size.saturating_sub((max_lines as u64).saturating_mul(PRIME_BYTES_PER_LINE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence<'a> {
    Joined(&'a str),
    Left(&'a str),
}

fn presence_event(line: &str) -> Option<Presence<'_>> {
    if !line.contains(SERVER_THREAD_MARKER) {
        return None;
    }
    let (_, message) = line.split_once(": ")?;
    let message = message.trim_end();
    if let Some(name) = message.strip_suffix(JOINED_SUFFIX) {
        player_name(name).map(Presence::Joined)
    } else if let Some(name) = message.strip_suffix(LEFT_SUFFIX) {
        player_name(name).map(Presence::Left)
    } else {
        None
    }
}

// Chat lines ("<alex> I joined the game") and empty names are not events.
fn player_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.contains(char::is_whitespace) || name.contains('<') {
        None
    } else {
        Some(name)
    }
}

/// Sorted names whose last presence event is a join.
fn participants<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut joined = BTreeMap::<&str, bool>::new();
    for line in lines {
        match presence_event(line) {
            Some(Presence::Joined(name)) => {
                joined.insert(name, true);
            }
            Some(Presence::Left(name)) => {
                joined.insert(name, false);
            }
            None => {}
        }
    }
    joined
        .into_iter()
        .filter(|(_, online)| *online)
        .map(|(name, _)| name.to_string())
        .collect()
}
