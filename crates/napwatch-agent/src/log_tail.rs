use std::{
    io::SeekFrom,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

use crate::emptiness::EmptinessMonitor;
use crate::op_log::OpLog;
use crate::support::format_error_chain;

const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;

#[derive(Debug)]
struct Cursor {
    file_id: u64,
    pos: u64,
    pending: Vec<u8>,
}

/// Follows the game log from its end, like `tail -F`.
pub struct LogFollower {
    path: PathBuf,
    monitor: Arc<EmptinessMonitor>,
    op_log: Option<OpLog>,
    poll_interval: Duration,
    cursor: Option<Cursor>,
}

impl LogFollower {
    pub fn new(path: PathBuf, monitor: Arc<EmptinessMonitor>, op_log: Option<OpLog>) -> Self {
        Self {
            path,
            monitor,
            op_log,
            poll_interval: Duration::from_millis(250),
            cursor: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut failing = false;
        loop {
            match self.poll().await {
                Ok(()) => {
                    if failing {
                        tracing::info!(path = %self.path.display(), "following game log again");
                    }
                    failing = false;
                }
                Err(e) => {
                    if !failing {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %format_error_chain(&e),
                            "cannot follow game log"
                        );
                    }
                    failing = true;
                    self.cursor = None;
                    self.monitor.set_degraded(true);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::debug!("log follower stopped");
    }

    async fn poll(&mut self) -> anyhow::Result<()> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("stat {}", self.path.display()))?;
        let id = file_id(&meta);
        let len = meta.len();

        let cursor = match self.cursor.take() {
            None => {
                let pos = self.monitor.prime_from(&self.path).await?;
                Cursor {
                    file_id: id,
                    pos,
                    pending: Vec::new(),
                }
            }
            Some(c) if c.file_id != id || len < c.pos => {
                tracing::info!(path = %self.path.display(), "game log rotated or truncated");
                self.monitor.reset();
                Cursor {
                    file_id: id,
                    pos: 0,
                    pending: Vec::new(),
                }
            }
            Some(c) => c,
        };
        let cursor = self.cursor.insert(cursor);
        if len <= cursor.pos {
            return Ok(());
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(cursor.pos)).await?;
        let mut buf = Vec::new();
        file.take((len - cursor.pos).min(MAX_READ_PER_POLL))
            .read_to_end(&mut buf)
            .await
            .context("read game log")?;
        cursor.pos += buf.len() as u64;
        cursor.pending.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(idx) = cursor.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = cursor.pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }

        for line in lines {
            if let Some(op_log) = self.op_log.as_mut() {
                op_log.observe(&line).await;
            }
            self.monitor.push_line(line);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> u64 {
    0
}
