use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt};

const SERVER_THREAD_MARKER: &str = "[Server thread/INFO]";
const CAP_BYTES: u64 = 10 * 1024 * 1024;
const BACKUPS: u32 = 2;

/// Appends operator actions seen in the game log to a size-capped file with
/// numbered backups (`op.log.1` is the newest).
pub struct OpLog {
    names: Vec<String>,
    file: OpLogFile,
}

impl OpLog {
    pub async fn open(path: PathBuf, names: Vec<String>) -> io::Result<Self> {
        Ok(Self {
            names,
            file: OpLogFile::open(path, CAP_BYTES, BACKUPS).await?,
        })
    }

    pub fn is_operator_action(&self, line: &str) -> bool {
        if !line.contains(SERVER_THREAD_MARKER) {
            return false;
        }
        if line.contains("issued server command:") {
            return true;
        }
        let lifecycle = line.contains("Starting the server") || line.contains("Stopping the server");
        if lifecycle && !line.contains("Rcon") {
            return true;
        }
        // Chat from a listed operator: "[...]: <name> text" or "[name: text]".
        (line.contains(": [") || line.contains(": <"))
            && self.names.iter().any(|n| !n.is_empty() && line.contains(n.as_str()))
    }

    /// Records `line` if it is an operator action. Write failures are logged
    /// and otherwise ignored.
    pub async fn observe(&mut self, line: &str) {
        if !self.is_operator_action(line) {
            return;
        }
        let stamped = format!(
            "[{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            line.trim()
        );
        if let Err(e) = self.file.append(&stamped).await {
            tracing::warn!(path = %self.file.path.display(), error = %e, "op log write failed");
        }
    }
}

struct OpLogFile {
    path: PathBuf,
    cap: u64,
    backups: u32,
    written: u64,
    file: fs::File,
}

async fn append_to(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().create(true).append(true).open(path).await
}

impl OpLogFile {
    async fn open(path: PathBuf, cap: u64, backups: u32) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let file = append_to(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            cap,
            backups,
            written,
            file,
        })
    }

    fn backup(&self, n: u32) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Shifts every backup up by one, dropping the oldest, and starts a new
    /// current file.
    async fn roll(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        for n in (1..=self.backups).rev() {
            let from = if n == 1 {
                self.path.clone()
            } else {
                self.backup(n - 1)
            };
            match fs::rename(&from, self.backup(n)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        self.file = append_to(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn append(&mut self, entry: &str) -> io::Result<()> {
        let mut record = entry.trim_end_matches('\n').to_owned();
        record.push('\n');
        let len = record.len() as u64;

        if self.written > 0 && self.written.saturating_add(len) > self.cap {
            if let Err(e) = self.roll().await {
                tracing::warn!(path = %self.path.display(), error = %e, "op log roll failed");
            }
        }
        self.file.write_all(record.as_bytes()).await?;
        self.file.flush().await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}
