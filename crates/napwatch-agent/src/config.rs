use std::{path::PathBuf, time::Duration};

use chrono::{NaiveTime, Weekday};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub api_base: String,
    pub broadcast_channels: Vec<String>,
    pub console_channel: String,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub program: String,
    pub container: String,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub port: u16,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    pub start_retries: u32,
    pub start_retry_delay: Duration,
    /// Require the game port to be held before calling the server ready.
    pub port_probe: bool,
    pub force_release: bool,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub threshold: usize,
    pub attempt_window: Duration,
    pub base_cooldown: Duration,
    pub success_grace: Duration,
    pub retention: Duration,
    pub max_level: Option<u32>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            attempt_window: Duration::from_secs(15 * 60),
            base_cooldown: Duration::from_secs(30 * 60),
            success_grace: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(7 * 24 * 3600),
            max_level: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub maintenance_days: Vec<Weekday>,
    pub sleep_at: NaiveTime,
    pub wake_at: NaiveTime,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            maintenance_days: vec![Weekday::Tue, Weekday::Thu],
            sleep_at: NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default(),
            wake_at: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub game_log: PathBuf,
    pub watchdog_log: PathBuf,
    pub op_log: PathBuf,
    pub sleep_trigger_dir: PathBuf,
    pub sleep_trigger_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub runtime: RuntimeConfig,
    pub lifecycle: LifecycleConfig,
    pub gate: GateConfig,
    pub calendar: CalendarConfig,
    pub paths: PathsConfig,
    pub accept_timeout: Duration,
    pub presence_window_lines: usize,
    pub maintenance_max_wait: Duration,
    pub op_log_names: Vec<String>,
    pub restart_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let discord = DiscordConfig {
            token: env.required("DISCORD_TOKEN")?,
            api_base: env
                .optional("DISCORD_API_BASE")
                .unwrap_or_else(|| "https://discord.com/api/v10".to_string())
                .trim_end_matches('/')
                .to_string(),
            broadcast_channels: vec![
                env.required("DISCORD_CHANNEL_1")?,
                env.required("DISCORD_CHANNEL_2")?,
            ],
            console_channel: env.required("DISCORD_CONSOLE_CHANNEL")?,
            poll_interval: env.secs("DISCORD_POLL_SECS", 2, 1, 60)?,
        };

        let port = match env.optional("SERVER_PORT") {
            None => return Err(ConfigError::Missing("SERVER_PORT")),
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Invalid {
                        name: "SERVER_PORT",
                        reason: format!("expected a port in 1..65535, got {raw:?}"),
                    });
                }
                Ok(p) => p,
            },
        };

        let runtime = RuntimeConfig {
            program: env
                .optional("CONTAINER_RUNTIME")
                .unwrap_or_else(|| "docker".to_string()),
            container: env
                .optional("DOCKER_CONTAINER")
                .unwrap_or_else(|| "wvh".to_string()),
            command_timeout: env.secs("RUNTIME_COMMAND_TIMEOUT_SECS", 60, 5, 600)?,
        };

        let lifecycle = LifecycleConfig {
            port,
            start_timeout: env.secs("START_TIMEOUT_SECS", 240, 10, 3600)?,
            stop_timeout: env.secs("STOP_TIMEOUT_SECS", 40, 5, 600)?,
            poll_interval: Duration::from_secs(1),
            start_retries: env.u64("START_RETRIES", 2, 1, 10)? as u32,
            start_retry_delay: env.secs("START_RETRY_DELAY_SECS", 30, 0, 600)?,
            port_probe: env.flag("PORT_PROBE", true)?,
            force_release: env.flag("PORT_FORCE_RELEASE", false)?,
        };

        let defaults = GateConfig::default();
        let gate = GateConfig {
            threshold: env.u64("GATE_THRESHOLD", 2, 1, 100)? as usize,
            attempt_window: env.mins("GATE_WINDOW_MINS", 15, 1, 24 * 60)?,
            base_cooldown: env.mins("GATE_BASE_COOLDOWN_MINS", 30, 1, 24 * 60)?,
            success_grace: env.mins("AUTOSTOP_TIMEOUT_MINS", 15, 1, 24 * 60)?,
            retention: env.mins(
                "GATE_RETENTION_MINS",
                defaults.retention.as_secs() / 60,
                60,
                365 * 24 * 60,
            )?,
            max_level: match env.u64("GATE_MAX_COOLDOWN_LEVEL", 0, 0, 64)? {
                0 => None,
                n => Some(n as u32),
            },
        };

        let calendar = CalendarConfig {
            maintenance_days: match env.optional("MAINTENANCE_DAYS") {
                None => CalendarConfig::default().maintenance_days,
                Some(raw) => parse_weekdays(&raw).map_err(|reason| ConfigError::Invalid {
                    name: "MAINTENANCE_DAYS",
                    reason,
                })?,
            },
            sleep_at: env.time("SLEEP_AT", CalendarConfig::default().sleep_at)?,
            wake_at: env.time("WAKE_AT", CalendarConfig::default().wake_at)?,
        };

        let sleep_trigger_dir = PathBuf::from(env.required("SLEEP_TRIGGER_DIR")?);
        let sleep_trigger_file = env
            .optional("SLEEP_TRIGGER_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| sleep_trigger_dir.join("sleep_trigger"));
        let paths = PathsConfig {
            game_log: env
                .optional("MC_LOG")
                .unwrap_or_else(|| "/workspace/data/logs/latest.log".to_string())
                .into(),
            watchdog_log: env
                .optional("WATCHDOG_LOG")
                .unwrap_or_else(|| "/workspace/watchdog/logs/watchdog.log".to_string())
                .into(),
            op_log: env
                .optional("OP_LOG")
                .unwrap_or_else(|| "/workspace/watchdog/logs/op.log".to_string())
                .into(),
            sleep_trigger_dir,
            sleep_trigger_file,
        };

        let restart_hours = env.u64("RESTART_INTERVAL_HOURS", 24, 0, 24 * 30)?;

        Ok(Self {
            discord,
            runtime,
            lifecycle,
            gate,
            calendar,
            paths,
            accept_timeout: env.secs("ACCEPT_TIMEOUT_SECS", 5, 1, 60)?,
            presence_window_lines: env.u64("PRESENCE_WINDOW_LINES", 1000, 100, 50_000)? as usize,
            maintenance_max_wait: env.mins("MAINTENANCE_MAX_WAIT_MINS", 360, 5, 24 * 60)?,
            op_log_names: env
                .optional("OP_LOG_NAMES")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            restart_interval: (restart_hours > 0)
                .then(|| Duration::from_secs(restart_hours * 3600)),
        })
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn u64(&self, name: &'static str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<u64>()
                .map(|v| v.clamp(min, max))
                .map_err(|_| ConfigError::Invalid {
                    name,
                    reason: format!("expected an integer, got {raw:?}"),
                }),
        }
    }

    fn secs(&self, name: &'static str, default: u64, min: u64, max: u64) -> Result<Duration, ConfigError> {
        self.u64(name, default, min, max).map(Duration::from_secs)
    }

    fn mins(&self, name: &'static str, default: u64, min: u64, max: u64) -> Result<Duration, ConfigError> {
        self.u64(name, default, min, max)
            .map(|m| Duration::from_secs(m * 60))
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                name,
                reason: format!("expected a boolean, got {other:?}"),
            }),
        }
    }

    fn time(&self, name: &'static str, default: NaiveTime) -> Result<NaiveTime, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|e| ConfigError::Invalid {
                name,
                reason: format!("expected HH:MM, got {raw:?} ({e})"),
            }),
        }
    }
}

pub(crate) fn parse_weekdays(raw: &str) -> Result<Vec<Weekday>, String> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let day = p
            .parse::<Weekday>()
            .map_err(|_| format!("unknown weekday {p:?}"))?;
        if !out.contains(&day) {
            out.push(day);
        }
    }
    Ok(out)
}
