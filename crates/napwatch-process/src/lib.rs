use std::fmt;

/// Lifecycle of the managed game server as seen by the watchdog.
///
/// NOTE: `manual_stop` and maintenance are overlays kept next to this state,
/// not extra variants. They suppress auto-start without changing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn is_transition(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Container state as reported by the runtime's `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Restarting => f.write_str("restarting"),
            Self::Paused => f.write_str("paused"),
            Self::Exited => f.write_str("exited"),
            Self::Dead => f.write_str("dead"),
            Self::Unknown(s) if s.is_empty() => f.write_str("unknown"),
            Self::Unknown(s) => write!(f, "unknown ({s})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContainerHealth {
    Starting,
    Healthy,
    Unhealthy,
}

impl ContainerHealth {
    /// Matches on substrings so decorated output ("(healthy)") still parses.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_ascii_lowercase();
        if s.contains("unhealthy") {
            Some(Self::Unhealthy)
        } else if s.contains("healthy") {
            Some(Self::Healthy)
        } else if s.contains("starting") {
            Some(Self::Starting)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub health: Option<ContainerHealth>,
}

impl ContainerStatus {
    pub fn unknown() -> Self {
        Self {
            state: ContainerState::Unknown(String::new()),
            health: None,
        }
    }

    /// Parses `<state>|<health>` as produced by the inspect format string.
    /// The health part is optional (containers without a healthcheck).
    pub fn parse_inspect(line: &str) -> Self {
        let line = line.lines().next().unwrap_or_default();
        let (state, health) = match line.split_once('|') {
            Some((s, h)) => (s, Some(h)),
            None => (line, None),
        };
        Self {
            state: ContainerState::parse(state),
            health: health.and_then(ContainerHealth::parse),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Running and not reporting a failed or pending healthcheck.
    pub fn is_serving(&self) -> bool {
        self.is_running() && matches!(self.health, None | Some(ContainerHealth::Healthy))
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.health {
            Some(h) => write!(f, "{} ({:?})", self.state, h),
            None => write!(f, "{}", self.state),
        }
    }
}

/// Outcome of a lifecycle action. Failures are values, not errors, so
/// callers (chat commands, schedules) decide whether to notify anyone.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActionResult {
    pub ok: bool,
    pub message: String,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inspect_running_without_healthcheck() {
        let st = ContainerStatus::parse_inspect("running|\n");
        assert_eq!(st.state, ContainerState::Running);
        assert_eq!(st.health, None);
        assert!(st.is_serving());
    }

    #[test]
    fn parse_inspect_unhealthy_is_not_serving() {
        let st = ContainerStatus::parse_inspect("running|unhealthy");
        assert_eq!(st.health, Some(ContainerHealth::Unhealthy));
        assert!(st.is_running());
        assert!(!st.is_serving());
    }

    #[test]
    fn parse_inspect_health_starting() {
        let st = ContainerStatus::parse_inspect("running|starting");
        assert_eq!(st.health, Some(ContainerHealth::Starting));
        assert!(!st.is_serving());
    }

    #[test]
    fn parse_inspect_exited_plain() {
        let st = ContainerStatus::parse_inspect("exited");
        assert_eq!(st.state, ContainerState::Exited);
        assert!(!st.is_running());
    }

    #[test]
    fn parse_inspect_garbage_is_unknown() {
        let st = ContainerStatus::parse_inspect("Error: No such object: wvh");
        assert!(matches!(st.state, ContainerState::Unknown(_)));
        assert!(!st.is_running());
    }

    #[test]
    fn lifecycle_state_serializes_as_variant_name() {
        let s = serde_json::to_string(&LifecycleState::Starting).unwrap();
        assert_eq!(s, "\"Starting\"");
        assert!(LifecycleState::Stopping.is_transition());
        assert!(!LifecycleState::Running.is_transition());
    }
}
