use std::time::Duration;

use anyhow::Context;
use napwatch_process::ContainerStatus;
use tokio::process::Command;

use crate::config::RuntimeConfig;

const INSPECT_FORMAT: &str = "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";

/// The container runtime, treated as an opaque collaborator.
///
/// Every call is bounded by a timeout and reports failures as errors; callers
/// turn them into `ActionResult`s.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn restart(&self) -> anyhow::Result<()>;
    async fn status(&self) -> anyhow::Result<ContainerStatus>;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("`{command}` timed out after {}ms", timeout.as_millis())]
    Timeout { command: String, timeout: Duration },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {exit_code:?}: {stderr_tail}")]
    NonZeroExit {
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

/// Shells out to a docker-compatible CLI (`docker`, `podman`, `sudo docker`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    base_args: Vec<String>,
    container: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        let mut parts = cfg.program.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "docker".to_string());
        Self {
            program,
            base_args: parts.collect(),
            container: cfg.container.clone(),
            timeout: cfg.command_timeout,
        }
    }

    #[cfg(test)]
    pub fn with_command(
        program: impl Into<String>,
        base_args: Vec<String>,
        container: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            container: container.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, CommandError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args).args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CommandError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| CommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CommandError::NonZeroExit {
                command,
                exit_code: output.status.code(),
                stderr_tail: tail_chars(stderr.trim(), 200),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn verb(&self, verb: &str) -> anyhow::Result<()> {
        tracing::debug!(verb, container = %self.container, "container runtime call");
        self.run(&[verb, &self.container])
            .await
            .with_context(|| format!("{verb} container {}", self.container))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self) -> anyhow::Result<()> {
        self.verb("start").await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.verb("stop").await
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.verb("restart").await
    }

    async fn status(&self) -> anyhow::Result<ContainerStatus> {
        let out = self
            .run(&["inspect", "-f", INSPECT_FORMAT, &self.container])
            .await
            .with_context(|| format!("inspect container {}", self.container))?;
        Ok(ContainerStatus::parse_inspect(out.trim()))
    }
}

fn tail_chars(value: &str, max_chars: usize) -> String {
    let total_chars = value.chars().count();
    if total_chars <= max_chars {
        return value.to_string();
    }
    value.chars().skip(total_chars - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use napwatch_process::{ContainerHealth, ContainerState};

    use super::*;

    fn sh(script: &str) -> DockerCli {
        DockerCli::with_command(
            "sh",
            vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            "wvh",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn from_config_splits_program_prefix() {
        let cli = DockerCli::from_config(&RuntimeConfig {
            program: "sudo docker".to_string(),
            container: "wvh".to_string(),
            command_timeout: Duration::from_secs(10),
        });
        assert_eq!(cli.program, "sudo");
        assert_eq!(cli.base_args, vec!["docker"]);
    }

    #[tokio::test]
    async fn status_parses_inspect_output() {
        let cli = sh("printf 'running|healthy\\n'");
        let st = cli.status().await.unwrap();
        assert_eq!(st.state, ContainerState::Running);
        assert_eq!(st.health, Some(ContainerHealth::Healthy));
    }

    #[tokio::test]
    async fn verb_receives_container_name() {
        // $1 is the verb, $2 the container.
        let cli = sh("test \"$1\" = start && test \"$2\" = wvh");
        cli.start().await.unwrap();
        assert!(cli.stop().await.is_err());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let cli = sh("echo 'no such container' >&2; exit 3");
        let err = cli.status().await.unwrap_err();
        let msg = crate::support::format_error_chain(&err);
        assert!(msg.contains("inspect container wvh"), "{msg}");
        assert!(msg.contains("no such container"), "{msg}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let cli = DockerCli::with_command(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string(), "sh".to_string()],
            "wvh",
            Duration::from_millis(200),
        );
        let err = cli.restart().await.unwrap_err();
        assert!(crate::support::format_error_chain(&err).contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let cli = DockerCli::with_command(
            "/nonexistent/napwatch-runtime",
            Vec::new(),
            "wvh",
            Duration::from_secs(1),
        );
        let err = cli.start().await.unwrap_err();
        assert!(crate::support::format_error_chain(&err).contains("failed to spawn"));
    }
}
