//! In-process fakes for the container runtime and the chat channel.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use napwatch_process::{ContainerHealth, ContainerState, ContainerStatus};

use crate::config::LifecycleConfig;
use crate::container::ContainerRuntime;
use crate::discord::{ChatMessage, Notifier};
use crate::lifecycle::LifecycleController;

/// Short timeouts, no port probe.
pub fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        port: 0,
        start_timeout: Duration::from_millis(300),
        stop_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        start_retries: 2,
        start_retry_delay: Duration::ZERO,
        port_probe: false,
        force_release: false,
    }
}

pub fn controller(rt: &Arc<FakeRuntime>) -> Arc<LifecycleController> {
    Arc::new(LifecycleController::new(rt.clone(), lifecycle_config()))
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    status: Mutex<Option<ContainerStatus>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub restarts: AtomicUsize,
    /// Number of upcoming start calls that fail.
    pub failing_starts: AtomicUsize,
    /// Keep reporting the container as running after a stop.
    pub ignore_stop: AtomicBool,
    /// Keep reporting the container as exited after a start.
    pub ignore_start: AtomicBool,
    pub start_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn stopped() -> Self {
        let rt = Self::default();
        rt.set_state(ContainerState::Exited, None);
        rt
    }

    pub fn running() -> Self {
        let rt = Self::default();
        rt.set_state(ContainerState::Running, None);
        rt
    }

    pub fn set_state(&self, state: ContainerState, health: Option<ContainerHealth>) {
        *self.status.lock().unwrap() = Some(ContainerStatus { state, health });
    }

    /// Makes `inspect` fail, as if the container was removed.
    pub fn clear_state(&self) {
        *self.status.lock().unwrap() = None;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("simulated start failure");
        }
        if !self.ignore_start.load(Ordering::SeqCst) {
            self.set_state(ContainerState::Running, None);
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_stop.load(Ordering::SeqCst) {
            self.set_state(ContainerState::Exited, None);
        }
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.set_state(ContainerState::Running, None);
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<ContainerStatus> {
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no such container"))
    }
}

#[derive(Debug)]
pub struct FakeNotifier {
    broadcast_channels: Vec<String>,
    console_channel: String,
    pub sent: Mutex<Vec<(String, String)>>,
    pub inbox: Mutex<Vec<ChatMessage>>,
}

impl Default for FakeNotifier {
    fn default() -> Self {
        Self {
            broadcast_channels: vec!["b1".to_string(), "b2".to_string()],
            console_channel: "console".to_string(),
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
        }
    }
}

impl FakeNotifier {
    pub fn texts(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn push_message(&self, id: u64, content: &str) {
        self.inbox.lock().unwrap().push(ChatMessage {
            id: id.to_string(),
            content: content.to_string(),
            author: None,
        });
    }
}

#[async_trait::async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }

    async fn fetch_latest_id(&self, _channel: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|m| m.sort_key())
            .map(|m| m.id.clone()))
    }

    async fn fetch_after(&self, _channel: &str, after: Option<&str>) -> anyhow::Result<Vec<ChatMessage>> {
        let after = after.and_then(|a| a.parse::<u64>().ok()).unwrap_or(0);
        let mut out: Vec<ChatMessage> = self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.sort_key() > after)
            .cloned()
            .collect();
        // Newest first, like the real API.
        out.sort_by_key(|m| std::cmp::Reverse(m.sort_key()));
        Ok(out)
    }

    fn broadcast_channels(&self) -> &[String] {
        &self.broadcast_channels
    }

    fn console_channel(&self) -> &str {
        &self.console_channel
    }
}
