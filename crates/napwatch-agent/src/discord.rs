use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::{StatusCode, header};
use serde::Deserialize;

use crate::config::DiscordConfig;
use crate::support::{format_error_chain, truncate_utf8};

const MAX_CONTENT_BYTES: usize = 2000;
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const RETRY_AFTER_MAX: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Option<ChatAuthor>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatAuthor {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

impl ChatMessage {
    pub fn from_bot(&self) -> bool {
        self.author.as_ref().is_some_and(|a| a.bot)
    }

    /// Snowflake ids sort numerically; non-numeric ids sort first.
    pub fn sort_key(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }
}

/// Outbound notifications and the console channel feed.
///
/// `broadcast` and `console` never fail: delivery problems are logged and
/// swallowed so that a chat outage cannot stall the lifecycle.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()>;
    async fn fetch_latest_id(&self, channel: &str) -> anyhow::Result<Option<String>>;
    /// Messages newer than `after`, in no particular order.
    async fn fetch_after(&self, channel: &str, after: Option<&str>) -> anyhow::Result<Vec<ChatMessage>>;

    fn broadcast_channels(&self) -> &[String];
    fn console_channel(&self) -> &str;

    async fn broadcast(&self, text: &str) {
        for channel in self.broadcast_channels() {
            if let Err(e) = self.send(channel, text).await {
                tracing::warn!(channel = %channel, error = %format_error_chain(&e), "broadcast failed");
            }
        }
    }

    async fn console(&self, text: &str) {
        let channel = self.console_channel();
        if let Err(e) = self.send(channel, text).await {
            tracing::warn!(channel = %channel, error = %format_error_chain(&e), "console message failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    auth: String,
    broadcast_channels: Vec<String>,
    console_channel: String,
}

impl DiscordClient {
    pub fn new(cfg: &DiscordConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("napwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_base: cfg.api_base.clone(),
            auth: format!("Bot {}", cfg.token),
            broadcast_channels: cfg.broadcast_channels.clone(),
            console_channel: cfg.console_channel.clone(),
        })
    }

    fn messages_url(&self, channel: &str) -> String {
        format!("{}/channels/{channel}/messages", self.api_base)
    }

    /// Sends the request built by `build`, retrying rate limits, server errors
    /// and transport failures a bounded number of times.
    async fn execute<F>(&self, what: &str, build: F) -> anyhow::Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let sent = build(&self.http)
                .header(header::AUTHORIZATION, &self.auth)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e).with_context(|| format!("{what}: giving up after {attempt} attempts"));
                    }
                    let delay = backoff_delay(attempt);
                    tracing::warn!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "chat request failed; retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(resp).await;
                if attempt >= MAX_ATTEMPTS {
                    anyhow::bail!("{what}: still rate limited after {attempt} attempts");
                }
                tracing::warn!(what, attempt, wait_ms = wait.as_millis() as u64, "rate limited by chat api");
                tokio::time::sleep(wait).await;
                continue;
            }
            if status.is_server_error() {
                if attempt >= MAX_ATTEMPTS {
                    anyhow::bail!("{what}: HTTP {status} after {attempt} attempts");
                }
                let delay = backoff_delay(attempt);
                tracing::warn!(what, attempt, %status, delay_ms = delay.as_millis() as u64, "chat api server error; retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("{what}: HTTP {status}: {}", truncate_utf8(body.trim(), 300));
            }
            return Ok(resp);
        }
    }
}

#[async_trait::async_trait]
impl Notifier for DiscordClient {
    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "content": truncate_utf8(text, MAX_CONTENT_BYTES) });
        let url = self.messages_url(channel);
        self.execute("send message", |http| http.post(&url).json(&body))
            .await?;
        tracing::debug!(channel, "chat message sent");
        Ok(())
    }

    async fn fetch_latest_id(&self, channel: &str) -> anyhow::Result<Option<String>> {
        let url = self.messages_url(channel);
        let messages: Vec<ChatMessage> = self
            .execute("fetch latest message", |http| http.get(&url).query(&[("limit", "1")]))
            .await?
            .json()
            .await
            .context("parse latest message")?;
        Ok(messages.into_iter().next().map(|m| m.id))
    }

    async fn fetch_after(&self, channel: &str, after: Option<&str>) -> anyhow::Result<Vec<ChatMessage>> {
        let url = self.messages_url(channel);
        let messages: Vec<ChatMessage> = self
            .execute("fetch messages", |http| {
                let req = http.get(&url).query(&[("limit", "50")]);
                match after {
                    Some(id) => req.query(&[("after", id)]),
                    None => req,
                }
            })
            .await?
            .json()
            .await
            .context("parse messages")?;
        Ok(messages)
    }

    fn broadcast_channels(&self) -> &[String] {
        &self.broadcast_channels
    }

    fn console_channel(&self) -> &str {
        &self.console_channel
    }
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

async fn retry_after(resp: reqwest::Response) -> Duration {
    let from_header = resp
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    let from_body = resp
        .json::<RateLimitBody>()
        .await
        .ok()
        .map(|b| b.retry_after);

    let secs = from_body.or(from_header).unwrap_or(1.0);
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::from_millis(100);
    }
    Duration::from_secs_f64(secs).min(RETRY_AFTER_MAX)
}

fn backoff_delay(attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE
        .checked_mul(1u32 << pow)
        .unwrap_or(BACKOFF_MAX)
        .min(BACKOFF_MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}
