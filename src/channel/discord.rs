//! Discord approval channel: webhook post + reaction polling.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::channel::{ApprovalChannel, Verdict};
use crate::config::DiscordConfig;
use crate::error::ChannelError;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const POLL_INTERVAL: Duration = Duration::from_millis(2500);

const APPROVE_EMOJI: &str = "\u{2705}"; // ✅
const DENY_EMOJI: &str = "\u{274c}"; // ❌

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
}

/// Approval channel backed by a Discord webhook (posting) and a bot token
/// (reading reactions on the posted message).
pub struct DiscordChannel {
    http: reqwest::Client,
    webhook_url: String,
    bot_token: String,
    channel_id: String,
}

impl DiscordChannel {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: config.webhook_url.clone(),
            bot_token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
        }
    }

    /// Webhook url with `wait=true` appended, so Discord returns the created
    /// message instead of a 204.
    fn webhook_wait_url(&self) -> String {
        let sep = if self.webhook_url.contains('?') { '&' } else { '?' };
        format!("{}{}wait=true", self.webhook_url, sep)
    }

    /// Whether anyone has reacted to the message with the given emoji.
    /// A 404 means the message is not indexed yet and counts as "no
    /// reactions"; any other non-2xx is an error.
    async fn has_reaction(&self, message_id: &str, emoji: &str) -> Result<bool, ChannelError> {
        let url = format!(
            "{DISCORD_API_BASE}/channels/{}/messages/{}/reactions/{}?limit=1",
            self.channel_id,
            message_id,
            urlencoding::encode(emoji),
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(ChannelError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let users: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| ChannelError::MalformedResponse {
                reason: e.to_string(),
            })?;
        Ok(!users.is_empty())
    }

    async fn post_content(&self, url: &str, content: &str) -> Result<reqwest::Response, ChannelError> {
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ApprovalChannel for DiscordChannel {
    async fn send_approval_request(&self, summary: &str) -> Result<String, ChannelError> {
        let response = self.post_content(&self.webhook_wait_url(), summary).await?;
        let message: WebhookMessage =
            response
                .json()
                .await
                .map_err(|e| ChannelError::MalformedResponse {
                    reason: format!("webhook response missing message id: {e}"),
                })?;
        tracing::debug!(message = %message.id, "approval request posted");
        Ok(message.id)
    }

    async fn wait_for_response(
        &self,
        message_id: &str,
        timeout: Duration,
    ) -> Result<Verdict, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Approve takes precedence when both reactions are present.
            if self.has_reaction(message_id, APPROVE_EMOJI).await? {
                return Ok(Verdict::Approved);
            }
            if self.has_reaction(message_id, DENY_EMOJI).await? {
                return Ok(Verdict::Denied);
            }

            let now = Instant::now();
            if now + POLL_INTERVAL > deadline {
                return Ok(Verdict::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn send_notification(&self, text: &str) -> Result<(), ChannelError> {
        self.post_content(&self.webhook_url, text).await?;
        Ok(())
    }
}
