use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::errors::StewardError;

const MAX_ATTEMPTS: u32 = 5;
// Backoff when Slack rate-limits without a Retry-After header
const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_MULTIPLIER: f64 = 1.5;

#[derive(Clone)]
pub struct SlackNotifier {
    pub bot_token: String,
    /// Channel (C/G), DM (D) or user (U) id
    pub channel_id: String,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.bot_token.is_empty() {
            return Err(StewardError::validation("bot token is required"));
        }
        if self.channel_id.is_empty() {
            return Err(StewardError::validation("target channel ID is required"));
        }
        if !['C', 'G', 'D', 'U']
            .iter()
            .any(|p| self.channel_id.starts_with(*p))
        {
            return Err(StewardError::validation(
                "target channel ID must be a valid Slack channel ID (starts with C, G, D) \
                 or user ID (starts with U)",
            ));
        }
        Ok(())
    }

    /// Posts via chat.postMessage, honouring Retry-After on 429 with
    /// exponential growth between attempts.
    pub async fn send(
        &self,
        http: &reqwest::Client,
        heading: &str,
        message: &str,
    ) -> Result<(), StewardError> {
        let full = if message.is_empty() {
            format!("*{heading}*")
        } else {
            format!("*{heading}*\n\n{message}")
        };
        let payload = serde_json::json!({
            "channel": self.channel_id,
            "text": full,
            "mrkdwn": true,
        });

        let mut backoff = DEFAULT_BACKOFF;
        let mut attempts = 0;

        loop {
            attempts += 1;

            let resp = http
                .post("https://slack.com/api/chat.postMessage")
                .bearer_auth(&self.bot_token)
                .json(&payload)
                .send()
                .await
                .map_err(|e| StewardError::NotifierSend(format!("slack request failed: {e}")))?;

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempts >= MAX_ATTEMPTS {
                    return Err(StewardError::NotifierSend(format!(
                        "rate-limited after {attempts} attempts, giving up"
                    )));
                }

                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);

                warn!(
                    "Slack rate-limited, retrying in {:?} (attempt {})",
                    retry_after, attempts
                );
                tokio::time::sleep(retry_after).await;
                backoff = backoff.mul_f64(BACKOFF_MULTIPLIER);
                continue;
            }

            // Slack answers 200 even for logical errors; the body decides
            let body: SlackResponse = resp
                .json()
                .await
                .map_err(|e| StewardError::NotifierSend(format!("decode slack response: {e}")))?;

            if !body.ok {
                return Err(StewardError::NotifierSend(format!(
                    "slack API error: {}",
                    body.error.unwrap_or_else(|| "unknown".to_string())
                )));
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(channel_id: &str) -> SlackNotifier {
        SlackNotifier {
            bot_token: "xoxb-token".to_string(),
            channel_id: channel_id.to_string(),
        }
    }

    #[test]
    fn channel_id_must_carry_a_known_prefix() {
        assert!(notifier("C0123456").validate().is_ok());
        assert!(notifier("G0123456").validate().is_ok());
        assert!(notifier("D0123456").validate().is_ok());
        assert!(notifier("U0123456").validate().is_ok());

        assert!(notifier("X0123456").validate().is_err());
        assert!(notifier("#general").validate().is_err());
        assert!(notifier("").validate().is_err());
    }

    #[test]
    fn token_is_required() {
        let mut n = notifier("C0123456");
        n.bot_token.clear();
        assert!(n.validate().is_err());
    }
}
