use crate::errors::StewardError;

#[derive(Clone)]
pub struct DiscordNotifier {
    pub webhook_url: String,
}

impl DiscordNotifier {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.webhook_url.is_empty() {
            return Err(StewardError::validation("webhook URL is required"));
        }
        Ok(())
    }

    pub async fn send(
        &self,
        http: &reqwest::Client,
        heading: &str,
        message: &str,
    ) -> Result<(), StewardError> {
        let content = if message.is_empty() {
            heading.to_string()
        } else {
            format!("{heading}\n\n{message}")
        };

        let resp = http
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| StewardError::NotifierSend(format!("discord request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StewardError::NotifierSend(format!(
                "discord API returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_webhook_url() {
        let ok = DiscordNotifier {
            webhook_url: "https://discord.com/api/webhooks/1/abc".to_string(),
        };
        assert!(ok.validate().is_ok());

        let missing = DiscordNotifier {
            webhook_url: String::new(),
        };
        assert!(missing.validate().is_err());
    }
}
