use crate::errors::StewardError;

#[derive(Clone)]
pub struct TelegramNotifier {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramNotifier {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.bot_token.is_empty() {
            return Err(StewardError::validation("bot token is required"));
        }
        if self.chat_id.is_empty() {
            return Err(StewardError::validation("target chat ID is required"));
        }
        Ok(())
    }

    pub async fn send(
        &self,
        http: &reqwest::Client,
        heading: &str,
        message: &str,
    ) -> Result<(), StewardError> {
        let full_message = if message.is_empty() {
            heading.to_string()
        } else {
            format!("{heading}\n\n{message}")
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = http
            .post(url)
            .form(&[
                ("chat_id", self.chat_id.as_str()),
                ("text", full_message.as_str()),
                ("parse_mode", "HTML"),
            ])
            .send()
            .await
            .map_err(|e| StewardError::NotifierSend(format!("telegram request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StewardError::NotifierSend(format!(
                "telegram API returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_token_and_chat() {
        let ok = TelegramNotifier {
            bot_token: "123:abc".to_string(),
            chat_id: "-100200300".to_string(),
        };
        assert!(ok.validate().is_ok());

        let mut missing = ok.clone();
        missing.bot_token.clear();
        assert!(missing.validate().is_err());

        let mut missing = ok;
        missing.chat_id.clear();
        assert!(missing.validate().is_err());
    }
}
