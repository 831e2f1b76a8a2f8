use std::fmt;

use crate::errors::StewardError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookMethod {
    Get,
    Post,
}

impl fmt::Display for WebhookMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WebhookMethod::Get => "GET",
            WebhookMethod::Post => "POST",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for WebhookMethod {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "GET" => Ok(WebhookMethod::Get),
            "POST" => Ok(WebhookMethod::Post),
            other => Err(StewardError::validation(format!(
                "unsupported webhook method: {other}"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct WebhookNotifier {
    pub url: String,
    pub method: WebhookMethod,
}

impl WebhookNotifier {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.url.is_empty() {
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
        let resp = match self.method {
            WebhookMethod::Get => http
                .get(&self.url)
                .query(&[("heading", heading), ("message", message)])
                .send()
                .await,
            WebhookMethod::Post => http
                .post(&self.url)
                .json(&serde_json::json!({ "heading": heading, "message": message }))
                .send()
                .await,
        }
        .map_err(|e| StewardError::NotifierSend(format!("webhook request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StewardError::NotifierSend(format!(
                "webhook {} returned {status}: {body}",
                self.method
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trips_through_text() {
        for method in [WebhookMethod::Get, WebhookMethod::Post] {
            assert_eq!(WebhookMethod::try_from(method.to_string()).unwrap(), method);
        }
        assert!(WebhookMethod::try_from("PUT".to_string()).is_err());
    }

    #[test]
    fn validate_requires_url() {
        let n = WebhookNotifier {
            url: String::new(),
            method: WebhookMethod::Post,
        };
        assert!(n.validate().is_err());
    }
}
