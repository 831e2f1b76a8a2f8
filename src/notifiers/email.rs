use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::errors::StewardError;

/// Port 465 speaks TLS from the first byte; every other port negotiates
/// STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Clone)]
pub struct EmailNotifier {
    pub target_email: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
}

impl EmailNotifier {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.target_email.is_empty() {
            return Err(StewardError::validation("target email is required"));
        }
        if self.smtp_host.is_empty() {
            return Err(StewardError::validation("SMTP host is required"));
        }
        if self.smtp_port == 0 {
            return Err(StewardError::validation("SMTP port is required"));
        }
        if self.smtp_user.is_empty() {
            return Err(StewardError::validation("SMTP user is required"));
        }
        if self.smtp_password.is_empty() {
            return Err(StewardError::validation("SMTP password is required"));
        }
        Ok(())
    }

    pub async fn send(&self, heading: &str, message: &str) -> Result<(), StewardError> {
        let email = Message::builder()
            .from(self.smtp_user.parse().map_err(|e| {
                StewardError::NotifierSend(format!("invalid sender address: {e}"))
            })?)
            .to(self.target_email.parse().map_err(|e| {
                StewardError::NotifierSend(format!("invalid recipient address: {e}"))
            })?)
            .subject(heading)
            .header(ContentType::TEXT_HTML)
            .body(message.to_string())
            .map_err(|e| StewardError::NotifierSend(format!("failed to build email: {e}")))?;

        let builder = if self.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp_host)
        }
        .map_err(|e| StewardError::NotifierSend(format!("SMTP transport setup failed: {e}")))?;

        let transport = builder
            .port(self.smtp_port)
            .credentials(Credentials::new(
                self.smtp_user.clone(),
                self.smtp_password.clone(),
            ))
            .authentication(vec![Mechanism::Plain])
            .build();

        transport
            .send(email)
            .await
            .map_err(|e| StewardError::NotifierSend(format!("failed to send email: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> EmailNotifier {
        EmailNotifier {
            target_email: "ops@example.com".to_string(),
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            smtp_user: "steward@example.com".to_string(),
            smtp_password: "pw".to_string(),
        }
    }

    #[test]
    fn validate_requires_every_field() {
        assert!(notifier().validate().is_ok());

        let mut n = notifier();
        n.target_email.clear();
        assert!(n.validate().is_err());

        let mut n = notifier();
        n.smtp_port = 0;
        assert!(n.validate().is_err());

        let mut n = notifier();
        n.smtp_password.clear();
        assert!(n.validate().is_err());
    }
}
