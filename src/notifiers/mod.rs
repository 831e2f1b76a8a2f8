//! Notification dispatch: one entity per configured channel, a sum type
//! over the five transports and a dispatcher that truncates, sends and
//! records the per-notifier send outcome.

pub mod discord;
pub mod email;
pub mod slack;
pub mod telegram;
pub mod webhook;

use std::fmt;

use log::{error, info};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::StewardError;
use discord::DiscordNotifier;
use email::EmailNotifier;
use slack::SlackNotifier;
use telegram::TelegramNotifier;
use webhook::{WebhookMethod, WebhookNotifier};

/// Transports cut messages beyond this many Unicode scalar values.
const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierKind {
    Telegram,
    Slack,
    Discord,
    Webhook,
    Email,
}

impl fmt::Display for NotifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifierKind::Telegram => "TELEGRAM",
            NotifierKind::Slack => "SLACK",
            NotifierKind::Discord => "DISCORD",
            NotifierKind::Webhook => "WEBHOOK",
            NotifierKind::Email => "EMAIL",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for NotifierKind {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "TELEGRAM" => Ok(NotifierKind::Telegram),
            "SLACK" => Ok(NotifierKind::Slack),
            "DISCORD" => Ok(NotifierKind::Discord),
            "WEBHOOK" => Ok(NotifierKind::Webhook),
            "EMAIL" => Ok(NotifierKind::Email),
            other => Err(StewardError::validation(format!(
                "unknown notifier kind: {other}"
            ))),
        }
    }
}

/// One variant per transport, each exposing validate + send.
#[derive(Clone)]
pub enum NotifierChannel {
    Telegram(TelegramNotifier),
    Slack(SlackNotifier),
    Discord(DiscordNotifier),
    Webhook(WebhookNotifier),
    Email(EmailNotifier),
}

impl NotifierChannel {
    pub fn kind(&self) -> NotifierKind {
        match self {
            NotifierChannel::Telegram(_) => NotifierKind::Telegram,
            NotifierChannel::Slack(_) => NotifierKind::Slack,
            NotifierChannel::Discord(_) => NotifierKind::Discord,
            NotifierChannel::Webhook(_) => NotifierKind::Webhook,
            NotifierChannel::Email(_) => NotifierKind::Email,
        }
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        match self {
            NotifierChannel::Telegram(t) => t.validate(),
            NotifierChannel::Slack(s) => s.validate(),
            NotifierChannel::Discord(d) => d.validate(),
            NotifierChannel::Webhook(w) => w.validate(),
            NotifierChannel::Email(e) => e.validate(),
        }
    }

    async fn send(
        &self,
        http: &reqwest::Client,
        heading: &str,
        message: &str,
    ) -> Result<(), StewardError> {
        match self {
            NotifierChannel::Telegram(t) => t.send(http, heading, message).await,
            NotifierChannel::Slack(s) => s.send(http, heading, message).await,
            NotifierChannel::Discord(d) => d.send(http, heading, message).await,
            NotifierChannel::Webhook(w) => w.send(http, heading, message).await,
            NotifierChannel::Email(e) => e.send(heading, message).await,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub channel: NotifierChannel,
    pub last_send_error: Option<String>,
}

impl Notifier {
    pub fn kind(&self) -> NotifierKind {
        self.channel.kind()
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        if self.name.is_empty() {
            return Err(StewardError::validation("notifier name is required"));
        }
        self.channel.validate()
    }
}

/// Cuts the message at the transport limit, counting scalar values rather
/// than bytes so multi-byte text cannot split mid-character.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message.to_string();
    }
    message.chars().take(MAX_MESSAGE_CHARS).collect()
}

#[derive(sqlx::FromRow)]
struct NotifierRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    kind: String,
    last_send_error: Option<String>,
}

#[derive(Clone)]
pub struct NotifierRepository {
    pool: PgPool,
}

impl NotifierRepository {
    pub fn new(pool: PgPool) -> Self {
        NotifierRepository { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Notifier, StewardError> {
        let row: Option<NotifierRow> = sqlx::query_as(
            "SELECT id, owner_id, name, kind, last_send_error FROM notifiers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StewardError::NotFound {
            entity: "notifier",
            id,
        })?;
        self.hydrate(row).await
    }

    pub async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Notifier>, StewardError> {
        let mut notifiers = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_by_id(*id).await {
                Ok(n) => notifiers.push(n),
                // A dangling link should not silence the remaining channels
                Err(StewardError::NotFound { .. }) => {
                    error!("Notifier {} is linked but no longer exists", id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(notifiers)
    }

    pub async fn find_all_by_owner(&self, owner_id: Uuid) -> Result<Vec<Notifier>, StewardError> {
        let rows: Vec<NotifierRow> = sqlx::query_as(
            "SELECT id, owner_id, name, kind, last_send_error
             FROM notifiers WHERE owner_id = $1 ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut notifiers = Vec::with_capacity(rows.len());
        for row in rows {
            notifiers.push(self.hydrate(row).await?);
        }
        Ok(notifiers)
    }

    async fn hydrate(&self, row: NotifierRow) -> Result<Notifier, StewardError> {
        let kind = NotifierKind::try_from(row.kind)?;
        let channel = match kind {
            NotifierKind::Telegram => {
                let (bot_token, chat_id): (String, String) = sqlx::query_as(
                    "SELECT bot_token, chat_id FROM telegram_notifiers WHERE notifier_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                NotifierChannel::Telegram(TelegramNotifier { bot_token, chat_id })
            }
            NotifierKind::Slack => {
                let (bot_token, channel_id): (String, String) = sqlx::query_as(
                    "SELECT bot_token, channel_id FROM slack_notifiers WHERE notifier_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                NotifierChannel::Slack(SlackNotifier {
                    bot_token,
                    channel_id,
                })
            }
            NotifierKind::Discord => {
                let (webhook_url,): (String,) = sqlx::query_as(
                    "SELECT webhook_url FROM discord_notifiers WHERE notifier_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                NotifierChannel::Discord(DiscordNotifier { webhook_url })
            }
            NotifierKind::Webhook => {
                let (url, method): (String, String) = sqlx::query_as(
                    "SELECT webhook_url, webhook_method
                     FROM webhook_notifiers WHERE notifier_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                NotifierChannel::Webhook(WebhookNotifier {
                    url,
                    method: WebhookMethod::try_from(method)?,
                })
            }
            NotifierKind::Email => {
                let row_data: (String, String, i32, String, String) = sqlx::query_as(
                    "SELECT target_email, smtp_host, smtp_port, smtp_user, smtp_password
                     FROM email_notifiers WHERE notifier_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                NotifierChannel::Email(EmailNotifier {
                    target_email: row_data.0,
                    smtp_host: row_data.1,
                    smtp_port: row_data.2 as u16,
                    smtp_user: row_data.3,
                    smtp_password: row_data.4,
                })
            }
        };

        Ok(Notifier {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            channel,
            last_send_error: row.last_send_error,
        })
    }

    /// Saves the notifier and its transport row in one transaction.
    pub async fn save(&self, notifier: &Notifier) -> Result<(), StewardError> {
        notifier.validate()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO notifiers (id, owner_id, name, kind, last_send_error)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name, kind = EXCLUDED.kind,
                 last_send_error = EXCLUDED.last_send_error",
        )
        .bind(notifier.id)
        .bind(notifier.owner_id)
        .bind(&notifier.name)
        .bind(notifier.kind().to_string())
        .bind(&notifier.last_send_error)
        .execute(&mut *tx)
        .await?;

        match &notifier.channel {
            NotifierChannel::Telegram(t) => {
                sqlx::query(
                    "INSERT INTO telegram_notifiers (notifier_id, bot_token, chat_id)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (notifier_id) DO UPDATE
                     SET bot_token = EXCLUDED.bot_token, chat_id = EXCLUDED.chat_id",
                )
                .bind(notifier.id)
                .bind(&t.bot_token)
                .bind(&t.chat_id)
                .execute(&mut *tx)
                .await?;
            }
            NotifierChannel::Slack(s) => {
                sqlx::query(
                    "INSERT INTO slack_notifiers (notifier_id, bot_token, channel_id)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (notifier_id) DO UPDATE
                     SET bot_token = EXCLUDED.bot_token, channel_id = EXCLUDED.channel_id",
                )
                .bind(notifier.id)
                .bind(&s.bot_token)
                .bind(&s.channel_id)
                .execute(&mut *tx)
                .await?;
            }
            NotifierChannel::Discord(d) => {
                sqlx::query(
                    "INSERT INTO discord_notifiers (notifier_id, webhook_url)
                     VALUES ($1, $2)
                     ON CONFLICT (notifier_id) DO UPDATE
                     SET webhook_url = EXCLUDED.webhook_url",
                )
                .bind(notifier.id)
                .bind(&d.webhook_url)
                .execute(&mut *tx)
                .await?;
            }
            NotifierChannel::Webhook(w) => {
                sqlx::query(
                    "INSERT INTO webhook_notifiers (notifier_id, webhook_url, webhook_method)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (notifier_id) DO UPDATE
                     SET webhook_url = EXCLUDED.webhook_url,
                         webhook_method = EXCLUDED.webhook_method",
                )
                .bind(notifier.id)
                .bind(&w.url)
                .bind(w.method.to_string())
                .execute(&mut *tx)
                .await?;
            }
            NotifierChannel::Email(e) => {
                sqlx::query(
                    "INSERT INTO email_notifiers
                       (notifier_id, target_email, smtp_host, smtp_port, smtp_user, smtp_password)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (notifier_id) DO UPDATE
                     SET target_email = EXCLUDED.target_email,
                         smtp_host = EXCLUDED.smtp_host, smtp_port = EXCLUDED.smtp_port,
                         smtp_user = EXCLUDED.smtp_user,
                         smtp_password = EXCLUDED.smtp_password",
                )
                .bind(notifier.id)
                .bind(&e.target_email)
                .bind(&e.smtp_host)
                .bind(e.smtp_port as i32)
                .bind(&e.smtp_user)
                .bind(&e.smtp_password)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StewardError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "telegram_notifiers",
            "slack_notifiers",
            "discord_notifiers",
            "webhook_notifiers",
            "email_notifiers",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE notifier_id = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM database_notifiers WHERE notifier_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM notifiers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_last_send_error(
        &self,
        id: Uuid,
        error: Option<&str>,
    ) -> Result<(), StewardError> {
        sqlx::query("UPDATE notifiers SET last_send_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Formats and sends one event to one notifier, persisting the outcome on
/// the notifier row. Send failures are recorded, not propagated; one dead
/// channel must not mute the others.
#[derive(Clone)]
pub struct NotificationService {
    repository: NotifierRepository,
    http: reqwest::Client,
}

impl NotificationService {
    pub fn new(repository: NotifierRepository) -> Self {
        NotificationService {
            repository,
            http: reqwest::Client::new(),
        }
    }

    pub fn repository(&self) -> &NotifierRepository {
        &self.repository
    }

    pub async fn get_notifier_with_auth(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Notifier, StewardError> {
        let notifier = self.repository.find_by_id(id).await?;
        if notifier.owner_id != user_id {
            return Err(StewardError::AccessDenied);
        }
        Ok(notifier)
    }

    pub async fn list_notifiers(&self, user_id: Uuid) -> Result<Vec<Notifier>, StewardError> {
        self.repository.find_all_by_owner(user_id).await
    }

    pub async fn save_notifier(
        &self,
        user_id: Uuid,
        notifier: &Notifier,
    ) -> Result<(), StewardError> {
        if notifier.owner_id != user_id {
            return Err(StewardError::AccessDenied);
        }
        self.repository.save(notifier).await
    }

    pub async fn delete_notifier(&self, user_id: Uuid, id: Uuid) -> Result<(), StewardError> {
        let notifier = self.get_notifier_with_auth(user_id, id).await?;
        self.repository.delete(notifier.id).await
    }

    /// Sends a test message through the channel and reports the outcome
    /// to the caller as well as onto the notifier row.
    pub async fn test_notifier(&self, user_id: Uuid, id: Uuid) -> Result<(), StewardError> {
        let notifier = self.get_notifier_with_auth(user_id, id).await?;

        let result = notifier
            .channel
            .send(
                &self.http,
                "Test notification",
                "If you can read this, the notifier is configured correctly.",
            )
            .await;

        match &result {
            Ok(()) => self.repository.set_last_send_error(id, None).await?,
            Err(e) => {
                self.repository
                    .set_last_send_error(id, Some(&e.to_string()))
                    .await?
            }
        }
        result
    }

    pub async fn send_notification(&self, notifier: &Notifier, heading: &str, message: &str) {
        let heading = truncate_message(heading);
        let message = truncate_message(message);

        match notifier.channel.send(&self.http, &heading, &message).await {
            Ok(()) => {
                info!("Sent notification via {} ({})", notifier.name, notifier.kind());
                if let Err(e) = self.repository.set_last_send_error(notifier.id, None).await {
                    error!("Failed to clear last send error: {}", e);
                }
            }
            Err(e) => {
                error!(
                    "Failed to send notification via {} ({}): {}",
                    notifier.name,
                    notifier.kind(),
                    e
                );
                if let Err(persist_err) = self
                    .repository
                    .set_last_send_error(notifier.id, Some(&e.to_string()))
                    .await
                {
                    error!("Failed to record last send error: {}", persist_err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_kind_round_trips_through_text() {
        for kind in [
            NotifierKind::Telegram,
            NotifierKind::Slack,
            NotifierKind::Discord,
            NotifierKind::Webhook,
            NotifierKind::Email,
        ] {
            assert_eq!(NotifierKind::try_from(kind.to_string()).unwrap(), kind);
        }
        assert!(NotifierKind::try_from("PAGER".to_string()).is_err());
    }

    #[test]
    fn truncation_counts_scalar_values_not_bytes() {
        let short = "под контролем";
        assert_eq!(truncate_message(short), short);

        let long: String = "я".repeat(2500);
        let cut = truncate_message(&long);
        assert_eq!(cut.chars().count(), 2000);

        let ascii: String = "x".repeat(1999);
        assert_eq!(truncate_message(&ascii), ascii);
    }

    #[test]
    fn notifier_requires_name() {
        let notifier = Notifier {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: String::new(),
            channel: NotifierChannel::Discord(DiscordNotifier {
                webhook_url: "https://discord.com/api/webhooks/1/abc".to_string(),
            }),
            last_send_error: None,
        };
        assert!(notifier.validate().is_err());
    }
}
