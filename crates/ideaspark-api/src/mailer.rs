use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::queue::JobHandler;

pub const WELCOME_EMAIL: &str = "welcome_email";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> anyhow::Result<()>;
}

/// Writes outgoing mail to the log instead of delivering it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        info!("Mail to {}: {} ({} bytes)", email.to, email.subject, email.body.len());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub email: String,
    pub username: String,
}

pub struct WelcomeEmail {
    mailer: Arc<dyn Mailer>,
}

impl WelcomeEmail {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for WelcomeEmail {
    fn kind(&self) -> &'static str {
        WELCOME_EMAIL
    }

    async fn handle(&self, payload: &Value) -> anyhow::Result<()> {
        let payload: WelcomePayload =
            serde_json::from_value(payload.clone()).context("bad welcome_email payload")?;
        let email = Email {
            to: payload.email,
            subject: "Welcome to IdeaSpark!".into(),
            body: format!(
                "Hi {},\n\nThanks for joining IdeaSpark. Start a conversation and we'll help you shape your next project idea.\n",
                payload.username
            ),
        };
        self.mailer.send(&email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<Email>>);

    #[async_trait]
    impl Mailer for Outbox {
        async fn send(&self, email: &Email) -> anyhow::Result<()> {
            self.0.lock().await.push(email.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn welcome_mail_is_addressed_to_the_new_user() {
        let outbox = Arc::new(Outbox::default());
        let handler = WelcomeEmail::new(outbox.clone());
        handler
            .handle(&json!({ "email": "ada@example.com", "username": "ada" }))
            .await
            .unwrap();

        let sent = outbox.0.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].subject, "Welcome to IdeaSpark!");
        assert!(sent[0].body.contains("ada"));
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_job() {
        let handler = WelcomeEmail::new(Arc::new(LogMailer));
        assert!(handler.handle(&json!({ "username": "ada" })).await.is_err());
    }
}
