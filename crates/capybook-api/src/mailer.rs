//! Outbound mail
//!
//! Delivery sits behind the [`Mailer`] trait. Handlers never wait on it:
//! [`dispatch`] hands the message to a background task and failures are
//! only logged.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A rendered message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    /// Welcome mail carrying the plaintext activation code
    pub fn welcome(recipient: &str, username: &str, activation_code: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            subject: "Welcome to Capybook!".to_string(),
            body: format!(
                "Hi {username},\n\n\
                 Thanks for signing up for a Capybook account.\n\n\
                 Please send a PUT request to /api/v1/users/activated with the following \
                 JSON body to activate your account:\n\n\
                 {{\"code\": \"{activation_code}\"}}\n\n\
                 This code expires in 3 days and can only be used once.\n"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mail delivery failed: {0}")]
    Delivery(String),
}

/// Mail delivery backend
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Mailer that only logs envelopes
///
/// Used when no delivery backend is configured. The body is not logged.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        tracing::info!(
            recipient = %message.recipient,
            subject = %message.subject,
            "mail accepted for delivery"
        );
        Ok(())
    }
}

/// Deliver `message` on a background task
pub fn dispatch(mailer: Arc<dyn Mailer>, message: MailMessage) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = mailer.send(&message).await {
            tracing::error!(recipient = %message.recipient, error = %e, "background mail failed");
        }
    })
}
