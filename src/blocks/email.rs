//! Email block - send mail through the mailer interface.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::BlockOutcome;
use crate::context::ContextSnapshot;
use crate::error::{Error, Result};
use crate::workflow::expression::{render_template, value_to_string};

/// An outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Object-storage keys attached to the message.
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Mail delivery capability. Provider wiring (SMTP, API vendors) lives
/// behind this trait.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Default mailer: refuses to send, with a configuration error.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, _message: &EmailMessage) -> Result<()> {
        Err(Error::Config(
            "No mailer configured; install one on the runner to use send_email blocks".into(),
        ))
    }
}

/// Test mailer that records delivered messages.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Render recipient/subject/body templates, then hand off to the mailer.
pub async fn execute(
    mailer: &Arc<dyn Mailer>,
    to: &[String],
    subject: &str,
    body: &str,
    attachments: &[String],
    snapshot: &ContextSnapshot,
) -> Result<BlockOutcome> {
    let mut recipients = Vec::with_capacity(to.len());
    for recipient in to {
        let rendered = value_to_string(&render_template(recipient, snapshot)?);
        if !rendered.contains('@') {
            return Err(Error::Validation(format!(
                "Invalid email recipient '{}'",
                rendered
            )));
        }
        recipients.push(rendered);
    }

    let message = EmailMessage {
        to: recipients,
        subject: value_to_string(&render_template(subject, snapshot)?),
        body: value_to_string(&render_template(body, snapshot)?),
        attachments: attachments
            .iter()
            .map(|a| render_template(a, snapshot).map(|v| value_to_string(&v)))
            .collect::<Result<Vec<_>>>()?,
    };

    debug!(recipients = message.to.len(), subject = %message.subject, "Sending email block");
    mailer.send(&message).await?;

    Ok(BlockOutcome::completed(json!({
        "sent": true,
        "recipients": message.to,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;

    fn snapshot(values: Vec<(&str, Value)>) -> ContextSnapshot {
        ContextSnapshot::for_tests(
            None,
            values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn renders_templates_and_sends() {
        let mailer = Arc::new(RecordingMailer::default());
        let snap = snapshot(vec![
            ("ops_email", serde_json::json!("ops@example.com")),
            ("total", serde_json::json!(42)),
        ]);

        let outcome = execute(
            &(mailer.clone() as Arc<dyn Mailer>),
            &["${ops_email}".to_string()],
            "Daily total: ${total}",
            "The total is ${total}.",
            &[],
            &snap,
        )
        .await
        .unwrap();

        assert!(outcome.succeeded());
        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["ops@example.com"]);
        assert_eq!(sent[0].subject, "Daily total: 42");
    }

    #[tokio::test]
    async fn invalid_recipient_is_validation_error() {
        let mailer: Arc<dyn Mailer> = Arc::new(RecordingMailer::default());
        let snap = snapshot(vec![]);

        let err = execute(&mailer, &["not-an-address".to_string()], "s", "b", &[], &snap)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn noop_mailer_surfaces_config_error() {
        let mailer: Arc<dyn Mailer> = Arc::new(NoopMailer);
        let snap = snapshot(vec![]);

        let err = execute(&mailer, &["a@b.c".to_string()], "s", "b", &[], &snap)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
