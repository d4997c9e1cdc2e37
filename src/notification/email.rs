//! Email channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::models::event::ApprovalCreated;
use crate::notification::webhook::DeliveryReport;

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<DeliveryReport>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub starttls: bool,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let mut builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .with_context(|| format!("invalid SMTP relay {}", settings.host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        builder = builder.port(settings.port);

        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = settings
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid SMTP_FROM address '{}'", settings.from))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<DeliveryReport> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone());
        for to in &message.to {
            let mailbox = to
                .parse::<Mailbox>()
                .with_context(|| format!("invalid recipient '{}'", to))?;
            builder = builder.to(mailbox);
        }

        let email = builder
            .multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                message.html.clone(),
            ))
            .context("failed to build email")?;

        let response = self
            .transport
            .send(email)
            .await
            .context("SMTP send failed")?;

        let code = response.code().to_string().parse::<u16>().ok();
        tracing::info!(recipients = message.to.len(), code = ?code, "email sent");
        Ok(DeliveryReport {
            ok: response.is_positive(),
            status: code,
            body: None,
            error: None,
        })
    }
}

/// Build the approval email for `recipients`.
pub fn compose(notification: &ApprovalCreated, recipients: &[String], subject_prefix: &str) -> EmailMessage {
    let title = notification.title.as_deref().unwrap_or("Approval request");
    let created = notification.created_at.as_deref().unwrap_or("unknown");
    let variables = notification
        .snapshot_summary
        .get("variables")
        .filter(|v| !v.is_null())
        .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
        .unwrap_or_else(|| "(none)".to_string());

    let text = format!(
        "{title}\n\nContext: {ctx}\nCreated: {created}\n\nVariables:\n{variables}\n",
        ctx = notification.context_id,
    );
    let html = format!(
        "<h2>{title}</h2>\
         <p><strong>Context:</strong> {ctx}<br><strong>Created:</strong> {created}</p>\
         <h3>Variables</h3><pre>{variables}</pre>",
        title = escape_html(title),
        ctx = escape_html(&notification.context_id),
        created = escape_html(created),
        variables = escape_html(&variables),
    );

    EmailMessage {
        to: recipients.to_vec(),
        subject: format!("{subject_prefix}{title}"),
        text,
        html,
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compose_defaults_title_and_escapes() {
        let n = ApprovalCreated::new(
            "ctx-<1>".into(),
            Some("alice".into()),
            None,
            "2025-01-01T00:00:00Z".into(),
            json!({"variables": {"env": "prod"}}),
        );
        let mail = compose(&n, &["a@example.com".into()], "[HITL] ");
        assert_eq!(mail.subject, "[HITL] Approval request");
        assert!(mail.html.contains("ctx-&lt;1&gt;"));
        assert!(mail.text.contains("\"env\": \"prod\""));
    }

    #[test]
    fn test_smtp_mailer_rejects_bad_from() {
        let settings = SmtpSettings {
            host: "localhost".into(),
            port: 1025,
            from: "not an address".into(),
            username: None,
            password: None,
            starttls: false,
        };
        assert!(SmtpMailer::new(&settings).is_err());
    }
}
