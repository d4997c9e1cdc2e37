use serde::{Deserialize, Serialize};

/// Per-approver delivery configuration, read from the `channels` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct ChannelConfig {
    pub username: String,
    pub webhook: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    Email,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Webhook => "webhook",
            ChannelKind::Email => "email",
        }
    }
}

/// A populated channel ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryChannel {
    Webhook { url: String },
    Email { recipients: Vec<String> },
}

impl DeliveryChannel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            DeliveryChannel::Webhook { .. } => ChannelKind::Webhook,
            DeliveryChannel::Email { .. } => ChannelKind::Email,
        }
    }
}

impl ChannelConfig {
    /// Channels with a non-blank value, in delivery order (webhook, then email).
    pub fn delivery_channels(&self) -> Vec<DeliveryChannel> {
        let mut channels = Vec::new();

        if let Some(url) = non_blank(self.webhook.as_deref()) {
            channels.push(DeliveryChannel::Webhook {
                url: url.to_string(),
            });
        }

        if let Some(raw) = non_blank(self.email.as_deref()) {
            let recipients: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !recipients.is_empty() {
                channels.push(DeliveryChannel::Email { recipients });
            }
        }

        channels
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
