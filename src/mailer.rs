//! Best-effort transactional email via SendGrid v3.

use crate::config::Config;
use crate::errors::AppError;
use serde_json::json;

/// Result of a send attempt. Sending never fails the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailOutcome {
    Sent,
    NotConfigured,
    Failed(String),
}

impl MailOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, MailOutcome::Sent)
    }
}

#[derive(Clone)]
pub struct Mailer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    from_email: Option<String>,
}

impl Mailer {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to create mail client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.sendgrid_api_base_url.clone(),
            api_key: config.sendgrid_api_key.clone(),
            from_email: config.sendgrid_from_email.clone(),
        })
    }

    /// Sends a plain-text email.
    pub async fn send_text(&self, to: &str, subject: &str, text: &str) -> MailOutcome {
        let (Some(api_key), Some(from)) = (self.api_key.as_deref(), self.from_email.as_deref())
        else {
            tracing::warn!("SendGrid not configured, skipping email");
            return MailOutcome::NotConfigured;
        };
        if to.trim().is_empty() {
            return MailOutcome::Failed("missing recipient".to_string());
        }

        let body = json!({
            "personalizations": [{ "to": [{ "email": to.trim() }] }],
            "from": { "email": from },
            "subject": subject,
            "content": [{ "type": "text/plain", "value": text }],
        });

        let result = self
            .client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Deliverables email sent");
                MailOutcome::Sent
            }
            Ok(response) => {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                tracing::error!("SendGrid returned {}: {}", status, error_text);
                MailOutcome::Failed(format!("SendGrid returned {}", status))
            }
            Err(e) => {
                tracing::error!("SendGrid request failed: {}", e.without_url());
                MailOutcome::Failed("SendGrid request failed".to_string())
            }
        }
    }
}
