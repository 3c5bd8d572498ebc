//! Delivery tokens and deliverable links.
//!
//! A delivery token is a bare capability: whoever holds a deal id, the token
//! stored on that deal, and a time before `delivery_expires_at` may download
//! the deliverables. Nothing else is checked.

use crate::crm_client::{deal_props, CrmRecord};
use crate::errors::AppError;
use crate::signature::constant_time_compare;
use serde::Serialize;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const DELIVERY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const EMAIL_SUBJECT: &str = "Your purchased lead deliverables";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryGrant {
    pub token: String,
    pub expires_at_ms: i64,
}

/// Fresh random token valid for [`DELIVERY_TTL`] from `now_ms`.
pub fn issue_grant(now_ms: i64) -> DeliveryGrant {
    DeliveryGrant {
        token: Uuid::new_v4().to_string(),
        expires_at_ms: now_ms + DELIVERY_TTL.as_millis() as i64,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryLinks {
    pub deliverables_url: String,
    pub pdf_download_url: String,
    pub csv_download_url: String,
}

impl DeliveryLinks {
    /// Builds the three links under `base_url`, each carrying `deal_id` and `token`.
    pub fn build(base_url: &str, deal_id: &str, token: &str) -> Result<Self, AppError> {
        let link = |endpoint: &str| -> Result<String, AppError> {
            let mut url = Url::parse(&format!("{}/{}", base_url.trim_end_matches('/'), endpoint))
                .map_err(|e| AppError::InternalError(format!("Invalid deliverables URL: {}", e)))?;
            url.query_pairs_mut()
                .append_pair("deal_id", deal_id)
                .append_pair("token", token);
            Ok(url.into())
        };

        Ok(Self {
            deliverables_url: link("deliverables")?,
            pdf_download_url: link("download-pdf")?,
            csv_download_url: link("download-csv")?,
        })
    }

    pub fn email_text(&self) -> String {
        format!(
            "Thanks for your purchase.\n\n\
             Lead deliverables (expires in 24 hours):\n\
             PDF: {}\n\
             CSV: {}\n\
             All-in-one page: {}\n",
            self.pdf_download_url, self.csv_download_url, self.deliverables_url
        )
    }

    pub fn html_page(&self) -> String {
        format!(
            r#"<!doctype html>
<html><head><meta charset="utf-8"><title>Lead Deliverables</title></head>
<body style="font-family:Inter,Arial,sans-serif;padding:24px;">
  <h2>Lead Deliverables</h2>
  <p><a href="{}">Download PDF</a></p>
  <p><a href="{}">Download CSV</a></p>
</body></html>
"#,
            escape_html(&self.pdf_download_url),
            escape_html(&self.csv_download_url)
        )
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Checks a presented token against the deal.
///
/// Every failure is `Forbidden`: unknown deal, no token issued, mismatch, or
/// expiry (which asks the buyer to request a new link).
pub fn verify_access(deal: Option<&CrmRecord>, token: &str, now_ms: i64) -> Result<(), AppError> {
    let deal = deal.ok_or_else(|| AppError::Forbidden("Invalid deal or token".to_string()))?;

    let stored = deal
        .prop(deal_props::DELIVERY_TOKEN)
        .ok_or_else(|| AppError::Forbidden("Invalid deal or token".to_string()))?;
    if !constant_time_compare(&stored, token.trim()) {
        return Err(AppError::Forbidden("Invalid deal or token".to_string()));
    }

    let expires_at = deal
        .prop(deal_props::DELIVERY_EXPIRES_AT)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
        .ok_or_else(|| AppError::Forbidden("Link expired, request a new link".to_string()))?;
    if now_ms >= expires_at {
        return Err(AppError::Forbidden(
            "Link expired, request a new link".to_string(),
        ));
    }

    Ok(())
}
