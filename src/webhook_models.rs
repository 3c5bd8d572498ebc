use crate::models::optional_string_or_number;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HubSpot payment webhook body: a bare array of events or `{ "events": [...] }`.
///
/// Elements stay raw here so that one malformed event cannot reject the batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PaymentWebhookPayload {
    Batch(Vec<Value>),
    Wrapped { events: Vec<Value> },
}

impl PaymentWebhookPayload {
    /// Convert to a vec of events for uniform processing, each parsed on its own
    pub fn into_events(self) -> Vec<Result<PaymentEvent, serde_json::Error>> {
        let raw = match self {
            PaymentWebhookPayload::Batch(events) => events,
            PaymentWebhookPayload::Wrapped { events } => events,
        };
        raw.into_iter().map(serde_json::from_value).collect()
    }
}

/// One webhook event. Only the payment object id matters here.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    /// Commerce payment id
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub object_id: Option<String>,
}

/// What happened to one event or one deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FulfillmentOutcome {
    /// Deal marked Sold, token issued.
    Delivered {
        payment_id: String,
        deal_id: String,
        emailed: bool,
    },
    /// Deal was already Sold or Delivered.
    Skipped {
        payment_id: String,
        deal_id: String,
        listing_status: String,
    },
    /// Event without a payment id, or payment not in a succeeded state.
    Ignored {
        payment_id: Option<String>,
        reason: String,
    },
    /// Succeeded payment with no associated deal.
    NoDeals { payment_id: String },
    Failed {
        payment_id: Option<String>,
        deal_id: Option<String>,
        error: String,
    },
}

/// Response sent back to HubSpot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub ok: bool,
    pub received: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub processed_count: usize,
    pub processed: Vec<FulfillmentOutcome>,
}

impl WebhookResponse {
    pub fn from_outcomes(received: usize, processed: Vec<FulfillmentOutcome>) -> Self {
        let count = |pred: fn(&FulfillmentOutcome) -> bool| processed.iter().filter(|o| pred(o)).count();

        Self {
            ok: true,
            received,
            delivered: count(|o| matches!(o, FulfillmentOutcome::Delivered { .. })),
            skipped: count(|o| matches!(o, FulfillmentOutcome::Skipped { .. })),
            failed: count(|o| matches!(o, FulfillmentOutcome::Failed { .. })),
            processed_count: processed.len(),
            processed,
        }
    }
}
