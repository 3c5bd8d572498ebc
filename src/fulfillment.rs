//! Payment-driven fulfillment.
//!
//! A succeeded payment moves each associated deal from Qualified to Sold,
//! stamps a fresh delivery token and emails the buyer their links. Deals
//! already Sold or Delivered are skipped, so replayed webhooks are no-ops.
//! Failures are isolated per event and per deal.

use crate::crm_client::deal_props;
use crate::delivery::{issue_grant, DeliveryGrant, DeliveryLinks, EMAIL_SUBJECT};
use crate::errors::{AppError, ResultExt};
use crate::handlers::AppState;
use crate::models::ListingStatus;
use crate::webhook_models::{FulfillmentOutcome, PaymentEvent};
use serde_json::{json, Map, Value};

const PAYMENT_SUCCEEDED: &str = "succeeded";

/// Processes every event, collecting one or more outcomes per event.
pub async fn process_payment_events(
    state: &AppState,
    events: Vec<Result<PaymentEvent, serde_json::Error>>,
) -> Vec<FulfillmentOutcome> {
    let mut outcomes = Vec::new();

    for event in events {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Skipping malformed webhook event: {}", e);
                outcomes.push(FulfillmentOutcome::Ignored {
                    payment_id: None,
                    reason: "malformed event".to_string(),
                });
                continue;
            }
        };

        let Some(payment_id) = event.object_id else {
            outcomes.push(FulfillmentOutcome::Ignored {
                payment_id: None,
                reason: "missing objectId".to_string(),
            });
            continue;
        };

        match process_payment(state, &payment_id).await {
            Ok(mut event_outcomes) => outcomes.append(&mut event_outcomes),
            Err(e) => {
                tracing::error!("Failed to process payment {}: {}", payment_id, e);
                outcomes.push(FulfillmentOutcome::Failed {
                    payment_id: Some(payment_id),
                    deal_id: None,
                    error: "payment lookup failed".to_string(),
                });
            }
        }
    }

    outcomes
}

async fn process_payment(
    state: &AppState,
    payment_id: &str,
) -> Result<Vec<FulfillmentOutcome>, AppError> {
    let payment = state
        .crm
        .get_payment(payment_id)
        .await
        .with_context(|| format!("reading payment {}", payment_id))?;

    let Some(payment) = payment else {
        return Ok(vec![FulfillmentOutcome::Ignored {
            payment_id: Some(payment_id.to_string()),
            reason: "payment not found".to_string(),
        }]);
    };

    let status = payment.prop("hs_latest_status").unwrap_or_default();
    if !status.eq_ignore_ascii_case(PAYMENT_SUCCEEDED) {
        tracing::debug!("Payment {} has status '{}', nothing to deliver", payment_id, status);
        return Ok(vec![FulfillmentOutcome::Ignored {
            payment_id: Some(payment_id.to_string()),
            reason: format!("payment status '{}'", status),
        }]);
    }

    let buyer_email = payment.prop("hs_customer_email").unwrap_or_default();
    let deal_ids = state
        .crm
        .associated_ids("commerce_payments", payment_id, "deals")
        .await
        .context("reading payment deals")?;

    if deal_ids.is_empty() {
        tracing::warn!("Payment {} succeeded but has no associated deal", payment_id);
        return Ok(vec![FulfillmentOutcome::NoDeals {
            payment_id: payment_id.to_string(),
        }]);
    }

    let mut outcomes = Vec::with_capacity(deal_ids.len());
    for deal_id in deal_ids {
        let outcome = match fulfill_deal(state, payment_id, &deal_id, &buyer_email).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Failed to fulfill deal {}: {}", deal_id, e);
                FulfillmentOutcome::Failed {
                    payment_id: Some(payment_id.to_string()),
                    deal_id: Some(deal_id),
                    error: "deal fulfillment failed".to_string(),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

async fn fulfill_deal(
    state: &AppState,
    payment_id: &str,
    deal_id: &str,
    buyer_email: &str,
) -> Result<FulfillmentOutcome, AppError> {
    let deal = state
        .crm
        .get_deal(deal_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("deal {}", deal_id)))?;

    let current = deal
        .prop(deal_props::LISTING_STATUS)
        .and_then(|s| ListingStatus::parse(&s));

    if ListingStatus::is_fulfilled(current) {
        tracing::info!("Deal {} already {:?}, skipping", deal_id, current);
        return Ok(FulfillmentOutcome::Skipped {
            payment_id: payment_id.to_string(),
            deal_id: deal_id.to_string(),
            listing_status: current.map(|s| s.to_string()).unwrap_or_default(),
        });
    }

    let (_, links) = stamp_delivery(state, deal_id, current, Map::new()).await?;

    let emailed = state
        .mailer
        .send_text(buyer_email, EMAIL_SUBJECT, &links.email_text())
        .await
        .is_sent();

    tracing::info!("Deal {} sold via payment {} (emailed: {})", deal_id, payment_id, emailed);
    Ok(FulfillmentOutcome::Delivered {
        payment_id: payment_id.to_string(),
        deal_id: deal_id.to_string(),
        emailed,
    })
}

/// Stamps a fresh token on a deal and returns the links for it.
///
/// The deal moves to Sold unless `current` is already at or past it, so a
/// re-issue never regresses a Delivered deal. `extra` is merged into the
/// patch (e.g. a paid deal stage).
pub async fn stamp_delivery(
    state: &AppState,
    deal_id: &str,
    current: Option<ListingStatus>,
    extra: Map<String, Value>,
) -> Result<(DeliveryGrant, DeliveryLinks), AppError> {
    let grant = issue_grant(state.clock.now_ms());

    let mut properties = extra;
    if ListingStatus::Sold.can_advance_from(current) {
        properties.insert(
            deal_props::LISTING_STATUS.to_string(),
            json!(ListingStatus::Sold.as_str()),
        );
    }
    properties.insert(deal_props::DELIVERY_TOKEN.to_string(), json!(grant.token));
    properties.insert(
        deal_props::DELIVERY_EXPIRES_AT.to_string(),
        json!(grant.expires_at_ms.to_string()),
    );

    state
        .crm
        .update_deal(deal_id, properties)
        .await
        .with_context(|| format!("stamping delivery on deal {}", deal_id))?;

    let links = DeliveryLinks::build(&state.config.deliverables_base_url, deal_id, &grant.token)?;
    Ok((grant, links))
}
