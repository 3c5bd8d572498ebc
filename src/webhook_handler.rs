use crate::errors::AppError;
use crate::fulfillment::process_payment_events;
use crate::handlers::AppState;
use crate::signature::{verify_hubspot_signature, SignedRequest};
use crate::webhook_models::{PaymentWebhookPayload, WebhookResponse};
use axum::{
    body::Bytes,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method, StatusCode},
    Json,
};
use std::sync::Arc;

/// HubSpot Payment Webhook Handler
///
/// Receives commerce-payment events from HubSpot. The signature is checked
/// against the raw body before anything is parsed or any CRM call is made.
///
/// Expected payload: array of events OR `{ "events": [...] }`
/// Authentication: X-HubSpot-Signature (v1) or X-HubSpot-Signature-v3 + timestamp
pub async fn hubspot_payment_webhook(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    // 1. Verify signature
    let request = SignedRequest {
        headers: &headers,
        method: method.as_str(),
        path: uri.path(),
        body: &body,
    };
    let version = verify_hubspot_signature(
        state.config.hubspot_client_secret.as_deref(),
        &request,
        state.clock.now_ms(),
    )?;
    tracing::info!("Received HubSpot payment webhook (signature {:?})", version);

    // 2. Parse batch
    let payload: PaymentWebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!("Malformed webhook body: {}", e);
        AppError::BadRequest("Body must be an array of events or {\"events\": [...]}".to_string())
    })?;

    state.crm.ensure_configured()?;

    let events = payload.into_events();
    let total_received = events.len();
    tracing::info!("Processing {} webhook event(s)", total_received);

    // 3. Process each event; failures stay per item
    let outcomes = process_payment_events(&state, events).await;
    let response = WebhookResponse::from_outcomes(total_received, outcomes);

    tracing::info!(
        "Webhook processing complete: {} received, {} delivered, {} skipped, {} failed",
        response.received,
        response.delivered,
        response.skipped,
        response.failed
    );

    Ok((StatusCode::OK, Json(response)))
}
