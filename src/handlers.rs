use crate::cache::Clock;
use crate::config::Config;
use crate::crm_client::{deal_props, CrmClient, CrmRecord};
use crate::delivery::{verify_access, DeliveryLinks};
use crate::errors::AppError;
use crate::fulfillment::stamp_delivery;
use crate::mailer::Mailer;
use crate::models::*;
use crate::scoring::{self, DeviceCounts, LeadTier, RiskInputs, Spend};
use crate::services::{CrimeService, GeocodeService, IncomeService};
use crate::signature::constant_time_compare;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, Redirect},
    Json,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared application state injected into handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Source of "now" for caches, webhook timestamps and token expiry.
    pub clock: Arc<dyn Clock>,
    /// HubSpot CRM, Files and Forms client.
    pub crm: CrmClient,
    /// Best-effort SendGrid mailer.
    pub mailer: Mailer,
    pub income: IncomeService,
    pub crime: CrimeService,
    pub geocode: GeocodeService,
}

impl AppState {
    /// Builds every client and gateway from the configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Runtime configuration.
    /// * `clock` - Shared clock; tests pass a `ManualClock`.
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        Ok(Self {
            crm: CrmClient::new(&config)?,
            mailer: Mailer::new(&config)?,
            income: IncomeService::new(&config, clock.clone())?,
            crime: CrimeService::new(&config, clock.clone())?,
            geocode: GeocodeService::new(&config, clock.clone())?,
            clock,
            config,
        })
    }
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "hsc-lead-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

fn parse_coordinates(lat: Option<&str>, lng: Option<&str>) -> Result<(f64, f64), AppError> {
    let parse = |raw: Option<&str>, limit: f64| {
        raw.and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && v.abs() <= limit)
    };

    match (parse(lat, 90.0), parse(lng, 180.0)) {
        (Some(lat), Some(lng)) => Ok((lat, lng)),
        _ => Err(AppError::BadRequest("Missing/invalid lat,lng".to_string())),
    }
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// GET /crime-data?lat&lng
///
/// Incidents reported within a mile of the point, with a severity-weighted score.
/// Provider failures degrade to an empty listing with `source: "fallback"`.
pub async fn nearby_crime(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CoordinatesQuery>,
) -> Result<Json<Value>, AppError> {
    let (lat, lng) = parse_coordinates(params.lat.as_deref(), params.lng.as_deref())?;
    tracing::info!("Nearby crime lookup");

    let nearby = state.crime.nearby_incidents(lat, lng).await;
    Ok(Json(json!(nearby)))
}

/// GET /crime?state&year
pub async fn crime_summary_query(
    State(state): State<Arc<AppState>>,
    Query(request): Query<CrimeSummaryRequest>,
) -> Result<Json<Value>, AppError> {
    crime_summary(&state, request).await
}

/// POST /crime-data {state, year}
pub async fn crime_summary_body(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CrimeSummaryRequest>,
) -> Result<Json<Value>, AppError> {
    crime_summary(&state, request).await
}

async fn crime_summary(state: &AppState, request: CrimeSummaryRequest) -> Result<Json<Value>, AppError> {
    let state_code = non_empty(request.state.as_deref())
        .filter(|s| s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()))
        .ok_or_else(|| AppError::BadRequest("Missing or invalid state".to_string()))?;

    let year = match request.year.as_deref() {
        None => None,
        Some(raw) => Some(
            raw.parse::<u32>()
                .ok()
                .filter(|y| (1960..=2100).contains(y))
                .ok_or_else(|| AppError::BadRequest("Invalid year".to_string()))?,
        ),
    };

    tracing::info!("FBI summary for state={} year={:?}", state_code, year);
    let summary = state.crime.state_summary(&state_code, year).await?;
    Ok(Json(summary))
}

/// GET /security-risk
///
/// Full risk and monetization bundle for a location and device configuration.
/// Income and state crime are fetched concurrently; either may fall back
/// without failing the request.
///
/// # Arguments
///
/// * `params` - `lat` and `lng` are required; ZIP, state, device counts and
///   spend are optional and parsed leniently.
///
/// # Returns
///
/// * `Result<Json<Value>, AppError>` - The bundle, or 400 on missing coordinates.
pub async fn security_risk(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SecurityRiskQuery>,
) -> Result<Json<Value>, AppError> {
    let started = Instant::now();
    let (lat, lng) = parse_coordinates(params.lat.as_deref(), params.lng.as_deref())?;
    let zip = non_empty(params.zip.as_deref()).unwrap_or_default();
    let state_code = non_empty(params.state.as_deref())
        .map(|s| s.to_uppercase())
        .unwrap_or_default();

    let devices = DeviceCounts {
        indoor_cam: lenient_number(params.indoor_cam.as_deref()),
        outdoor_cam: lenient_number(params.outdoor_cam.as_deref()),
        doorbell: lenient_number(params.doorbell.as_deref()),
        lock: lenient_number(params.lock.as_deref()),
    };
    let spend = Spend {
        upfront: lenient_number(params.upfront.as_deref()),
        monthly: lenient_number(params.monthly.as_deref()),
    };

    let (income, crime) = tokio::join!(
        state.income.lookup(&zip),
        state.crime.state_rates(&state_code),
    );

    let bundle = scoring::score(&RiskInputs {
        crime: crime.rates(),
        median_income: income.median_income,
        devices,
        spend,
        state: (!state_code.is_empty()).then(|| state_code.clone()),
    });
    let m = &bundle.monetization;

    tracing::info!(
        "Scored zip={} state={}: risk={} tier={}",
        zip,
        state_code,
        bundle.risk_score,
        m.tier.as_str()
    );

    Ok(Json(json!({
        "ok": true,
        "version": scoring::MODEL_VERSION,
        "inputs": {
            "lat": lat,
            "lng": lng,
            "zip": zip,
            "state": state_code,
            "devices": {
                "indoorCam": devices.indoor_cam,
                "outdoorCam": devices.outdoor_cam,
                "doorbell": devices.doorbell,
                "lock": devices.lock,
            },
            "spend": { "upfront": spend.upfront, "monthly": spend.monthly },
        },
        "crime": {
            "violent": crime.violent,
            "property": crime.property,
            "trend12Months": scoring::trend_12_months(crime.total_incidents()),
            "source": crime.source,
        },
        "demographics": {
            "medianIncome": income.median_income,
            "source": income.source,
        },
        "scoring": {
            "riskScore": bundle.risk_score,
            "zone": bundle.zone,
            "zoneColor": bundle.zone.color(),
            "crimeIndex": bundle.crime_index,
            "responseRisk": bundle.response_risk,
            "exposureScore": bundle.exposure_score,
            "mitigationScore": bundle.mitigation_score,
            "incomeRisk": bundle.income_risk,
            "percentiles": bundle.percentiles,
        },
        "monetization": {
            "schemaVersion": "1.0.0",
            "qualityScore": m.quality_score,
            "tier": m.tier,
            "priceUsd": m.price_usd,
            "components": {
                "affluenceScore": m.affluence_score,
                "intentScore": m.intent_score,
                "urgencyScore": m.urgency_score,
            },
            "model": {
                "weights": { "affluence": 0.40, "intent": 0.40, "urgency": 0.20 },
                "tierThresholds": { "Platinum": 85, "Gold": 70, "Silver": 55 },
                "basePrices": {
                    "Platinum": LeadTier::Platinum.base_price(),
                    "Gold": LeadTier::Gold.base_price(),
                    "Silver": LeadTier::Silver.base_price(),
                    "Bronze": LeadTier::Bronze.base_price(),
                },
            },
        },
        "ui": {
            "headline": format!(
                "Classified as {:?} risk based on crime index, ZIP income, exposure, and mitigation from your configuration.",
                bundle.zone
            ),
        },
        "cache": {
            "incomeHit": income.cache_hit,
            "crimeHit": crime.cache_hit,
        },
        "timingsMs": {
            "income": income.ms,
            "crime": crime.ms,
            "total": started.elapsed().as_millis() as u64,
        },
    })))
}

/// GET /geocode?address=
pub async fn geocode(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GeocodeQuery>,
) -> Result<Json<Value>, AppError> {
    let address = non_empty(params.address.as_deref())
        .ok_or_else(|| AppError::BadRequest("Missing address".to_string()))?;

    let lookup = state.geocode.lookup(&address).await;
    Ok(Json(json!({
        "ok": true,
        "location": lookup.location,
        "source": lookup.source,
        "cacheHit": lookup.cache_hit,
    })))
}

/// GET /google-key
///
/// Browser Maps key. Public by nature, served with wildcard CORS.
pub async fn google_key(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let key = state
        .config
        .google_api_key
        .as_deref()
        .ok_or_else(|| AppError::Configuration("GOOGLE_API_KEY is not set".to_string()))?;

    Ok(Json(json!({ "key": key })))
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let expected = state
        .config
        .lead_store_api_key
        .as_deref()
        .ok_or_else(|| AppError::Configuration("LEAD_STORE_API_KEY is not set".to_string()))?;

    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    if !constant_time_compare(expected, provided) {
        return Err(AppError::Unauthorized("Invalid X-API-Key".to_string()));
    }
    Ok(())
}

fn listing_status(deal: &CrmRecord) -> Option<ListingStatus> {
    deal.prop(deal_props::LISTING_STATUS)
        .and_then(|s| ListingStatus::parse(&s))
}

/// POST /issue-delivery {deal_id}
///
/// Stamps a fresh 24-hour token on the deal and returns the deliverable links.
/// Also the re-issue path for expired links. Requires `X-API-Key`.
pub async fn issue_delivery(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<IssueDeliveryRequest>,
) -> Result<Json<Value>, AppError> {
    require_api_key(&state, &headers)?;
    state.crm.ensure_configured()?;

    let deal_id = request
        .deal_id
        .ok_or_else(|| AppError::BadRequest("Missing deal_id".to_string()))?;

    let deal = state
        .crm
        .get_deal(&deal_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Deal {} not found", deal_id)))?;

    let mut extra = Map::new();
    if let Some(stage) = state.config.hubspot_stage_paid.as_deref() {
        extra.insert(deal_props::DEAL_STAGE.to_string(), json!(stage));
    }

    let (grant, links) = stamp_delivery(&state, &deal_id, listing_status(&deal), extra).await?;
    tracing::info!("Issued delivery token for deal {}", deal_id);

    Ok(Json(json!({
        "ok": true,
        "deal_id": deal_id,
        "delivery_token": grant.token,
        "delivery_expires_at": grant.expires_at_ms,
        "deliverables_url": links.deliverables_url,
        "pdf_download_url": links.pdf_download_url,
        "csv_download_url": links.csv_download_url,
    })))
}

/// Validates `deal_id` + `token` and returns the deal. Every access failure is 403.
async fn authorize_delivery(
    state: &AppState,
    query: &DeliveryQuery,
) -> Result<(String, String, CrmRecord), AppError> {
    let (Some(deal_id), Some(token)) = (
        non_empty(query.deal_id.as_deref()),
        non_empty(query.token.as_deref()),
    ) else {
        return Err(AppError::BadRequest("Missing deal_id or token".to_string()));
    };

    state.crm.ensure_configured()?;
    let deal = state.crm.get_deal(&deal_id).await?;
    verify_access(deal.as_ref(), &token, state.clock.now_ms())?;

    let deal = deal.ok_or_else(|| AppError::Forbidden("Invalid deal or token".to_string()))?;
    Ok((deal_id, token, deal))
}

/// First successful access after payment marks the deal Delivered.
async fn mark_delivered(state: &AppState, deal_id: &str, deal: &CrmRecord) {
    if !ListingStatus::Delivered.can_advance_from(listing_status(deal)) {
        return;
    }

    let mut properties = Map::new();
    properties.insert(
        deal_props::LISTING_STATUS.to_string(),
        json!(ListingStatus::Delivered.as_str()),
    );
    match state.crm.update_deal(deal_id, properties).await {
        Ok(()) => tracing::info!("Deal {} delivered", deal_id),
        Err(e) => tracing::warn!("Failed to mark deal {} delivered: {}", deal_id, e),
    }
}

/// GET /deliverables?deal_id&token
pub async fn deliverables(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Html<String>, AppError> {
    let (deal_id, token, deal) = authorize_delivery(&state, &query).await?;
    let links = DeliveryLinks::build(&state.config.deliverables_base_url, &deal_id, &token)?;

    mark_delivered(&state, &deal_id, &deal).await;
    Ok(Html(links.html_page()))
}

/// GET /download-pdf?deal_id&token
pub async fn download_pdf(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Redirect, AppError> {
    download(&state, &query, deal_props::PDF_FILE_ID).await
}

/// GET /download-csv?deal_id&token
pub async fn download_csv(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Redirect, AppError> {
    download(&state, &query, deal_props::CSV_FILE_ID).await
}

/// Redirects to a short-lived signed URL for the deal's file.
async fn download(state: &AppState, query: &DeliveryQuery, file_prop: &str) -> Result<Redirect, AppError> {
    let (deal_id, _, deal) = authorize_delivery(state, query).await?;

    let file_id = deal
        .prop(file_prop)
        .ok_or_else(|| AppError::NotFound("Deliverable has not been uploaded yet".to_string()))?;
    let url = state.crm.signed_file_url(&file_id).await?;

    mark_delivered(state, &deal_id, &deal).await;
    Ok(Redirect::temporary(&url))
}
