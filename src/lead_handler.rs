//! Lead intake: form submission, CRM sync and deliverable upload.

use crate::crm_client::deal_props;
use crate::errors::{AppError, ResultExt};
use crate::handlers::AppState;
use crate::intake::{
    device_summary, is_valid_email, normalize_ownership, normalize_timeline, normalize_us_phone,
    parse_us_address, redacted_location, state_name, DeviceLine,
};
use crate::models::*;
use crate::properties::ContactField;
use crate::scoring::{self, DeviceCounts, Monetization, MonetizationInputs, Spend};
use axum::{
    extract::State,
    http::{header::ORIGIN, HeaderMap},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Risk score assumed for pricing when the caller sends none.
const NEUTRAL_RISK_SCORE: u32 = 50;

const MAX_LEAD_ID_LEN: usize = 64;

/// Device count keys sent by the calculator, with their summary labels.
const DEVICE_KEYS: [(&str, &str); 12] = [
    ("indoorCam", "Indoor Cameras"),
    ("outdoorCam", "Outdoor Cameras"),
    ("doorbell", "Video Doorbell"),
    ("lock", "Smart Locks"),
    ("doorSensor", "Door Sensors"),
    ("windowSensor", "Window Sensors"),
    ("motion", "Motion Sensors"),
    ("glass", "Glass Break Sensors"),
    ("smoke", "Smoke/CO"),
    ("water", "Water Leak"),
    ("keypad", "Keypads"),
    ("siren", "Sirens"),
];

fn value_to_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// First non-empty value among `keys`, as a string.
fn text(payload: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find_map(value_to_string)
        .unwrap_or_default()
}

/// First non-null value among `keys`, as a number. Unparsable values count as 0.
fn number(payload: &Value, keys: &[&str]) -> f64 {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find(|v| !v.is_null())
        .map(|v| match v {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            other => lenient_number(value_to_string(other).as_deref()),
        })
        .filter(|n| n.is_finite())
        .unwrap_or(0.0)
}

fn nested_text(payload: &Value, outer: &str, inner: &str) -> String {
    payload
        .get(outer)
        .and_then(|o| o.get(inner))
        .and_then(value_to_string)
        .unwrap_or_default()
}

fn is_valid_lead_id(lead_id: &str) -> bool {
    !lead_id.is_empty()
        && lead_id.len() <= MAX_LEAD_ID_LEN
        && lead_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Splits `{payload, risk}` or a bare payload.
fn pick_payload(body: &Value) -> (&Value, Option<&Value>) {
    match body.get("payload") {
        Some(payload) if payload.is_object() => (payload, body.get("risk").filter(|r| r.is_object())),
        _ => (body, body.get("risk").filter(|r| r.is_object())),
    }
}

fn devices_from(payload: &Value) -> DeviceCounts {
    DeviceCounts {
        indoor_cam: number(payload, &["indoorCam"]),
        outdoor_cam: number(payload, &["outdoorCam"]),
        doorbell: number(payload, &["doorbell"]),
        lock: number(payload, &["lock", "smart_locks"]),
    }
}

fn device_lines(payload: &Value) -> String {
    if let Some(lines) = payload
        .get("deviceLines")
        .and_then(Value::as_array)
        .filter(|l| !l.is_empty())
    {
        let lines: Vec<DeviceLine> = lines
            .iter()
            .map(|line| DeviceLine {
                label: text(line, &["label"]),
                qty: number(line, &["qty"]),
            })
            .collect();
        return device_summary(&lines);
    }

    let summary = text(payload, &["deviceSummary", "hsc_devices"]);
    if !summary.is_empty() {
        return summary;
    }

    let lines: Vec<DeviceLine> = DEVICE_KEYS
        .iter()
        .map(|(key, label)| DeviceLine {
            label: label.to_string(),
            qty: number(payload, &[*key]),
        })
        .collect();
    device_summary(&lines)
}

fn risk_score_from(payload: &Value, risk: Option<&Value>) -> Option<u32> {
    let from_risk = risk
        .and_then(|r| r.get("scoring"))
        .and_then(|s| s.get("riskScore"))
        .and_then(Value::as_f64);
    let from_payload = payload
        .get("hsc_risk_score")
        .and_then(|v| value_to_string(v).and_then(|s| s.parse::<f64>().ok()));

    from_risk
        .or(from_payload)
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, 100.0) as u32)
}

/// Normalises a calculator payload into canonical contact fields.
///
/// Accepts the aliases the calculator and older form versions send. Empty
/// strings are dropped; numbers are always kept.
pub fn normalize_canonical(payload: &Value, risk: Option<&Value>) -> BTreeMap<ContactField, Value> {
    let mut out: BTreeMap<ContactField, Value> = BTreeMap::new();
    let mut put = |field: ContactField, value: String| {
        if !value.trim().is_empty() {
            out.insert(field, Value::String(value.trim().to_string()));
        }
    };

    put(ContactField::FirstName, text(payload, &["firstname", "First Name"]));
    put(ContactField::LastName, text(payload, &["lastname", "Last Name"]));
    put(ContactField::Email, text(payload, &["email", "Email"]));
    put(
        ContactField::Phone,
        normalize_us_phone(&text(payload, &["phone", "Phone"])),
    );
    put(ContactField::City, text(payload, &["city", "City"]));
    put(
        ContactField::Zip,
        text(payload, &["zip", "postal code", "postal_code"]),
    );
    put(
        ContactField::StreetAddress,
        text(
            payload,
            &["street_address", "streetAddress", "Street Address", "address_line1"],
        ),
    );

    let state = text(
        payload,
        &["state_code", "state", "State/Region Code", "state_region_code"],
    )
    .to_uppercase();
    let mut state_label = text(payload, &["state_name", "State/Region"]);
    if state_label.is_empty() {
        state_label = state_name(&state).unwrap_or_default().to_string();
    }
    put(ContactField::StateCode, state.clone());
    put(ContactField::StateName, state_label);

    put(ContactField::Timezone, text(payload, &["timezone", "Time Zone"]));
    put(ContactField::IpTimezone, text(payload, &["ip_timezone", "IP Timezone"]));
    let mut ip_state = text(payload, &["ip_state_code", "IP State Code/Region Code"]);
    if ip_state.is_empty() {
        ip_state = state;
    }
    let mut ip_state_label = text(payload, &["ip_state_name", "IP State/Region"]);
    if ip_state_label.is_empty() {
        ip_state_label = state_name(&ip_state).unwrap_or_default().to_string();
    }
    put(ContactField::IpStateCode, ip_state);
    put(ContactField::IpStateName, ip_state_label);

    let mut property_address = text(
        payload,
        &["hsc_property_address", "address_full", "address"],
    );
    if property_address.is_empty() {
        property_address = nested_text(payload, "geo", "formatted");
    }
    put(ContactField::HscPropertyAddress, property_address);

    let system_tier = text(
        payload,
        &["hsc_system_tier", "tierName", "tier", "systemTier", "System tier"],
    );
    let mut plain_tier = text(payload, &["system_tier", "System tier"]);
    if plain_tier.is_empty() {
        plain_tier = system_tier.clone();
    }
    put(ContactField::HscSystemTier, system_tier);
    put(ContactField::SystemTier, plain_tier);
    put(
        ContactField::ServicePlan,
        text(
            payload,
            &["service_plan", "monitoringName", "monitoring", "monitorPlan", "Service plan"],
        ),
    );
    put(
        ContactField::InstallationTier,
        text(
            payload,
            &["installation_tier", "installName", "install", "installTier", "Installation tier"],
        ),
    );
    put(
        ContactField::InstallationType,
        text(payload, &["installation_type", "installMode"]),
    );

    put(
        ContactField::HomeOwnership,
        normalize_ownership(&text(payload, &["home_ownership", "Home Ownership"])),
    );
    put(ContactField::HomeSize, text(payload, &["home_size", "Home size"]));
    put(
        ContactField::Timeline,
        normalize_timeline(&text(payload, &["timeline", "Timeline"])),
    );
    put(ContactField::HscDevices, device_lines(payload));

    let utm = |key: &str, nested: &str| {
        let direct = text(payload, &[key]);
        if direct.is_empty() {
            nested_text(payload, "utm", nested)
        } else {
            direct
        }
    };
    let utm_source = utm("utm_source", "source");
    let utm_medium = utm("utm_medium", "medium");
    let utm_campaign = utm("utm_campaign", "campaign");
    let utm_content = utm("utm_content", "content");
    let utm_term = utm("utm_term", "term");
    let utm_data = json!({
        "utm_source": utm_source,
        "utm_campaign": utm_campaign,
        "utm_content": utm_content,
        "utm_term": utm_term,
        "first_seen": text(payload, &["utm_first_seen"]),
        "last_seen": text(payload, &["utm_last_seen"]),
    });
    put(ContactField::UtmSource, utm_source);
    put(ContactField::UtmMedium, utm_medium);
    put(ContactField::UtmCampaign, utm_campaign);
    put(ContactField::UtmContent, utm_content);
    put(ContactField::UtmTerm, utm_term);
    put(ContactField::UtmData, utm_data.to_string());

    let monthly = number(payload, &["hsc_monthly", "monthly"]);
    let upfront = number(payload, &["hsc_upfront", "upfront"]);
    out.insert(ContactField::HscMonthly, json!(monthly));
    out.insert(ContactField::HscUpfront, json!(upfront));
    out.insert(
        ContactField::SmartLocks,
        json!(number(payload, &["smart_locks", "lock"])),
    );
    out.insert(ContactField::TotalRevenue, json!(upfront.max(0.0).round() as i64));
    if let Some(score) = risk_score_from(payload, risk) {
        out.insert(ContactField::HscRiskScore, json!(score));
    }

    out
}

fn canonical_str(canonical: &BTreeMap<ContactField, Value>, field: ContactField) -> &str {
    canonical.get(&field).and_then(Value::as_str).unwrap_or_default()
}

/// Server-side price for a lead. Client-sent prices are never trusted.
fn price_lead(
    payload: &Value,
    risk: Option<&Value>,
    canonical: &BTreeMap<ContactField, Value>,
) -> Monetization {
    let median_income = risk
        .and_then(|r| r.get("demographics"))
        .and_then(|d| d.get("medianIncome"))
        .and_then(Value::as_f64);
    let state = canonical_str(canonical, ContactField::StateCode);

    scoring::monetize(&MonetizationInputs {
        median_income,
        risk_score: risk_score_from(payload, risk).unwrap_or(NEUTRAL_RISK_SCORE),
        devices: devices_from(payload),
        spend: Spend {
            upfront: number(payload, &["hsc_upfront", "upfront"]),
            monthly: number(payload, &["hsc_monthly", "monthly"]),
        },
        state: (!state.is_empty()).then(|| state.to_string()),
    })
}

/// POST /submit-lead
///
/// Parses the free-text address and forwards the lead to the HubSpot Forms API.
pub async fn submit_lead(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitLeadRequest>,
) -> Result<Json<SubmitLeadResponse>, AppError> {
    let (Some(portal_id), Some(form_id)) = (
        state.config.hubspot_portal_id.as_deref(),
        state.config.hubspot_form_id.as_deref(),
    ) else {
        return Err(AppError::Configuration(
            "HUBSPOT_PORTAL_ID and HUBSPOT_FORM_ID must be set".to_string(),
        ));
    };

    let field = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or_default().to_string();

    let email = field(&request.email);
    if !is_valid_email(&email) {
        return Err(AppError::BadRequest("Missing or invalid email".to_string()));
    }

    let address = parse_us_address(request.address.as_deref().unwrap_or_default());
    let phone = normalize_us_phone(request.phone.as_deref().unwrap_or_default());

    let mut fields = vec![
        ("firstname", field(&request.firstname)),
        ("lastname", field(&request.lastname)),
        ("email", email),
        ("phone", phone),
        ("address", address.street),
        ("city", address.city),
        ("state", address.state),
        ("zip", address.postal_code),
        ("utm_source", field(&request.utm_source)),
        ("utm_medium", field(&request.utm_medium)),
        ("utm_campaign", field(&request.utm_campaign)),
        ("utm_term", field(&request.utm_term)),
        ("utm_content", field(&request.utm_content)),
    ];
    if let Some(ownership) = request.home_ownership.as_deref() {
        fields.push(("home_ownership", normalize_ownership(ownership)));
    }
    if let Some(timeline) = request.timeline.as_deref() {
        fields.push(("timeline", normalize_timeline(timeline)));
    }

    let submission = json!({
        "fields": fields
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect::<Vec<_>>(),
        "context": { "pageUri": field(&request.page_uri) },
    });

    state
        .crm
        .submit_form(portal_id, form_id, &submission)
        .await
        .context("submitting lead form")?;

    tracing::info!("Lead form submitted");
    Ok(Json(SubmitLeadResponse { success: true }))
}

/// POST /hubspot-sync
///
/// Upserts the contact by email, prices the lead, upserts the deal by
/// `lead_id` and makes sure the deal has exactly one line item.
///
/// # Arguments
///
/// * `body` - `{ payload, risk }` or a bare payload.
///
/// # Returns
///
/// * `Result<Json<HubspotSyncResponse>, AppError>` - Ids of everything touched.
pub async fn hubspot_sync(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<HubspotSyncResponse>, AppError> {
    state.crm.ensure_configured()?;

    let (payload, risk) = pick_payload(&body);
    let canonical = normalize_canonical(payload, risk);

    let email = canonical_str(&canonical, ContactField::Email).to_string();
    if email.is_empty() {
        return Err(AppError::BadRequest("Missing email".to_string()));
    }
    if !is_valid_email(&email) {
        return Err(AppError::BadRequest("Invalid email".to_string()));
    }

    let lead_id = match payload.get("lead_id").and_then(value_to_string) {
        Some(id) if is_valid_lead_id(&id) => id,
        Some(_) => return Err(AppError::BadRequest("Invalid lead_id".to_string())),
        None => Uuid::new_v4().to_string(),
    };

    // 1. Contact
    let properties = state.config.property_map.to_properties(&canonical);
    let existing_contact = state
        .crm
        .search_contact_by_email(&email)
        .await
        .context("searching contact")?;
    let (contact_id, mode) = match existing_contact {
        Some(id) => {
            state
                .crm
                .update_contact(&id, properties)
                .await
                .context("updating contact")?;
            (id, "updated")
        }
        None => {
            let id = state
                .crm
                .create_contact(properties)
                .await
                .context("creating contact")?;
            (id, "created")
        }
    };

    // 2. Deal
    let monetization = price_lead(payload, risk, &canonical);
    let location = redacted_location(
        canonical_str(&canonical, ContactField::City),
        canonical_str(&canonical, ContactField::StateCode),
        canonical_str(&canonical, ContactField::Zip),
    );

    let mut deal_properties = Map::new();
    deal_properties.insert(
        deal_props::DEAL_NAME.to_string(),
        json!(format!("HSC Lead {} - {}", monetization.tier.as_str(), location)
            .trim_end_matches([' ', '-'])
            .to_string()),
    );
    deal_properties.insert(deal_props::AMOUNT.to_string(), json!(monetization.price_usd));
    deal_properties.insert(deal_props::LEAD_ID.to_string(), json!(lead_id));
    deal_properties.insert(deal_props::LEAD_PRICE.to_string(), json!(monetization.price_usd));
    deal_properties.insert(deal_props::LEAD_TIER.to_string(), json!(monetization.tier.as_str()));
    deal_properties.insert(deal_props::REDACTED_LOCATION.to_string(), json!(location));

    let existing_deal = state
        .crm
        .find_deal_by_lead_id(&lead_id)
        .await
        .context("searching deal")?;
    let deal_id = match existing_deal {
        Some(deal) => {
            // listing_status is left alone so a sold lead never goes back to Qualified
            state
                .crm
                .update_deal(&deal.id, deal_properties)
                .await
                .context("updating deal")?;
            deal.id
        }
        None => {
            deal_properties.insert(
                deal_props::LISTING_STATUS.to_string(),
                json!(ListingStatus::Qualified.as_str()),
            );
            if let Some(pipeline) = state.config.hubspot_pipeline_id.as_deref() {
                deal_properties.insert(deal_props::PIPELINE.to_string(), json!(pipeline));
            }
            if let Some(stage) = state.config.hubspot_stage_qualified.as_deref() {
                deal_properties.insert(deal_props::DEAL_STAGE.to_string(), json!(stage));
            }
            state
                .crm
                .create_deal(deal_properties, Some(&contact_id))
                .await
                .context("creating deal")?
        }
    };

    // 3. Line item, at most one per deal
    let existing_items = state
        .crm
        .associated_ids("deals", &deal_id, "line_items")
        .await
        .context("reading deal line items")?;
    let line_item_id = match existing_items.into_iter().next() {
        Some(id) => id,
        None => state
            .crm
            .create_line_item(
                &format!("HSC Lead ({})", monetization.tier.as_str()),
                monetization.price_usd,
                &deal_id,
            )
            .await
            .context("creating line item")?,
    };

    tracing::info!(
        "Synced lead {} (contact {} {}, deal {}, {} ${})",
        lead_id,
        contact_id,
        mode,
        deal_id,
        monetization.tier.as_str(),
        monetization.price_usd
    );

    Ok(Json(HubspotSyncResponse {
        ok: true,
        mode,
        lead_id,
        contact_id,
        deal_id,
        line_item_id: Some(line_item_id),
        lead_price: monetization.price_usd,
        lead_tier: monetization.tier.as_str(),
    }))
}

/// Decodes a base64 PDF, tolerating a `data:` URL prefix and line breaks.
fn decode_pdf(raw: &str) -> Result<Vec<u8>, AppError> {
    let encoded = match raw.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();

    BASE64
        .decode(compact)
        .ok()
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| AppError::BadRequest("pdf_base64 is not valid base64".to_string()))
}

/// POST /upload-deliverables
///
/// Browser-only: the Origin must be allow-listed.
pub async fn upload_deliverables(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<UploadDeliverablesRequest>,
) -> Result<Json<UploadDeliverablesResponse>, AppError> {
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.config.is_allowed_origin(origin) {
        return Err(AppError::Forbidden("Forbidden".to_string()));
    }
    state.crm.ensure_configured()?;

    let lead_id = request.lead_id.unwrap_or_default();
    let pdf_base64 = request.pdf_base64.unwrap_or_default();
    let csv_text = request.csv_text.unwrap_or_default();
    if lead_id.is_empty() || pdf_base64.trim().is_empty() || csv_text.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Missing lead_id, pdf_base64, or csv_text".to_string(),
        ));
    }
    if !is_valid_lead_id(&lead_id) {
        return Err(AppError::BadRequest("Invalid lead_id".to_string()));
    }
    let pdf = decode_pdf(&pdf_base64)?;

    let deal = state
        .crm
        .find_deal_by_lead_id(&lead_id)
        .await
        .context("searching deal")?
        .ok_or_else(|| AppError::NotFound("Deal not found for lead_id".to_string()))?;

    let folder = &state.config.hubspot_files_folder_path;
    let pdf_file_id = state
        .crm
        .upload_private_file(pdf, &format!("lead-{}.pdf", lead_id), "application/pdf", folder)
        .await
        .context("uploading pdf")?;
    let csv_file_id = state
        .crm
        .upload_private_file(
            csv_text.trim().as_bytes().to_vec(),
            &format!("lead-{}.csv", lead_id),
            "text/csv",
            folder,
        )
        .await
        .context("uploading csv")?;

    let mut properties = Map::new();
    properties.insert(deal_props::PDF_FILE_ID.to_string(), json!(pdf_file_id));
    properties.insert(deal_props::CSV_FILE_ID.to_string(), json!(csv_file_id));
    state
        .crm
        .update_deal(&deal.id, properties)
        .await
        .context("linking deliverables")?;

    tracing::info!("Uploaded deliverables for lead {} to deal {}", lead_id, deal.id);
    Ok(Json(UploadDeliverablesResponse {
        ok: true,
        deal_id: deal.id,
        pdf_file_id,
        csv_file_id,
    }))
}
