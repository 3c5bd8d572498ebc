/// Integration tests with mocked external APIs
/// Drives the full router with every upstream (HubSpot, SendGrid, income,
/// crime, FBI) replaced by a wiremock server and time controlled by a ManualClock.
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use hsc_lead_api::cache::ManualClock;
use hsc_lead_api::config::Config;
use hsc_lead_api::handlers::AppState;
use hsc_lead_api::routes::build_router;
use hsc_lead_api::signature::{compute_v1, compute_v3};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path, path_regex, query_param};
use wiremock::{Match, Mock, MockServer, Request as MockRequest, ResponseTemplate};

const NOW: i64 = 1_700_000_000_000;
const CLIENT_SECRET: &str = "test-client-secret";
const API_KEY: &str = "test-lead-store-key";
const ORIGIN: &str = "https://www.homesecurecalculator.com";

struct TestApp {
    server: MockServer,
    clock: Arc<ManualClock>,
    router: Router,
}

/// Helper function to create a test config with every upstream pointed at the mock server
fn create_test_config(base_url: &str) -> Config {
    Config {
        rapidapi_key: Some("test-rapidapi-key".to_string()),
        fbi_api_key: Some("test-fbi-key".to_string()),
        google_api_key: Some("test-google-key".to_string()),
        upstream_timeout: Duration::from_secs(2),
        hubspot_token: Some("test-hubspot-token".to_string()),
        hubspot_portal_id: Some("123".to_string()),
        hubspot_form_id: Some("abc".to_string()),
        hubspot_client_secret: Some(CLIENT_SECRET.to_string()),
        lead_store_api_key: Some(API_KEY.to_string()),
        deliverables_base_url: "https://api.example.com".to_string(),
        sendgrid_api_key: Some("test-sendgrid-key".to_string()),
        sendgrid_from_email: Some("leads@example.com".to_string()),
        hubspot_api_base_url: base_url.to_string(),
        hubspot_forms_base_url: base_url.to_string(),
        income_api_base_url: base_url.to_string(),
        crime_api_base_url: base_url.to_string(),
        fbi_api_base_url: base_url.to_string(),
        geocode_api_base_url: base_url.to_string(),
        sendgrid_api_base_url: base_url.to_string(),
        ..Config::default()
    }
}

async fn spawn_app() -> TestApp {
    let server = MockServer::start().await;
    let clock = Arc::new(ManualClock::new(NOW));
    let config = create_test_config(&server.uri());
    let state = AppState::new(config, clock.clone()).unwrap();

    TestApp {
        server,
        clock,
        router: build_router(Arc::new(state)),
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, body, location)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body, _) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_json(&self, uri: &str, body: &Value, headers: &[(&str, &str)]) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        let (status, body, _) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_webhook(&self, raw_body: &str, signature: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/hubspot-payment-webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-hubspot-signature", signature)
            .body(Body::from(raw_body.to_string()))
            .unwrap();
        let (status, body, _) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }
}

/// Matches a CRM PATCH whose properties do not touch `listing_status`.
struct LeavesListingStatus;

impl Match for LeavesListingStatus {
    fn matches(&self, request: &MockRequest) -> bool {
        serde_json::from_slice::<Value>(&request.body)
            .map(|v| v["properties"].get("listing_status").is_none())
            .unwrap_or(false)
    }
}

async fn mount_state_crime(server: &MockServer, violent: u64, property: u64) {
    Mock::given(method("GET"))
        .and(path_regex(
            r"^/cde/crime-data/api/summarized/state/GA/violent-crime/\d{4}/\d{4}$",
        ))
        .and(query_param("API_KEY", "test-fbi-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "actual": violent, "population": 100000 }]
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(
            r"^/cde/crime-data/api/summarized/state/GA/property-crime/\d{4}/\d{4}$",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "actual": property, "population": 100000 }]
        })))
        .expect(1)
        .mount(server)
        .await;
}

const RISK_QUERY: &str = "/security-risk?lat=33.75&lng=-84.39&zip=30301&state=GA&indoorCam=2&outdoorCam=1&doorbell=1&lock=2&upfront=1500&monthly=40";

// ============ Data gateway + scoring ============

#[tokio::test]
async fn test_security_risk_scores_and_caches_upstreams() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/v1/Census/HouseholdIncomeByZip/30301"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "MedianHouseholdIncome": 45000 })),
        )
        .expect(1)
        .mount(&app.server)
        .await;
    mount_state_crime(&app.server, 600, 3000).await;

    let (status, body) = app.get(RISK_QUERY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["version"], "enterprise-1.0.0");
    assert_eq!(body["scoring"]["crimeIndex"], 60);
    assert_eq!(body["scoring"]["exposureScore"], 60);
    assert_eq!(body["scoring"]["mitigationScore"], 14);
    assert_eq!(body["scoring"]["responseRisk"], 68);
    assert_eq!(body["scoring"]["riskScore"], 60);
    assert_eq!(body["scoring"]["zone"], "Moderate");
    assert_eq!(body["monetization"]["tier"], "Bronze");
    assert_eq!(body["monetization"]["priceUsd"], 30);
    assert_eq!(body["demographics"]["medianIncome"], 45000.0);
    assert_eq!(body["demographics"]["source"], "rapidapi");
    assert_eq!(body["crime"]["source"], "fbi");
    assert_eq!(body["crime"]["trend12Months"].as_array().unwrap().len(), 12);
    assert_eq!(body["cache"]["incomeHit"], false);

    // Same request within the TTLs is served from cache (mocks expect exactly one call)
    app.clock.advance(Duration::from_secs(60 * 60));
    let (status, body) = app.get(RISK_QUERY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cache"]["incomeHit"], true);
    assert_eq!(body["cache"]["crimeHit"], true);
    assert_eq!(body["scoring"]["riskScore"], 60);
}

#[tokio::test]
async fn test_income_failure_falls_back_and_is_not_cached() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/v1/Census/HouseholdIncomeByZip/30301"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&app.server)
        .await;

    let uri = "/security-risk?lat=33.75&lng=-84.39&zip=30301";
    let (status, body) = app.get(uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["demographics"]["source"], "fallback");
    assert_eq!(body["demographics"]["medianIncome"], Value::Null);
    assert_eq!(body["crime"]["source"], "none");

    let (_, body) = app.get(uri).await;
    assert_eq!(body["cache"]["incomeHit"], false);
}

#[tokio::test]
async fn test_income_payload_without_median_falls_back() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/v1/Census/HouseholdIncomeByZip/30301"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "zip": "30301", "rows": [] })))
        .expect(2)
        .mount(&app.server)
        .await;

    let uri = "/security-risk?lat=33.75&lng=-84.39&zip=30301";
    let (status, body) = app.get(uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["demographics"]["source"], "fallback");
    assert_eq!(body["demographics"]["medianIncome"], Value::Null);

    let (_, body) = app.get(uri).await;
    assert_eq!(body["cache"]["incomeHit"], false);
}

#[tokio::test]
async fn test_security_risk_requires_coordinates() {
    let app = spawn_app().await;

    let (status, body) = app.get("/security-risk?zip=30301").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "Missing/invalid lat,lng");
}

#[tokio::test]
async fn test_nearby_crime_weights_incidents() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crime"))
        .and(query_param("radius", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "offense": "Burglary" },
                { "offense": "Aggravated Assault" },
                { "offense": "Vandalism" }
            ]
        })))
        .mount(&app.server)
        .await;

    let (status, body) = app.get("/crime-data?lat=33.75&lng=-84.39").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalCrimes"], 3);
    assert_eq!(body["weightedCrimeScore"], 14);
    assert_eq!(body["riskLevel"], "Low");
    assert_eq!(body["source"], "rapidapi");
}

#[tokio::test]
async fn test_state_summary_passthrough() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/sapi/api/summarized/state/GA/violent-crime/2022/2022"))
        .and(query_param("api_key", "test-fbi-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "results": [{ "actual": 41000 }] })),
        )
        .mount(&app.server)
        .await;

    let (status, body) = app
        .post_json("/crime-data", &json!({ "state": "ga", "year": 2022 }), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["actual"], 41000);

    let (status, _) = app.get("/crime?state=Georgia").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_geocode_caches_by_normalised_address() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/maps/api/geocode/json"))
        .and(query_param("key", "test-google-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "results": [{
                "formatted_address": "123 Main St, Atlanta, GA 30301, USA",
                "geometry": { "location": { "lat": 33.75, "lng": -84.39 } },
                "address_components": [
                    { "short_name": "GA", "types": ["administrative_area_level_1"] },
                    { "short_name": "30301", "types": ["postal_code"] }
                ]
            }]
        })))
        .expect(1)
        .mount(&app.server)
        .await;

    let (status, body) = app.get("/geocode?address=123%20Main%20St%2C%20Atlanta").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"]["state"], "GA");
    assert_eq!(body["location"]["zip"], "30301");
    assert_eq!(body["cacheHit"], false);

    let (_, body) = app.get("/geocode?address=123%20%20MAIN%20St%2C%20Atlanta").await;
    assert_eq!(body["cacheHit"], true);
    assert_eq!(body["source"], "google");

    let (status, _) = app.get("/geocode").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============ Lead intake ============

#[tokio::test]
async fn test_submit_lead_forwards_parsed_address() {
    let app = spawn_app().await;

    Mock::given(method("POST"))
        .and(path("/submissions/v3/integration/submit/123/abc"))
        .and(body_partial_json(json!({ "context": { "pageUri": "https://www.homesecurecalculator.com/quote" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "inlineMessage": "Thanks" })))
        .expect(1)
        .mount(&app.server)
        .await;

    let lead = json!({
        "firstname": "Ada",
        "email": "ada@example.com",
        "address": "123 Main St, Atlanta, GA 30301",
        "pageUri": "https://www.homesecurecalculator.com/quote"
    });
    let (status, body) = app.post_json("/submit-lead", &lead, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = app
        .post_json("/submit-lead", &json!({ "email": "not-an-email" }), &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hubspot_sync_creates_contact_deal_and_line_item() {
    let app = spawn_app().await;

    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/contacts/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/contacts"))
        .and(body_partial_json(json!({ "properties": { "email": "ada@example.com", "state": "GA" } })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "c1" })))
        .expect(1)
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/deals/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/deals"))
        .and(body_partial_json(json!({
            "properties": {
                "lead_id": "lead-1",
                "listing_status": "Qualified",
                "lead_price": 30,
                "redacted_location": "Atlanta, GA 303xx"
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "d1" })))
        .expect(1)
        .mount(&app.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d1/associations/line_items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/line_items"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "li1" })))
        .expect(1)
        .mount(&app.server)
        .await;

    let body = json!({
        "payload": {
            "lead_id": "lead-1",
            "email": "ada@example.com",
            "city": "Atlanta",
            "state": "GA",
            "zip": "30301",
            "indoorCam": 2, "outdoorCam": 1, "doorbell": 1, "lock": 2,
            "upfront": 1500, "monthly": 40
        },
        "risk": { "scoring": { "riskScore": 60 }, "demographics": { "medianIncome": 45000 } }
    });
    let (status, body) = app.post_json("/hubspot-sync", &body, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "created");
    assert_eq!(body["contact_id"], "c1");
    assert_eq!(body["deal_id"], "d1");
    assert_eq!(body["line_item_id"], "li1");
    assert_eq!(body["lead_price"], 30);
    assert_eq!(body["lead_tier"], "Bronze");
}

#[tokio::test]
async fn test_hubspot_sync_same_lead_id_updates_without_duplicates() {
    let app = spawn_app().await;

    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/contacts/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [{ "id": "c1" }] })))
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/contacts/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "c1" })))
        .expect(1)
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/deals/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "d1", "properties": { "lead_id": "lead-1", "listing_status": "Sold" } }]
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/deals/d1"))
        .and(LeavesListingStatus)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "d1" })))
        .expect(1)
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/deals"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "dup" })))
        .expect(0)
        .mount(&app.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d1/associations/line_items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [{ "id": "li1" }] })))
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/line_items"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "li2" })))
        .expect(0)
        .mount(&app.server)
        .await;

    let body = json!({ "lead_id": "lead-1", "email": "ada@example.com" });
    let (status, body) = app.post_json("/hubspot-sync", &body, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "updated");
    assert_eq!(body["deal_id"], "d1");
    assert_eq!(body["line_item_id"], "li1");
}

#[tokio::test]
async fn test_hubspot_sync_requires_email() {
    let app = spawn_app().await;

    let (status, body) = app
        .post_json("/hubspot-sync", &json!({ "payload": { "firstname": "Ada" } }), &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing email");
}

// ============ Payment webhook ============

async fn mount_paid_deal(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "555",
            "properties": { "hs_latest_status": "succeeded", "hs_customer_email": "buyer@example.com" }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/555/associations/deals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [{ "id": "d1" }] })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_webhook_is_idempotent() {
    let app = spawn_app().await;
    mount_paid_deal(&app.server).await;

    // First read sees Qualified, every later read sees Sold
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "d1", "properties": { "listing_status": "Qualified" }
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&app.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "d1", "properties": { "listing_status": "Sold" }
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/deals/d1"))
        .and(body_partial_json(json!({ "properties": { "listing_status": "Sold" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "d1" })))
        .expect(1)
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&app.server)
        .await;

    let raw = r#"[{"objectId":555,"subscriptionType":"commerce_payment.propertyChange"}]"#;
    let signature = compute_v1(CLIENT_SECRET, raw.as_bytes());

    let (status, body) = app.post_webhook(raw, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], 1);
    assert_eq!(body["delivered"], 1);
    assert_eq!(body["processed"][0]["outcome"], "delivered");
    assert_eq!(body["processed"][0]["emailed"], true);

    let (status, body) = app.post_webhook(raw, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivered"], 0);
    assert_eq!(body["skipped"], 1);
    assert_eq!(body["processed"][0]["listing_status"], "Sold");
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature_before_any_crm_call() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "555" })))
        .expect(0)
        .mount(&app.server)
        .await;

    let raw = r#"[{"objectId":555}]"#;
    let tampered = r#"[{"objectId":556}]"#;
    let signature = compute_v1(CLIENT_SECRET, raw.as_bytes());

    let (status, body) = app.post_webhook(tampered, &signature).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");
}

#[tokio::test]
async fn test_webhook_isolates_failures_per_event() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/777"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/888"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "888", "properties": { "hs_latest_status": "processing" }
        })))
        .mount(&app.server)
        .await;

    let raw = r#"{"events":[{"objectId":777},{"objectId":888},{}]}"#;
    let signature = compute_v1(CLIENT_SECRET, raw.as_bytes());

    let (status, body) = app.post_webhook(raw, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], 3);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["processed"][1]["outcome"], "ignored");
    assert_eq!(body["processed"][2]["outcome"], "ignored");
}

#[tokio::test]
async fn test_webhook_malformed_event_does_not_block_the_batch() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/888"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "888", "properties": { "hs_latest_status": "processing" }
        })))
        .expect(1)
        .mount(&app.server)
        .await;

    let raw = r#"[{"objectId":888},{"objectId":{"bad":true}},{"objectId":true},42]"#;
    let signature = compute_v1(CLIENT_SECRET, raw.as_bytes());

    let (status, body) = app.post_webhook(raw, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], 4);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["processed"][0]["payment_id"], "888");
    for i in 1..4 {
        assert_eq!(body["processed"][i]["outcome"], "ignored");
        assert_eq!(body["processed"][i]["reason"], "malformed event");
    }

    // A body that is neither an array nor {events} is still rejected whole
    let raw = r#"{"objectId":888}"#;
    let signature = compute_v1(CLIENT_SECRET, raw.as_bytes());
    let (status, _) = app.post_webhook(raw, &signature).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_accepts_v3_signature_over_host_and_path() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/commerce_payments/888"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "888", "properties": { "hs_latest_status": "processing" }
        })))
        .expect(1)
        .mount(&app.server)
        .await;

    let raw = r#"[{"objectId":888}]"#;
    let signed = |timestamp: i64| {
        let timestamp = timestamp.to_string();
        let signature = compute_v3(
            CLIENT_SECRET,
            "POST",
            "https://hooks.example.com/hubspot-payment-webhook",
            raw.as_bytes(),
            &timestamp,
        )
        .unwrap();
        Request::builder()
            .method("POST")
            .uri("/hubspot-payment-webhook")
            .header(header::HOST, "hooks.example.com")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-hubspot-signature-v3", signature)
            .header("x-hubspot-request-timestamp", timestamp)
            .body(Body::from(raw))
            .unwrap()
    };

    let (status, body, _) = app.send(signed(NOW - 1_000)).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["received"], 1);
    assert_eq!(body["processed"][0]["payment_id"], "888");

    // Older than five minutes
    let (status, _, _) = app.send(signed(NOW - 6 * 60 * 1000)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============ Delivery ============

#[tokio::test]
async fn test_deal_id_cannot_escape_its_path_segment() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/contacts/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "5" })))
        .expect(0)
        .mount(&app.server)
        .await;

    let (status, _) = app.get("/deliverables?deal_id=..%2Fcontacts%2F5&token=x").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.get("/download-pdf?deal_id=..&token=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deliverables_expire_after_a_day() {
    let app = spawn_app().await;
    let expires_at = NOW + 24 * 60 * 60 * 1000;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "d1",
            "properties": {
                "listing_status": "Sold",
                "delivery_token": "tok-1",
                "delivery_expires_at": expires_at.to_string()
            }
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/deals/d1"))
        .and(body_partial_json(json!({ "properties": { "listing_status": "Delivered" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "d1" })))
        .expect(1)
        .mount(&app.server)
        .await;

    let request = Request::builder()
        .uri("/deliverables?deal_id=d1&token=tok-1")
        .body(Body::empty())
        .unwrap();
    let (status, html, _) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(html).unwrap();
    assert!(html.contains("https://api.example.com/download-pdf?deal_id=d1&amp;token=tok-1"));

    let (status, _) = app.get("/deliverables?deal_id=d1&token=wrong").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    app.clock.advance(Duration::from_secs(25 * 60 * 60));
    let (status, body) = app.get("/deliverables?deal_id=d1&token=tok-1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("expired"));

    let (status, _) = app.get("/deliverables?deal_id=d1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_download_redirects_to_signed_url() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "d2",
            "properties": {
                "listing_status": "Delivered",
                "delivery_token": "tok-2",
                "delivery_expires_at": (NOW + 60_000).to_string(),
                "deliverable_pdf_file_id": "f-pdf"
            }
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/v3/files/f-pdf/signed-url"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://files.example.com/f-pdf?sig=abc"
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/deals/d2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&app.server)
        .await;

    let request = Request::builder()
        .uri("/download-pdf?deal_id=d2&token=tok-2")
        .body(Body::empty())
        .unwrap();
    let (status, _, location) = app.send(request).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location.as_deref(), Some("https://files.example.com/f-pdf?sig=abc"));

    let (status, _) = app.get("/download-csv?deal_id=d2&token=tok-2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_issue_delivery_requires_api_key_and_never_regresses() {
    let app = spawn_app().await;

    Mock::given(method("GET"))
        .and(path("/crm/v3/objects/deals/d3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "d3", "properties": { "listing_status": "Delivered" }
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/deals/d3"))
        .and(LeavesListingStatus)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "d3" })))
        .expect(1)
        .mount(&app.server)
        .await;

    let request = json!({ "deal_id": "d3" });
    let (status, _) = app.post_json("/issue-delivery", &request, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .post_json("/issue-delivery", &request, &[("x-api-key", API_KEY)])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deal_id"], "d3");
    assert_eq!(body["delivery_expires_at"], NOW + 24 * 60 * 60 * 1000);
    let token = body["delivery_token"].as_str().unwrap();
    assert!(body["deliverables_url"]
        .as_str()
        .unwrap()
        .starts_with("https://api.example.com/deliverables?deal_id=d3&token="));
    assert!(body["pdf_download_url"].as_str().unwrap().ends_with(token));
}

#[tokio::test]
async fn test_upload_deliverables() {
    let app = spawn_app().await;

    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/deals/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "d7", "properties": { "lead_id": "lead-7" } }]
        })))
        .mount(&app.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/files/v3/files"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "file-1" })))
        .expect(2)
        .mount(&app.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/crm/v3/objects/deals/d7"))
        .and(body_partial_json(json!({
            "properties": { "deliverable_pdf_file_id": "file-1", "deliverable_csv_file_id": "file-1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "d7" })))
        .expect(1)
        .mount(&app.server)
        .await;

    let upload = json!({ "lead_id": "lead-7", "pdf_base64": "JVBERi0=", "csv_text": "a,b\n1,2" });

    let (status, _) = app
        .post_json("/upload-deliverables", &upload, &[("origin", "https://evil.example.com")])
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post_json("/upload-deliverables", &json!({ "lead_id": "lead-7" }), &[("origin", ORIGIN)])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .post_json("/upload-deliverables", &upload, &[("origin", ORIGIN)])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deal_id"], "d7");
    assert_eq!(body["pdf_file_id"], "file-1");
}

#[tokio::test]
async fn test_health_and_google_key() {
    let app = spawn_app().await;

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.get("/google-key").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["key"], "test-google-key");
}
