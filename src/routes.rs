use crate::config::Config;
use crate::handlers::{self, AppState, API_KEY_HEADER};
use crate::lead_handler;
use crate::webhook_handler;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Large enough for a base64-encoded PDF deliverable.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Ceiling for a whole request, including fan-out to upstreams.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves the OpenAPI specification YAML file.
///
/// This endpoint reads the `openapi.yml` file from the filesystem and serves it
/// with the appropriate content type. If the file is not found, it returns a 404 error.
async fn serve_openapi_spec() -> impl IntoResponse {
    match tokio::fs::read_to_string("openapi.yml").await {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/yaml")],
            content,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "OpenAPI spec not found").into_response(),
    }
}

/// Serves the Swagger UI HTML page, pointed at `serve_openapi_spec`.
async fn serve_swagger_ui() -> impl IntoResponse {
    let html = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>HSC Lead API - Swagger UI</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
    <style>
        body { margin: 0; padding: 0; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-standalone-preset.js"></script>
    <script>
        window.onload = function() {
            window.ui = SwaggerUIBundle({
                url: "/api-docs/openapi.yml",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>
"#;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
}

/// CORS restricted to the configured origins.
pub fn allow_list_cors(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(API_KEY_HEADER),
        ])
        .max_age(Duration::from_secs(86400))
}

/// Builds the application router.
///
/// Rate limiting is not applied here; `main` wraps the result so tests can
/// drive the router with `oneshot` without a peer address.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = allow_list_cors(&state.config);

    let api_routes = Router::new()
        // Data gateway + scoring
        .route(
            "/crime-data",
            get(handlers::nearby_crime).post(handlers::crime_summary_body),
        )
        .route("/crime", get(handlers::crime_summary_query))
        .route("/security-risk", get(handlers::security_risk))
        .route("/geocode", get(handlers::geocode))
        // Lead intake
        .route("/submit-lead", post(lead_handler::submit_lead))
        .route("/hubspot-sync", post(lead_handler::hubspot_sync))
        .route("/upload-deliverables", post(lead_handler::upload_deliverables))
        // Fulfillment + delivery
        .route(
            "/hubspot-payment-webhook",
            post(webhook_handler::hubspot_payment_webhook),
        )
        .route("/issue-delivery", post(handlers::issue_delivery))
        .route("/deliverables", get(handlers::deliverables))
        .route("/download-pdf", get(handlers::download_pdf))
        .route("/download-csv", get(handlers::download_csv))
        .layer(cors);

    // Public, non-PII: wildcard CORS is fine here
    let public_routes = Router::new()
        .route("/google-key", get(handlers::google_key))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/docs", get(serve_swagger_ui))
        .route("/api-docs/openapi.yml", get(serve_openapi_spec))
        .merge(api_routes)
        .merge(public_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
}
