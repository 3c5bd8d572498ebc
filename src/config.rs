use std::time::Duration;

use crate::properties::PropertyMap;

pub const DEFAULT_ALLOWED_ORIGINS: [&str; 3] = [
    "https://www.homesecurecalculator.com",
    "https://homesecurecalculator.com",
    "https://hubspotgate.netlify.app",
];

/// Runtime configuration.
///
/// Upstream secrets are optional at startup. A handler that needs one that is
/// missing fails with `AppError::Configuration` before making any call.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub allowed_origins: Vec<String>,

    // Data providers
    pub rapidapi_key: Option<String>,
    pub fbi_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub upstream_timeout: Duration,

    // HubSpot
    pub hubspot_token: Option<String>,
    pub hubspot_portal_id: Option<String>,
    pub hubspot_form_id: Option<String>,
    pub hubspot_pipeline_id: Option<String>,
    pub hubspot_stage_qualified: Option<String>,
    pub hubspot_stage_paid: Option<String>,
    pub hubspot_client_secret: Option<String>,
    pub hubspot_files_folder_path: String,
    pub property_map: PropertyMap,

    // Delivery
    pub lead_store_api_key: Option<String>,
    pub deliverables_base_url: String,
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_from_email: Option<String>,

    // Upstream base URLs (overridable for tests and staging)
    pub hubspot_api_base_url: String,
    pub hubspot_forms_base_url: String,
    pub income_api_base_url: String,
    pub crime_api_base_url: String,
    pub fbi_api_base_url: String,
    pub geocode_api_base_url: String,
    pub sendgrid_api_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect(),
            rapidapi_key: None,
            fbi_api_key: None,
            google_api_key: None,
            upstream_timeout: Duration::from_secs(8),
            hubspot_token: None,
            hubspot_portal_id: None,
            hubspot_form_id: None,
            hubspot_pipeline_id: None,
            hubspot_stage_qualified: None,
            hubspot_stage_paid: None,
            hubspot_client_secret: None,
            hubspot_files_folder_path: "/hsc-deliverables".to_string(),
            property_map: PropertyMap::default(),
            lead_store_api_key: None,
            deliverables_base_url: "https://api.netcoreleads.com".to_string(),
            sendgrid_api_key: None,
            sendgrid_from_email: None,
            hubspot_api_base_url: "https://api.hubapi.com".to_string(),
            hubspot_forms_base_url: "https://api.hsforms.com".to_string(),
            income_api_base_url: "https://household-income-by-zip-code.p.rapidapi.com".to_string(),
            crime_api_base_url: "https://crime-data.p.rapidapi.com".to_string(),
            fbi_api_base_url: "https://api.usa.gov/crime/fbi".to_string(),
            geocode_api_base_url: "https://maps.googleapis.com".to_string(),
            sendgrid_api_base_url: "https://api.sendgrid.com".to_string(),
        }
    }
}

fn optional_secret(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn base_url(name: &str, default: String) -> anyhow::Result<String> {
    match optional_secret(name) {
        None => Ok(default),
        Some(url) => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
            Ok(url.trim_end_matches('/').to_string())
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            allowed_origins: match optional_secret("ALLOWED_ORIGINS") {
                None => defaults.allowed_origins,
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(|origin| {
                        url::Url::parse(origin)
                            .map_err(|e| anyhow::anyhow!("Invalid origin '{}': {}", origin, e))?;
                        Ok(origin.trim_end_matches('/').to_string())
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?,
            },
            rapidapi_key: optional_secret("RAPIDAPI_KEY"),
            fbi_api_key: optional_secret("FBI_API_KEY"),
            google_api_key: optional_secret("GOOGLE_API_KEY"),
            upstream_timeout: match optional_secret("UPSTREAM_TIMEOUT_SECS") {
                None => defaults.upstream_timeout,
                Some(secs) => secs
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
                    .ok_or_else(|| {
                        anyhow::anyhow!("UPSTREAM_TIMEOUT_SECS must be a positive integer")
                    })?,
            },
            hubspot_token: optional_secret("HUBSPOT_PRIVATE_APP_TOKEN"),
            hubspot_portal_id: optional_secret("HUBSPOT_PORTAL_ID"),
            hubspot_form_id: optional_secret("HUBSPOT_FORM_ID"),
            hubspot_pipeline_id: optional_secret("HUBSPOT_PIPELINE_ID"),
            hubspot_stage_qualified: optional_secret("HUBSPOT_DEAL_STAGE_QUALIFIED"),
            hubspot_stage_paid: optional_secret("HUBSPOT_DEAL_STAGE_PAID"),
            hubspot_client_secret: optional_secret("HUBSPOT_APP_CLIENT_SECRET"),
            hubspot_files_folder_path: optional_secret("HUBSPOT_FILES_FOLDER_PATH")
                .unwrap_or(defaults.hubspot_files_folder_path),
            property_map: match optional_secret("HUBSPOT_PROPERTY_MAP") {
                None => defaults.property_map,
                Some(spec) => PropertyMap::with_overrides(&spec)
                    .map_err(|e| anyhow::anyhow!("HUBSPOT_PROPERTY_MAP: {}", e))?,
            },
            lead_store_api_key: optional_secret("LEAD_STORE_API_KEY"),
            deliverables_base_url: base_url("LEAD_STORE_API_URL", defaults.deliverables_base_url)?,
            sendgrid_api_key: optional_secret("SENDGRID_API_KEY"),
            sendgrid_from_email: optional_secret("SENDGRID_FROM_EMAIL"),
            hubspot_api_base_url: base_url("HUBSPOT_API_BASE_URL", defaults.hubspot_api_base_url)?,
            hubspot_forms_base_url: base_url(
                "HUBSPOT_FORMS_BASE_URL",
                defaults.hubspot_forms_base_url,
            )?,
            income_api_base_url: base_url("INCOME_API_BASE_URL", defaults.income_api_base_url)?,
            crime_api_base_url: base_url("CRIME_API_BASE_URL", defaults.crime_api_base_url)?,
            fbi_api_base_url: base_url("FBI_API_BASE_URL", defaults.fbi_api_base_url)?,
            geocode_api_base_url: base_url("GEOCODE_API_BASE_URL", defaults.geocode_api_base_url)?,
            sendgrid_api_base_url: base_url(
                "SENDGRID_API_BASE_URL",
                defaults.sendgrid_api_base_url,
            )?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Server Port: {}", config.port);
        tracing::debug!("Allowed origins: {:?}", config.allowed_origins);
        tracing::debug!("Deliverables base URL: {}", config.deliverables_base_url);
        for (name, present) in [
            ("HUBSPOT_PRIVATE_APP_TOKEN", config.hubspot_token.is_some()),
            ("HUBSPOT_APP_CLIENT_SECRET", config.hubspot_client_secret.is_some()),
            ("RAPIDAPI_KEY", config.rapidapi_key.is_some()),
            ("FBI_API_KEY", config.fbi_api_key.is_some()),
            ("SENDGRID_API_KEY", config.sendgrid_api_key.is_some()),
            ("LEAD_STORE_API_KEY", config.lead_store_api_key.is_some()),
        ] {
            if !present {
                tracing::warn!("{} not set; dependent endpoints will be unavailable", name);
            }
        }

        Ok(config)
    }

    pub fn is_allowed_origin(&self, origin: &str) -> bool {
        let origin = origin.trim().trim_end_matches('/');
        self.allowed_origins.iter().any(|o| o == origin)
    }
}
