use crate::config::Config;
use crate::errors::AppError;
use crate::models::string_or_number;
use crate::services::url_with_segments;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Deal property names used by the lead store.
pub mod deal_props {
    pub const DEAL_NAME: &str = "dealname";
    pub const AMOUNT: &str = "amount";
    pub const PIPELINE: &str = "pipeline";
    pub const DEAL_STAGE: &str = "dealstage";
    pub const LEAD_ID: &str = "lead_id";
    pub const LISTING_STATUS: &str = "listing_status";
    pub const LEAD_PRICE: &str = "lead_price";
    pub const LEAD_TIER: &str = "lead_tier";
    pub const REDACTED_LOCATION: &str = "redacted_location";
    pub const DELIVERY_TOKEN: &str = "delivery_token";
    pub const DELIVERY_EXPIRES_AT: &str = "delivery_expires_at";
    pub const PDF_FILE_ID: &str = "deliverable_pdf_file_id";
    pub const CSV_FILE_ID: &str = "deliverable_csv_file_id";
}

const DEAL_READ_PROPERTIES: [&str; 7] = [
    deal_props::LEAD_ID,
    deal_props::LISTING_STATUS,
    deal_props::LEAD_PRICE,
    deal_props::DELIVERY_TOKEN,
    deal_props::DELIVERY_EXPIRES_AT,
    deal_props::PDF_FILE_ID,
    deal_props::CSV_FILE_ID,
];

const PAYMENT_READ_PROPERTIES: [&str; 4] = [
    "hs_latest_status",
    "hs_customer_email",
    "hs_initial_amount",
    "hs_currency_code",
];

/// HubSpot-defined association type ids.
const DEAL_TO_CONTACT: u32 = 3;
const LINE_ITEM_TO_DEAL: u32 = 20;

/// A CRM object as returned by the v3 objects API.
#[derive(Debug, Clone, Deserialize)]
pub struct CrmRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl CrmRecord {
    /// Property value as a trimmed string; `None` when absent, null or empty.
    pub fn prop(&self, name: &str) -> Option<String> {
        let value = match self.properties.get(name)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!value.is_empty()).then_some(value)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CrmRecord>,
}

#[derive(Debug, Deserialize)]
struct AssociationResponse {
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    url: String,
}

/// Client for the HubSpot CRM, Files and Forms APIs.
///
/// The private-app token is optional so the service can start without it;
/// every authenticated call fails with `AppError::Configuration` until it is set.
#[derive(Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    base_url: String,
    forms_base_url: String,
    token: Option<String>,
}

impl CrmClient {
    /// Creates a new `CrmClient`.
    ///
    /// # Arguments
    ///
    /// * `config` - Supplies the token, base URLs and request timeout.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| {
                AppError::InternalError(format!("Failed to create HubSpot client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.hubspot_api_base_url.clone(),
            forms_base_url: config.hubspot_forms_base_url.clone(),
            token: config.hubspot_token.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Fails fast when the private-app token is missing.
    pub fn ensure_configured(&self) -> Result<(), AppError> {
        self.token().map(|_| ())
    }

    fn token(&self) -> Result<&str, AppError> {
        self.token.as_deref().ok_or_else(|| {
            AppError::Configuration("HUBSPOT_PRIVATE_APP_TOKEN is not set".to_string())
        })
    }

    /// Authenticated request to `base_url` + `segments`; ids are encoded per segment.
    fn request(&self, method: Method, segments: &[&str]) -> Result<reqwest::RequestBuilder, AppError> {
        let token = self.token()?;
        let url = url_with_segments(&self.base_url, segments)?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn ensure_success(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<reqwest::Response, AppError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(AppError::ExternalApiError(format!(
            "HubSpot {} failed {}: {}",
            operation, status, error_text
        )))
    }

    async fn parse<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<T, AppError> {
        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!(
                "Failed to parse HubSpot {} response: {}",
                operation, e
            ))
        })
    }

    /// First object whose `property` equals `value`.
    async fn search_one(
        &self,
        object: &str,
        property: &str,
        value: &str,
        properties: &[&str],
    ) -> Result<Option<CrmRecord>, AppError> {
        let body = json!({
            "filterGroups": [{
                "filters": [{ "propertyName": property, "operator": "EQ", "value": value }]
            }],
            "properties": properties,
            "limit": 1,
        });

        let response = self
            .request(Method::POST, &["crm", "v3", "objects", object, "search"])?
            .json(&body)
            .send()
            .await?;
        let response = Self::ensure_success(response, "search").await?;
        let found: SearchResponse = Self::parse(response, "search").await?;

        Ok(found.results.into_iter().next())
    }

    async fn create_object(
        &self,
        object: &str,
        properties: Map<String, Value>,
        associations: Vec<Value>,
    ) -> Result<CrmRecord, AppError> {
        let mut body = json!({ "properties": properties });
        if !associations.is_empty() {
            body["associations"] = Value::Array(associations);
        }

        let response = self
            .request(Method::POST, &["crm", "v3", "objects", object])?
            .json(&body)
            .send()
            .await?;
        let response = Self::ensure_success(response, &format!("create {}", object)).await?;

        Self::parse(response, "create").await
    }

    async fn update_object(
        &self,
        object: &str,
        id: &str,
        properties: Map<String, Value>,
    ) -> Result<(), AppError> {
        let response = self
            .request(Method::PATCH, &["crm", "v3", "objects", object, id])?
            .json(&json!({ "properties": properties }))
            .send()
            .await?;
        Self::ensure_success(response, &format!("update {}", object)).await?;

        tracing::debug!("Updated {} {}", object, id);
        Ok(())
    }

    /// Reads one object; `None` on 404.
    async fn get_object(
        &self,
        object: &str,
        id: &str,
        properties: &[&str],
    ) -> Result<Option<CrmRecord>, AppError> {
        let response = self
            .request(Method::GET, &["crm", "v3", "objects", object, id])?
            .query(&[("properties", properties.join(","))])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::ensure_success(response, &format!("get {}", object)).await?;

        Self::parse(response, "get").await.map(Some)
    }

    fn association(to_id: &str, type_id: u32) -> Value {
        json!({
            "to": { "id": to_id },
            "types": [{
                "associationCategory": "HUBSPOT_DEFINED",
                "associationTypeId": type_id,
            }],
        })
    }

    pub async fn search_contact_by_email(&self, email: &str) -> Result<Option<String>, AppError> {
        let found = self.search_one("contacts", "email", email, &["email"]).await?;
        Ok(found.map(|c| c.id))
    }

    pub async fn create_contact(&self, properties: Map<String, Value>) -> Result<String, AppError> {
        let contact = self.create_object("contacts", properties, Vec::new()).await?;
        tracing::info!("Created HubSpot contact {}", contact.id);
        Ok(contact.id)
    }

    pub async fn update_contact(
        &self,
        contact_id: &str,
        properties: Map<String, Value>,
    ) -> Result<(), AppError> {
        self.update_object("contacts", contact_id, properties).await
    }

    pub async fn find_deal_by_lead_id(&self, lead_id: &str) -> Result<Option<CrmRecord>, AppError> {
        self.search_one("deals", deal_props::LEAD_ID, lead_id, &DEAL_READ_PROPERTIES)
            .await
    }

    /// Creates a deal, associated to `contact_id` when given.
    pub async fn create_deal(
        &self,
        properties: Map<String, Value>,
        contact_id: Option<&str>,
    ) -> Result<String, AppError> {
        let associations = contact_id
            .map(|id| vec![Self::association(id, DEAL_TO_CONTACT)])
            .unwrap_or_default();
        let deal = self.create_object("deals", properties, associations).await?;

        tracing::info!("Created HubSpot deal {}", deal.id);
        Ok(deal.id)
    }

    pub async fn update_deal(
        &self,
        deal_id: &str,
        properties: Map<String, Value>,
    ) -> Result<(), AppError> {
        self.update_object("deals", deal_id, properties).await
    }

    pub async fn get_deal(&self, deal_id: &str) -> Result<Option<CrmRecord>, AppError> {
        self.get_object("deals", deal_id, &DEAL_READ_PROPERTIES).await
    }

    pub async fn get_payment(&self, payment_id: &str) -> Result<Option<CrmRecord>, AppError> {
        self.get_object("commerce_payments", payment_id, &PAYMENT_READ_PROPERTIES)
            .await
    }

    /// Ids of `to_object` records associated with `from_object/{id}`.
    pub async fn associated_ids(
        &self,
        from_object: &str,
        id: &str,
        to_object: &str,
    ) -> Result<Vec<String>, AppError> {
        let response = self
            .request(
                Method::GET,
                &["crm", "v3", "objects", from_object, id, "associations", to_object],
            )?
            .send()
            .await?;
        let response = Self::ensure_success(response, "associations").await?;
        let associations: AssociationResponse = Self::parse(response, "associations").await?;

        Ok(associations
            .results
            .iter()
            .filter_map(|r| r.get("id").or_else(|| r.get("toObjectId")))
            .filter_map(|id| match id {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect())
    }

    /// Creates a line item associated to `deal_id`.
    pub async fn create_line_item(
        &self,
        name: &str,
        price_usd: u32,
        deal_id: &str,
    ) -> Result<String, AppError> {
        let mut properties = Map::new();
        properties.insert("name".to_string(), json!(name));
        properties.insert("price".to_string(), json!(price_usd));
        properties.insert("quantity".to_string(), json!(1));

        let item = self
            .create_object(
                "line_items",
                properties,
                vec![Self::association(deal_id, LINE_ITEM_TO_DEAL)],
            )
            .await?;

        tracing::info!("Created line item {} for deal {}", item.id, deal_id);
        Ok(item.id)
    }

    /// Uploads a file with PRIVATE access and returns its id.
    pub async fn upload_private_file(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime: &str,
        folder_path: &str,
    ) -> Result<String, AppError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let form = Form::new()
            .part("file", part)
            .text("fileName", file_name.to_string())
            .text("folderPath", folder_path.to_string())
            .text("options", json!({ "access": "PRIVATE" }).to_string());

        let response = self
            .request(Method::POST, &["files", "v3", "files"])?
            .multipart(form)
            .send()
            .await?;
        let response = Self::ensure_success(response, "file upload").await?;
        let file: CrmRecord = Self::parse(response, "file upload").await?;

        tracing::info!("Uploaded private file {} as {}", file_name, file.id);
        Ok(file.id)
    }

    /// Short-lived download URL for a private file.
    pub async fn signed_file_url(&self, file_id: &str) -> Result<String, AppError> {
        let response = self
            .request(Method::GET, &["files", "v3", "files", file_id, "signed-url"])?
            .send()
            .await?;
        let response = Self::ensure_success(response, "signed url").await?;
        let signed: SignedUrlResponse = Self::parse(response, "signed url").await?;

        Ok(signed.url)
    }

    /// Posts a Forms v3 submission. Unauthenticated; the form ids are the credential.
    ///
    /// A 4xx from HubSpot means the submission itself was rejected and becomes
    /// `BadRequest`; other failures are upstream errors.
    pub async fn submit_form(
        &self,
        portal_id: &str,
        form_id: &str,
        submission: &Value,
    ) -> Result<(), AppError> {
        let url = url_with_segments(
            &self.forms_base_url,
            &["submissions", "v3", "integration", "submit", portal_id, form_id],
        )?;
        let response = self.client.post(url).json(submission).send().await?;

        if response.status().is_client_error() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!("HubSpot rejected form submission {}: {}", status, error_text);
            return Err(AppError::BadRequest(
                "Lead submission was rejected".to_string(),
            ));
        }
        Self::ensure_success(response, "form submission").await?;

        Ok(())
    }
}
