use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============ Serde helpers ============

/// Deserializes an id that upstreams send either as a string or a number.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Like [`string_or_number`], but absent, null and blank values become `None`.
pub fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(de::Error::custom(format!(
                "expected string or number, got {}",
                other
            )))
        }
    };
    Ok((!value.is_empty()).then_some(value))
}

/// Lenient numeric parse used for calculator inputs: anything unparsable or
/// non-finite is 0.
pub fn lenient_number(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .unwrap_or(0.0)
}

// ============ Deal lifecycle ============

/// Listing status of a deal. Ordered: a deal only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListingStatus {
    Qualified,
    Sold,
    Delivered,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Qualified => "Qualified",
            ListingStatus::Sold => "Sold",
            ListingStatus::Delivered => "Delivered",
        }
    }

    /// Parses a CRM value. Unknown or empty values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            s if s.eq_ignore_ascii_case("qualified") => Some(ListingStatus::Qualified),
            s if s.eq_ignore_ascii_case("sold") => Some(ListingStatus::Sold),
            s if s.eq_ignore_ascii_case("delivered") => Some(ListingStatus::Delivered),
            _ => None,
        }
    }

    /// True once payment has been processed for the deal.
    pub fn is_fulfilled(status: Option<Self>) -> bool {
        status.is_some_and(|s| s >= ListingStatus::Sold)
    }

    /// Whether moving from `current` to `self` is a forward step.
    pub fn can_advance_from(&self, current: Option<Self>) -> bool {
        current.map_or(true, |c| *self > c)
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Data gateway requests ============

/// Query for `GET /security-risk`. Device and spend values are parsed leniently.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRiskQuery {
    pub lat: Option<String>,
    pub lng: Option<String>,
    pub zip: Option<String>,
    pub state: Option<String>,
    pub indoor_cam: Option<String>,
    pub outdoor_cam: Option<String>,
    pub doorbell: Option<String>,
    pub lock: Option<String>,
    pub upfront: Option<String>,
    pub monthly: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinatesQuery {
    pub lat: Option<String>,
    pub lng: Option<String>,
}

/// State summary request, as a query string or a JSON body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrimeSummaryRequest {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub year: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeocodeQuery {
    pub address: Option<String>,
}

// ============ Lead intake ============

/// Body of `POST /submit-lead`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmitLeadRequest {
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Free-text `"street, city, ST zip[, country]"`.
    pub address: Option<String>,
    pub home_ownership: Option<String>,
    pub timeline: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    #[serde(rename = "pageUri")]
    pub page_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitLeadResponse {
    pub success: bool,
}

/// Result of `POST /hubspot-sync`.
#[derive(Debug, Clone, Serialize)]
pub struct HubspotSyncResponse {
    pub ok: bool,
    /// "created" or "updated", for the contact.
    pub mode: &'static str,
    pub lead_id: String,
    pub contact_id: String,
    pub deal_id: String,
    pub line_item_id: Option<String>,
    pub lead_price: u32,
    pub lead_tier: &'static str,
}

// ============ Delivery ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueDeliveryRequest {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub deal_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryQuery {
    pub deal_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadDeliverablesRequest {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub pdf_base64: Option<String>,
    #[serde(default)]
    pub csv_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadDeliverablesResponse {
    pub ok: bool,
    pub deal_id: String,
    pub pdf_file_id: String,
    pub csv_file_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listing_status_order() {
        assert!(ListingStatus::Qualified < ListingStatus::Sold);
        assert!(ListingStatus::Sold < ListingStatus::Delivered);
        assert!(ListingStatus::Sold.can_advance_from(Some(ListingStatus::Qualified)));
        assert!(ListingStatus::Sold.can_advance_from(None));
        assert!(!ListingStatus::Sold.can_advance_from(Some(ListingStatus::Delivered)));
        assert!(!ListingStatus::Sold.can_advance_from(Some(ListingStatus::Sold)));
    }

    #[test]
    fn test_listing_status_parse() {
        assert_eq!(ListingStatus::parse(" sold "), Some(ListingStatus::Sold));
        assert_eq!(ListingStatus::parse("Pending"), None);
        assert_eq!(ListingStatus::parse(""), None);
        assert!(ListingStatus::is_fulfilled(Some(ListingStatus::Delivered)));
        assert!(!ListingStatus::is_fulfilled(None));
    }

    #[test]
    fn test_ids_accept_numbers() {
        let req: IssueDeliveryRequest = serde_json::from_value(json!({ "deal_id": 9876 })).unwrap();
        assert_eq!(req.deal_id.as_deref(), Some("9876"));

        let req: IssueDeliveryRequest = serde_json::from_value(json!({ "deal_id": "  " })).unwrap();
        assert_eq!(req.deal_id, None);

        let req: IssueDeliveryRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.deal_id, None);
    }

    #[test]
    fn test_lenient_number() {
        assert_eq!(lenient_number(Some("2")), 2.0);
        assert_eq!(lenient_number(Some("abc")), 0.0);
        assert_eq!(lenient_number(Some("NaN")), 0.0);
        assert_eq!(lenient_number(None), 0.0);
    }
}
