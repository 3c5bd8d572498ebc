//! External data gateway: household income, crime and geocoding providers.
//!
//! Read paths never fail because a provider did. Each lookup reports a
//! [`DataSource`] quality flag instead, and callers score with whatever came
//! back. Only successful upstream results are cached.

use crate::cache::{Clock, TtlCache};
use crate::circuit_breaker::{call_guarded, create_upstream_circuit_breaker, UpstreamBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::scoring;
use chrono::Datelike;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const INCOME_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const CRIME_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);
pub const GEOCODE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const CACHE_CAPACITY: u64 = 10_000;

/// Field names providers are known to use for median household income.
const INCOME_FIELDS: [&str; 7] = [
    "MedianHouseholdIncome",
    "medianHouseholdIncome",
    "Median_Income",
    "median_income",
    "medianIncome",
    "median_household_income",
    "MedianIncome",
];

/// Anything at or below this is not a plausible median income.
const INCOME_PLAUSIBILITY_FLOOR: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Rapidapi,
    Fbi,
    Google,
    Fallback,
    None,
}

fn http_client(config: &Config) -> Result<Client, AppError> {
    Client::builder()
        .timeout(config.upstream_timeout)
        .build()
        .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {}", e)))
}

/// `base` with `segments` appended, each percent-encoded. Empty and dot
/// segments are rejected so caller-supplied ids stay inside their segment.
pub(crate) fn url_with_segments(base: &str, segments: &[&str]) -> Result<Url, AppError> {
    if let Some(bad) = segments.iter().find(|s| matches!(s.trim(), "" | "." | "..")) {
        return Err(AppError::BadRequest(format!("Invalid path segment {:?}", bad)));
    }

    let mut url = Url::parse(base)
        .map_err(|e| AppError::InternalError(format!("Invalid base URL {}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| AppError::InternalError(format!("Base URL {} cannot have a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn json_or_error(response: reqwest::Response, upstream: &str) -> Result<Value, AppError> {
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::error!("{} returned error {}: {}", upstream, status, error_text);
        return Err(AppError::ExternalApiError(format!(
            "{} returned status {}",
            upstream, status
        )));
    }

    response.json().await.map_err(|e| {
        AppError::ExternalApiError(format!("Failed to parse {} response: {}", upstream, e))
    })
}

async fn get_json(client: &Client, url: Url, upstream: &str) -> Result<Value, AppError> {
    let response = client.get(url).send().await?;
    json_or_error(response, upstream).await
}

fn as_number(value: &Value) -> Option<f64> {
    let number: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Pulls a median household income out of an arbitrarily shaped payload.
///
/// Known field names are tried at the top level first; then the whole tree is
/// searched for any key containing both "median" and "income".
pub fn extract_median_income(payload: &Value) -> Option<f64> {
    let plausible = |v: &Value| as_number(v).filter(|n| *n > INCOME_PLAUSIBILITY_FLOOR);

    if let Value::Object(map) = payload {
        if let Some(n) = INCOME_FIELDS
            .iter()
            .filter_map(|field| map.get(*field))
            .find_map(plausible)
        {
            return Some(n);
        }
    }

    let mut stack = vec![payload];
    while let Some(current) = stack.pop() {
        match current {
            Value::Object(map) => {
                for (key, value) in map {
                    let key = key.to_lowercase();
                    if key.contains("median") && key.contains("income") {
                        if let Some(n) = plausible(value) {
                            return Some(n);
                        }
                    }
                    if value.is_object() || value.is_array() {
                        stack.push(value);
                    }
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }

    None
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeLookup {
    pub median_income: Option<f64>,
    pub source: DataSource,
    pub cache_hit: bool,
    pub ms: u64,
}

impl IncomeLookup {
    fn unavailable(source: DataSource, started: Instant) -> Self {
        Self {
            median_income: None,
            source,
            cache_hit: false,
            ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Median household income by ZIP (RapidAPI census proxy).
pub struct IncomeService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    cache: TtlCache<f64>,
    breaker: UpstreamBreaker,
}

impl IncomeService {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.income_api_base_url.clone(),
            api_key: config.rapidapi_key.clone(),
            cache: TtlCache::new(INCOME_TTL, CACHE_CAPACITY, clock),
            breaker: create_upstream_circuit_breaker(),
        })
    }

    pub async fn lookup(&self, zip: &str) -> IncomeLookup {
        let started = Instant::now();
        let zip = zip.trim();
        if zip.is_empty() {
            return IncomeLookup::unavailable(DataSource::None, started);
        }

        if let Some(median_income) = self.cache.get(zip).await {
            tracing::debug!("Income cache hit for zip={}", zip);
            return IncomeLookup {
                median_income: Some(median_income),
                source: DataSource::Rapidapi,
                cache_hit: true,
                ms: 0,
            };
        }

        let Some(api_key) = self.api_key.as_deref() else {
            return IncomeLookup::unavailable(DataSource::None, started);
        };

        match call_guarded(&self.breaker, "income", self.fetch(zip, api_key)).await {
            Ok(median_income) => {
                self.cache.set(zip, median_income).await;
                IncomeLookup {
                    median_income: Some(median_income),
                    source: DataSource::Rapidapi,
                    cache_hit: false,
                    ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => {
                tracing::warn!("Income lookup for zip={} fell back: {}", zip, e);
                IncomeLookup::unavailable(DataSource::Fallback, started)
            }
        }
    }

    /// A 2xx payload without a plausible income is treated as a failed lookup.
    async fn fetch(&self, zip: &str, api_key: &str) -> Result<f64, AppError> {
        let url = url_with_segments(
            &self.base_url,
            &["v1", "Census", "HouseholdIncomeByZip", zip],
        )?;
        let host = url.host_str().unwrap_or_default().to_string();

        let response = self
            .client
            .get(url)
            .header("x-rapidapi-key", api_key)
            .header("x-rapidapi-host", host)
            .send()
            .await?;
        let payload = json_or_error(response, "Income API").await?;

        extract_median_income(&payload).ok_or_else(|| {
            AppError::ExternalApiError("Income API response had no median income".to_string())
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrimeStat {
    pub actual: f64,
    pub rate_per_100k: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StateCrime {
    pub violent: CrimeStat,
    pub property: CrimeStat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCrimeLookup {
    pub violent: CrimeStat,
    pub property: CrimeStat,
    pub source: DataSource,
    pub cache_hit: bool,
    pub ms: u64,
}

impl StateCrimeLookup {
    fn unavailable(source: DataSource, started: Instant) -> Self {
        Self {
            violent: CrimeStat::default(),
            property: CrimeStat::default(),
            source,
            cache_hit: false,
            ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn rates(&self) -> scoring::CrimeRates {
        scoring::CrimeRates {
            violent_per_100k: self.violent.rate_per_100k,
            property_per_100k: self.property.rate_per_100k,
        }
    }

    pub fn total_incidents(&self) -> u64 {
        (self.violent.actual + self.property.actual).max(0.0).round() as u64
    }
}

/// Sums `actual` over the rows and averages the per-row rate over rows that
/// report a population.
fn summarize_rows(payload: &Value) -> CrimeStat {
    let rows = payload
        .get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut actual = 0.0;
    let mut rates = Vec::new();
    for row in rows {
        let count = row.get("actual").and_then(as_number).unwrap_or(0.0).max(0.0);
        actual += count;
        if let Some(rate) = row
            .get("population")
            .and_then(as_number)
            .and_then(|population| scoring::rate_per_100k(count, population))
        {
            rates.push(rate);
        }
    }

    let rate_per_100k = (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64);
    CrimeStat {
        actual,
        rate_per_100k,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyCrime {
    pub total_crimes: usize,
    pub weighted_crime_score: u32,
    pub risk_level: &'static str,
    pub crimes: Vec<Value>,
    pub source: DataSource,
}

/// FBI state summaries and RapidAPI point incidents.
pub struct CrimeService {
    client: Client,
    fbi_base_url: String,
    fbi_api_key: Option<String>,
    incidents_base_url: String,
    rapidapi_key: Option<String>,
    cache: TtlCache<StateCrime>,
    clock: Arc<dyn Clock>,
    fbi_breaker: UpstreamBreaker,
    incidents_breaker: UpstreamBreaker,
}

impl CrimeService {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client(config)?,
            fbi_base_url: config.fbi_api_base_url.clone(),
            fbi_api_key: config.fbi_api_key.clone(),
            incidents_base_url: config.crime_api_base_url.clone(),
            rapidapi_key: config.rapidapi_key.clone(),
            cache: TtlCache::new(CRIME_TTL, CACHE_CAPACITY, clock.clone()),
            clock,
            fbi_breaker: create_upstream_circuit_breaker(),
            incidents_breaker: create_upstream_circuit_breaker(),
        })
    }

    /// Five complete years ending last year.
    fn year_window(&self) -> (i32, i32) {
        let year = chrono::DateTime::from_timestamp_millis(self.clock.now_ms())
            .map(|now| now.year())
            .unwrap_or(2025);
        let end = year - 1;
        (end - 4, end)
    }

    /// Violent and property crime rates for a state, fetched concurrently.
    pub async fn state_rates(&self, state: &str) -> StateCrimeLookup {
        let started = Instant::now();
        let state = state.trim().to_uppercase();
        if state.is_empty() {
            return StateCrimeLookup::unavailable(DataSource::None, started);
        }

        if let Some(cached) = self.cache.get(&state).await {
            tracing::debug!("Crime cache hit for state={}", state);
            return StateCrimeLookup {
                violent: cached.violent,
                property: cached.property,
                source: DataSource::Fbi,
                cache_hit: true,
                ms: 0,
            };
        }

        match call_guarded(&self.fbi_breaker, "fbi", self.fetch_state(&state)).await {
            Ok(crime) => {
                self.cache.set(state.clone(), crime).await;
                StateCrimeLookup {
                    violent: crime.violent,
                    property: crime.property,
                    source: DataSource::Fbi,
                    cache_hit: false,
                    ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => {
                tracing::warn!("Crime lookup for state={} fell back: {}", state, e);
                StateCrimeLookup::unavailable(DataSource::Fallback, started)
            }
        }
    }

    async fn fetch_state(&self, state: &str) -> Result<StateCrime, AppError> {
        let (start, end) = self.year_window();
        let (start, end) = (start.to_string(), end.to_string());

        let build = |offense: &str| -> Result<Url, AppError> {
            let mut url = url_with_segments(
                &self.fbi_base_url,
                &[
                    "cde",
                    "crime-data",
                    "api",
                    "summarized",
                    "state",
                    state,
                    offense,
                    start.as_str(),
                    end.as_str(),
                ],
            )?;
            if let Some(key) = self.fbi_api_key.as_deref() {
                url.query_pairs_mut().append_pair("API_KEY", key);
            }
            Ok(url)
        };
        let violent_url = build("violent-crime")?;
        let property_url = build("property-crime")?;

        let (violent, property) = tokio::try_join!(
            get_json(&self.client, violent_url, "FBI violent crime"),
            get_json(&self.client, property_url, "FBI property crime"),
        )?;

        Ok(StateCrime {
            violent: summarize_rows(&violent),
            property: summarize_rows(&property),
        })
    }

    /// Raw FBI state summary: one year of violent crime, or everything when no
    /// year is given.
    pub async fn state_summary(&self, state: &str, year: Option<u32>) -> Result<Value, AppError> {
        let api_key = self
            .fbi_api_key
            .as_deref()
            .ok_or_else(|| AppError::Configuration("FBI_API_KEY is not set".to_string()))?;

        let state = state.trim().to_uppercase();
        let year = year.map(|y| y.to_string());
        let mut segments = vec!["sapi", "api", "summarized", "state", state.as_str()];
        match year.as_deref() {
            Some(y) => segments.extend(["violent-crime", y, y]),
            None => segments.push("all"),
        }
        let mut url = url_with_segments(&self.fbi_base_url, &segments)?;
        url.query_pairs_mut().append_pair("api_key", api_key);

        let fetch = get_json(&self.client, url, "FBI summary");

        match call_guarded(&self.fbi_breaker, "fbi", fetch).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                tracing::warn!("FBI summary for state={} fell back: {}", state, e);
                Ok(json!({ "results": [], "source": "fallback" }))
            }
        }
    }

    /// Incidents within one mile of a point, weighted by severity.
    pub async fn nearby_incidents(&self, lat: f64, lng: f64) -> NearbyCrime {
        let Some(api_key) = self.rapidapi_key.as_deref() else {
            return Self::summarize_incidents(Vec::new(), DataSource::None);
        };

        match call_guarded(
            &self.incidents_breaker,
            "crime incidents",
            self.fetch_incidents(lat, lng, api_key),
        )
        .await
        {
            Ok(crimes) => Self::summarize_incidents(crimes, DataSource::Rapidapi),
            Err(e) => {
                tracing::warn!("Nearby crime lookup fell back: {}", e);
                Self::summarize_incidents(Vec::new(), DataSource::Fallback)
            }
        }
    }

    async fn fetch_incidents(&self, lat: f64, lng: f64, api_key: &str) -> Result<Vec<Value>, AppError> {
        let mut url = url_with_segments(&self.incidents_base_url, &["crime"])?;
        url.query_pairs_mut()
            .append_pair("lat", &lat.to_string())
            .append_pair("lng", &lng.to_string())
            .append_pair("radius", "1");
        let host = url.host_str().unwrap_or_default().to_string();

        let response = self
            .client
            .get(url)
            .header("X-RapidAPI-Key", api_key)
            .header("X-RapidAPI-Host", host)
            .send()
            .await?;
        let payload = json_or_error(response, "Crime API").await?;

        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn summarize_incidents(crimes: Vec<Value>, source: DataSource) -> NearbyCrime {
        let weighted = scoring::weighted_incident_score(
            crimes
                .iter()
                .map(|c| c.get("offense").and_then(Value::as_str).unwrap_or_default()),
        );

        NearbyCrime {
            total_crimes: crimes.len(),
            weighted_crime_score: weighted,
            risk_level: scoring::incident_risk_level(weighted),
            crimes,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeResult {
    pub lat: f64,
    pub lng: f64,
    pub formatted_address: String,
    pub zip: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeLookup {
    pub location: Option<GeocodeResult>,
    pub source: DataSource,
    pub cache_hit: bool,
}

/// Address to coordinates via the Google Geocoding API.
pub struct GeocodeService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    cache: TtlCache<Option<GeocodeResult>>,
    breaker: UpstreamBreaker,
}

impl GeocodeService {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.geocode_api_base_url.clone(),
            api_key: config.google_api_key.clone(),
            cache: TtlCache::new(GEOCODE_TTL, CACHE_CAPACITY, clock),
            breaker: create_upstream_circuit_breaker(),
        })
    }

    pub async fn lookup(&self, address: &str) -> GeocodeLookup {
        let key = address.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if key.is_empty() {
            return GeocodeLookup {
                location: None,
                source: DataSource::None,
                cache_hit: false,
            };
        }

        if let Some(location) = self.cache.get(&key).await {
            return GeocodeLookup {
                location,
                source: DataSource::Google,
                cache_hit: true,
            };
        }

        let Some(api_key) = self.api_key.as_deref() else {
            return GeocodeLookup {
                location: None,
                source: DataSource::None,
                cache_hit: false,
            };
        };

        match call_guarded(&self.breaker, "geocode", self.fetch(address, api_key)).await {
            Ok(location) => {
                self.cache.set(key, location.clone()).await;
                GeocodeLookup {
                    location,
                    source: DataSource::Google,
                    cache_hit: false,
                }
            }
            Err(e) => {
                tracing::warn!("Geocode lookup fell back: {}", e);
                GeocodeLookup {
                    location: None,
                    source: DataSource::Fallback,
                    cache_hit: false,
                }
            }
        }
    }

    async fn fetch(&self, address: &str, api_key: &str) -> Result<Option<GeocodeResult>, AppError> {
        let mut url = url_with_segments(&self.base_url, &["maps", "api", "geocode", "json"])?;
        url.query_pairs_mut()
            .append_pair("address", address.trim())
            .append_pair("key", api_key);

        let payload = get_json(&self.client, url, "Geocoding API").await?;

        match payload.get("status").and_then(Value::as_str).unwrap_or_default() {
            "OK" => Ok(parse_geocode(&payload)),
            "ZERO_RESULTS" => Ok(None),
            other => Err(AppError::ExternalApiError(format!(
                "Geocoding API status {}",
                other
            ))),
        }
    }
}

fn parse_geocode(payload: &Value) -> Option<GeocodeResult> {
    let first = payload.get("results")?.as_array()?.first()?;
    let location = first.get("geometry")?.get("location")?;

    let component = |kind: &str| {
        first
            .get("address_components")
            .and_then(Value::as_array)
            .and_then(|components| {
                components.iter().find(|c| {
                    c.get("types")
                        .and_then(Value::as_array)
                        .is_some_and(|types| types.iter().any(|t| t.as_str() == Some(kind)))
                })
            })
            .and_then(|c| c.get("short_name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Some(GeocodeResult {
        lat: location.get("lat").and_then(Value::as_f64)?,
        lng: location.get("lng").and_then(Value::as_f64)?,
        formatted_address: first
            .get("formatted_address")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        zip: component("postal_code"),
        state: component("administrative_area_level_1"),
    })
}
