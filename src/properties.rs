//! Canonical contact fields and their HubSpot property names.
//!
//! The set of fields is closed. Deployments can rename the external property
//! for a field through `HUBSPOT_PROPERTY_MAP`, but cannot invent new fields:
//! unknown keys fail at startup instead of being dropped at request time.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContactField {
    FirstName,
    LastName,
    Email,
    Phone,
    City,
    StateCode,
    StateName,
    Zip,
    StreetAddress,
    Timezone,
    IpTimezone,
    IpStateCode,
    IpStateName,
    HscDevices,
    HscMonthly,
    HscUpfront,
    HscPropertyAddress,
    HscRiskScore,
    HscSystemTier,
    InstallationTier,
    InstallationType,
    ServicePlan,
    SystemTier,
    SmartLocks,
    UtmCampaign,
    UtmContent,
    UtmSource,
    UtmMedium,
    UtmTerm,
    UtmData,
    TotalRevenue,
    HomeOwnership,
    HomeSize,
    Timeline,
}

impl ContactField {
    pub const ALL: [ContactField; 34] = [
        ContactField::FirstName,
        ContactField::LastName,
        ContactField::Email,
        ContactField::Phone,
        ContactField::City,
        ContactField::StateCode,
        ContactField::StateName,
        ContactField::Zip,
        ContactField::StreetAddress,
        ContactField::Timezone,
        ContactField::IpTimezone,
        ContactField::IpStateCode,
        ContactField::IpStateName,
        ContactField::HscDevices,
        ContactField::HscMonthly,
        ContactField::HscUpfront,
        ContactField::HscPropertyAddress,
        ContactField::HscRiskScore,
        ContactField::HscSystemTier,
        ContactField::InstallationTier,
        ContactField::InstallationType,
        ContactField::ServicePlan,
        ContactField::SystemTier,
        ContactField::SmartLocks,
        ContactField::UtmCampaign,
        ContactField::UtmContent,
        ContactField::UtmSource,
        ContactField::UtmMedium,
        ContactField::UtmTerm,
        ContactField::UtmData,
        ContactField::TotalRevenue,
        ContactField::HomeOwnership,
        ContactField::HomeSize,
        ContactField::Timeline,
    ];

    /// Canonical key, as used in payloads and `HUBSPOT_PROPERTY_MAP`.
    pub fn key(&self) -> &'static str {
        match self {
            ContactField::FirstName => "firstname",
            ContactField::LastName => "lastname",
            ContactField::Email => "email",
            ContactField::Phone => "phone",
            ContactField::City => "city",
            ContactField::StateCode => "state_code",
            ContactField::StateName => "state_name",
            ContactField::Zip => "zip",
            ContactField::StreetAddress => "street_address",
            ContactField::Timezone => "timezone",
            ContactField::IpTimezone => "ip_timezone",
            ContactField::IpStateCode => "ip_state_code",
            ContactField::IpStateName => "ip_state_name",
            ContactField::HscDevices => "hsc_devices",
            ContactField::HscMonthly => "hsc_monthly",
            ContactField::HscUpfront => "hsc_upfront",
            ContactField::HscPropertyAddress => "hsc_property_address",
            ContactField::HscRiskScore => "hsc_risk_score",
            ContactField::HscSystemTier => "hsc_system_tier",
            ContactField::InstallationTier => "installation_tier",
            ContactField::InstallationType => "installation_type",
            ContactField::ServicePlan => "service_plan",
            ContactField::SystemTier => "system_tier",
            ContactField::SmartLocks => "smart_locks",
            ContactField::UtmCampaign => "utm_campaign",
            ContactField::UtmContent => "utm_content",
            ContactField::UtmSource => "utm_source",
            ContactField::UtmMedium => "utm_medium",
            ContactField::UtmTerm => "utm_term",
            ContactField::UtmData => "utm_data",
            ContactField::TotalRevenue => "total_revenue",
            ContactField::HomeOwnership => "home_ownership",
            ContactField::HomeSize => "home_size",
            ContactField::Timeline => "timeline",
        }
    }

    /// HubSpot internal property name used when no override is configured.
    pub fn default_property(&self) -> &'static str {
        match self {
            ContactField::StateCode => "state",
            ContactField::StateName => "state_region",
            ContactField::StreetAddress => "address",
            ContactField::Timezone => "time_zone",
            ContactField::IpStateCode => "ip_state_code_region_code",
            ContactField::IpStateName => "ip_state_region",
            other => other.key(),
        }
    }
}

impl fmt::Display for ContactField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ContactField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        ContactField::ALL
            .iter()
            .copied()
            .find(|f| f.key() == key)
            .ok_or_else(|| format!("unknown contact field '{}'", key))
    }
}

/// Canonical field → HubSpot property name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMap {
    names: BTreeMap<ContactField, String>,
}

impl Default for PropertyMap {
    fn default() -> Self {
        Self {
            names: ContactField::ALL
                .iter()
                .map(|f| (*f, f.default_property().to_string()))
                .collect(),
        }
    }
}

impl PropertyMap {
    /// Applies `canonical=external,...` overrides on top of the defaults.
    ///
    /// Rejects unknown canonical keys, entries without `=`, and empty names.
    pub fn with_overrides(spec: &str) -> Result<Self, String> {
        let mut map = Self::default();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, external) = entry
                .split_once('=')
                .ok_or_else(|| format!("property override '{}' must look like key=name", entry))?;
            let field: ContactField = key.parse()?;
            let external = external.trim();
            if external.is_empty() {
                return Err(format!("property override for '{}' has an empty name", field));
            }
            map.names.insert(field, external.to_string());
        }

        Ok(map)
    }

    pub fn property_name(&self, field: ContactField) -> &str {
        self.names
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.default_property())
    }

    /// Converts canonical values to a HubSpot `properties` object.
    pub fn to_properties(&self, values: &BTreeMap<ContactField, Value>) -> Map<String, Value> {
        values
            .iter()
            .map(|(field, value)| (self.property_name(*field).to_string(), value.clone()))
            .collect()
    }
}
