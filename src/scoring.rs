//! Risk and monetization scoring.
//!
//! Pure functions only: no I/O, no clocks, no randomness. Every sub-score is an
//! integer in a documented closed interval, and inputs are sanitised first so
//! NaN, infinite or negative values can never push a result out of range.
//!
//! Sub-scores are rounded before they feed later formulas and weights are
//! expressed as integer percentages, which keeps results stable at `.5`
//! boundaries.

use serde::Serialize;

/// Model version reported alongside every score bundle.
pub const MODEL_VERSION: &str = "enterprise-1.0.0";

/// Violent crimes per 100k that map to a normalised score of 100.
pub const VIOLENT_REFERENCE_MAX: f64 = 900.0;
/// Property crimes per 100k that map to a normalised score of 100.
pub const PROPERTY_REFERENCE_MAX: f64 = 6000.0;

pub const INCOME_FLOOR: f64 = 35_000.0;
pub const INCOME_CEILING: f64 = 160_000.0;

pub const MITIGATION_CAP: f64 = 35.0;
const COVERAGE_CAP: f64 = 40.0;

pub const MIN_LEAD_PRICE: u32 = 25;
pub const MAX_LEAD_PRICE: u32 = 150;

/// States where lead buyers pay a premium.
pub const HIGH_DEMAND_STATES: [&str; 10] =
    ["CA", "TX", "FL", "NY", "NJ", "IL", "GA", "NC", "AZ", "WA"];

/// Installed security devices.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceCounts {
    pub indoor_cam: f64,
    pub outdoor_cam: f64,
    pub doorbell: f64,
    pub lock: f64,
}

impl DeviceCounts {
    fn sanitized(&self) -> Self {
        Self {
            indoor_cam: non_negative(self.indoor_cam),
            outdoor_cam: non_negative(self.outdoor_cam),
            doorbell: non_negative(self.doorbell),
            lock: non_negative(self.lock),
        }
    }
}

/// Planned spend on the system.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Spend {
    pub upfront: f64,
    pub monthly: f64,
}

/// Crime rates per 100k residents. `None` means the provider had no data.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrimeRates {
    pub violent_per_100k: Option<f64>,
    pub property_per_100k: Option<f64>,
}

/// Converts a raw count and population into a rate per 100k.
pub fn rate_per_100k(count: f64, population: f64) -> Option<f64> {
    if population.is_finite() && population > 0.0 && count.is_finite() {
        Some(count.max(0.0) / population * 100_000.0)
    } else {
        None
    }
}

/// Everything the risk model consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskInputs {
    pub crime: CrimeRates,
    pub median_income: Option<f64>,
    pub devices: DeviceCounts,
    pub spend: Spend,
    /// Two-letter state code, used for price adjustment.
    pub state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskZone {
    Low,
    Moderate,
    High,
}

impl RiskZone {
    pub fn from_score(risk_score: u32) -> Self {
        if risk_score < 35 {
            RiskZone::Low
        } else if risk_score < 70 {
            RiskZone::Moderate
        } else {
            RiskZone::High
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            RiskZone::Low => "#10b981",
            RiskZone::Moderate => "#f59e0b",
            RiskZone::High => "#ef4444",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LeadTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl LeadTier {
    pub fn from_quality(quality_score: u32) -> Self {
        if quality_score >= 85 {
            LeadTier::Platinum
        } else if quality_score >= 70 {
            LeadTier::Gold
        } else if quality_score >= 55 {
            LeadTier::Silver
        } else {
            LeadTier::Bronze
        }
    }

    pub fn base_price(&self) -> u32 {
        match self {
            LeadTier::Platinum => 95,
            LeadTier::Gold => 65,
            LeadTier::Silver => 45,
            LeadTier::Bronze => 25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadTier::Platinum => "Platinum",
            LeadTier::Gold => "Gold",
            LeadTier::Silver => "Silver",
            LeadTier::Bronze => "Bronze",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IncomeScores {
    pub affluence_score: u32,
    pub income_risk: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub us: u32,
    pub state: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Monetization {
    pub quality_score: u32,
    pub tier: LeadTier,
    pub price_usd: u32,
    pub affluence_score: u32,
    pub intent_score: u32,
    pub urgency_score: u32,
}

/// The full computed bundle. Ephemeral: it is returned to the caller or
/// flattened into CRM properties, never stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBundle {
    pub risk_score: u32,
    pub zone: RiskZone,
    pub crime_index: u32,
    pub response_risk: u32,
    pub exposure_score: u32,
    pub mitigation_score: u32,
    pub income_risk: u32,
    pub affluence_score: u32,
    pub percentiles: Percentiles,
    pub monetization: Monetization,
}

/// Signals needed to price a lead when the full crime picture is not at hand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonetizationInputs {
    pub median_income: Option<f64>,
    pub risk_score: u32,
    pub devices: DeviceCounts,
    pub spend: Spend,
    pub state: Option<String>,
}

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

fn clamp_score(value: f64) -> f64 {
    clamp(value, 0.0, 100.0)
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Weighted sum with integer-percent weights.
fn weighted(terms: &[(f64, f64)]) -> f64 {
    terms.iter().map(|(value, weight)| value * weight).sum::<f64>() / 100.0
}

fn to_score(value: f64) -> u32 {
    clamp_score(value).round() as u32
}

/// Normalised crime index in [0, 100]; violent crime weighs 60%.
pub fn crime_index(rates: &CrimeRates) -> u32 {
    let norm = |rate: Option<f64>, reference: f64| {
        rate.map(|r| clamp_score(non_negative(r) / reference * 100.0))
            .unwrap_or(0.0)
    };

    let violent = norm(rates.violent_per_100k, VIOLENT_REFERENCE_MAX);
    let property = norm(rates.property_per_100k, PROPERTY_REFERENCE_MAX);

    to_score(weighted(&[(violent, 60.0), (property, 40.0)]))
}

/// Affluence and income risk; they always sum to exactly 100.
/// Unknown income yields the neutral 50/50 prior.
pub fn income_scores(median_income: Option<f64>) -> IncomeScores {
    let income = match median_income {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => {
            return IncomeScores {
                affluence_score: 50,
                income_risk: 50,
            }
        }
    };

    let affluence =
        to_score((income - INCOME_FLOOR) / (INCOME_CEILING - INCOME_FLOOR) * 100.0);

    IncomeScores {
        affluence_score: affluence,
        income_risk: 100 - affluence,
    }
}

/// Risk reduction from installed devices, capped at [`MITIGATION_CAP`].
/// Outdoor cameras and locks mitigate the most.
pub fn mitigation_score(devices: &DeviceCounts) -> u32 {
    let d = devices.sanitized();
    let raw = d.indoor_cam * 2.0 + d.outdoor_cam * 3.2 + d.doorbell * 1.5 + d.lock * 2.8;

    clamp(raw.round(), 0.0, MITIGATION_CAP) as u32
}

/// Exposure grows as device coverage shrinks. Range is [20, 80].
pub fn exposure_score(devices: &DeviceCounts) -> u32 {
    let d = devices.sanitized();
    let coverage = clamp(
        d.indoor_cam * 2.0 + d.outdoor_cam * 3.0 + d.doorbell * 2.0 + d.lock * 2.0,
        0.0,
        COVERAGE_CAP,
    );

    to_score(100.0 - (coverage * 60.0 / COVERAGE_CAP).round() - 20.0)
}

/// Proxy for emergency response risk: no responder-distance feed exists, so it
/// leans on crime, income and exposure.
pub fn response_risk(crime_index: u32, income_risk: u32, exposure_score: u32) -> u32 {
    to_score(weighted(&[
        (crime_index as f64, 55.0),
        (income_risk as f64, 25.0),
        (exposure_score as f64, 20.0),
    ]))
}

/// Final risk score in [0, 100]. Mitigation always pulls it down.
pub fn final_risk(
    crime_index: u32,
    response_risk: u32,
    exposure_score: u32,
    income_risk: u32,
    mitigation_score: u32,
) -> u32 {
    to_score(weighted(&[
        (crime_index as f64, 55.0),
        (response_risk as f64, 15.0),
        (exposure_score as f64, 20.0),
        (income_risk as f64, 10.0),
        (mitigation_score as f64, -35.0),
    ]))
}

/// Approximate national and state percentiles, both in [1, 99].
pub fn percentiles(risk_score: u32) -> Percentiles {
    let risk = risk_score as f64;
    Percentiles {
        us: clamp(risk, 1.0, 99.0) as u32,
        state: clamp(weighted(&[(risk, 95.0), (100.0, 5.0)]).round(), 1.0, 99.0) as u32,
    }
}

/// Buying intent from spend and device selection, in [0, 100].
pub fn intent_score(spend: &Spend, devices: &DeviceCounts) -> u32 {
    let d = devices.sanitized();
    let upfront = clamp_score(non_negative(spend.upfront) / 3000.0 * 100.0);
    let monthly = clamp_score(non_negative(spend.monthly) / 80.0 * 100.0);
    let device_signal = clamp_score(
        d.indoor_cam * 4.0 + d.outdoor_cam * 6.0 + d.doorbell * 3.0 + d.lock * 5.0,
    );

    to_score(weighted(&[
        (upfront, 45.0),
        (monthly, 35.0),
        (device_signal, 20.0),
    ]))
}

/// Lead quality from affluence, intent and urgency, in [0, 100].
pub fn quality_score(affluence_score: u32, intent_score: u32, urgency_score: u32) -> u32 {
    to_score(weighted(&[
        (affluence_score as f64, 40.0),
        (intent_score as f64, 40.0),
        (urgency_score as f64, 20.0),
    ]))
}

pub fn is_high_demand_state(state: Option<&str>) -> bool {
    state
        .map(|s| s.trim().to_ascii_uppercase())
        .map(|s| HIGH_DEMAND_STATES.contains(&s.as_str()))
        .unwrap_or(false)
}

/// Tier base price, adjusted for market demand, rounded to the nearest $5 and
/// clamped to [`MIN_LEAD_PRICE`, `MAX_LEAD_PRICE`].
pub fn lead_price(tier: LeadTier, state: Option<&str>) -> u32 {
    let multiplier = if is_high_demand_state(state) { 110.0 } else { 100.0 };
    let adjusted = tier.base_price() as f64 * multiplier / 100.0;
    let rounded = (adjusted / 5.0).round() * 5.0;

    clamp(rounded, MIN_LEAD_PRICE as f64, MAX_LEAD_PRICE as f64) as u32
}

/// Prices a lead from its monetization signals.
pub fn monetize(inputs: &MonetizationInputs) -> Monetization {
    let income = income_scores(inputs.median_income);
    let intent = intent_score(&inputs.spend, &inputs.devices);
    let urgency = inputs.risk_score.min(100);
    let quality = quality_score(income.affluence_score, intent, urgency);
    let tier = LeadTier::from_quality(quality);

    Monetization {
        quality_score: quality,
        tier,
        price_usd: lead_price(tier, inputs.state.as_deref()),
        affluence_score: income.affluence_score,
        intent_score: intent,
        urgency_score: urgency,
    }
}

/// Runs the full model.
pub fn score(inputs: &RiskInputs) -> ScoreBundle {
    let crime = crime_index(&inputs.crime);
    let income = income_scores(inputs.median_income);
    let mitigation = mitigation_score(&inputs.devices);
    let exposure = exposure_score(&inputs.devices);
    let response = response_risk(crime, income.income_risk, exposure);
    let risk = final_risk(crime, response, exposure, income.income_risk, mitigation);

    let monetization = monetize(&MonetizationInputs {
        median_income: inputs.median_income,
        risk_score: risk,
        devices: inputs.devices,
        spend: inputs.spend,
        state: inputs.state.clone(),
    });

    ScoreBundle {
        risk_score: risk,
        zone: RiskZone::from_score(risk),
        crime_index: crime,
        response_risk: response,
        exposure_score: exposure,
        mitigation_score: mitigation,
        income_risk: income.income_risk,
        affluence_score: income.affluence_score,
        percentiles: percentiles(risk),
        monetization,
    }
}

/// Weight of a single reported incident, by offense description.
pub fn incident_weight(offense: &str) -> u32 {
    const WEIGHTS: [(&str, u32); 6] = [
        ("homicide", 10),
        ("assault", 7),
        ("robbery", 6),
        ("burglary", 5),
        ("vehicle theft", 4),
        ("theft", 3),
    ];

    let offense = offense.to_lowercase();
    WEIGHTS
        .iter()
        .find(|(key, _)| offense.contains(key))
        .map(|(_, weight)| *weight)
        .unwrap_or(2)
}

pub fn weighted_incident_score<'a>(offenses: impl IntoIterator<Item = &'a str>) -> u32 {
    offenses.into_iter().map(incident_weight).sum()
}

pub fn incident_risk_level(weighted_score: u32) -> &'static str {
    match weighted_score {
        0..=19 => "Low",
        20..=49 => "Moderate",
        50..=99 => "High",
        _ => "Severe",
    }
}

/// Deterministic 12-month shape for charting, derived only from the total.
pub fn trend_12_months(total_incidents: u64) -> [u64; 12] {
    const WOBBLE: [i64; 12] = [0, 1, -1, 2, 1, 0, -1, 1, 0, 2, -1, 0];
    let total = if total_incidents == 0 { 120 } else { total_incidents };
    let base = ((total as f64) / 12.0).round().max(1.0) as i64;

    WOBBLE.map(|w| (base + w).max(0) as u64)
}
