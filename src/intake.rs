//! Lead intake normalisation.
//!
//! Best-effort cleanup of free-text form answers before they reach the CRM:
//! address splitting, state resolution, ownership and timeline enums, phone
//! and email checks.

use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static ZIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").expect("valid zip regex"));
static STATE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{2}\b").expect("valid state code regex"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("valid email regex")
});

static ONE_WEEK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b1\s*week\b|\bone\s+week\b|\bthis\s+week\b|\b7\s*days?\b")
        .expect("valid timeline regex")
});
static FEW_WEEKS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b2\s*(?:-|to)?\s*3\s*weeks?\b|\b2\s*weeks?\b|\b3\s*weeks?\b|\btwo\s+weeks?\b|\bfew\s+weeks\b")
        .expect("valid timeline regex")
});
static LATER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b30\b|\bmonths?\b|\blater\b|\bnot\s+sure\b").expect("valid timeline regex")
});
static ASAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\basap\b|\bimmediately\b|\burgent(?:ly)?\b|\bright\s+now\b|\bnow\b")
        .expect("valid timeline regex")
});

/// US states plus DC, by two-letter code.
pub const US_STATES: [(&str, &str); 51] = [
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
    ("DC", "District of Columbia"),
];

/// Full state name for a two-letter code (case-insensitive).
pub fn state_name(code: &str) -> Option<&'static str> {
    let code = code.trim();
    US_STATES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

/// Two-letter code for a full state name (case-insensitive). Accepts "DC".
pub fn state_code_from_name(name: &str) -> Option<&'static str> {
    let name = normalize_spaces(name).to_lowercase();
    if name == "dc" {
        return Some("DC");
    }
    US_STATES
        .iter()
        .find(|(_, n)| n.to_lowercase() == name)
        .map(|(code, _)| *code)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

fn normalize_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits `"street, city, ST 12345[, country]"` into its parts.
///
/// Fewer than three comma-separated parts leaves everything in `street`.
/// Extra commas before the city stay in the street (apartment numbers).
/// The state may come back empty when neither a code nor a known name is found.
pub fn parse_us_address(raw: &str) -> ParsedAddress {
    let raw = normalize_spaces(raw);
    if raw.is_empty() {
        return ParsedAddress::default();
    }

    let parts: Vec<String> = raw
        .split(',')
        .map(normalize_spaces)
        .filter(|p| !p.is_empty())
        .collect();

    if parts.len() < 3 {
        return ParsedAddress {
            street: raw,
            ..Default::default()
        };
    }

    let last = parts.len() - 1;
    let state_zip_idx = if parts[last].chars().any(|c| c.is_ascii_digit()) {
        last
    } else {
        last - 1
    };
    let city_idx = state_zip_idx - 1;

    let street = parts[..city_idx].join(", ");
    let city = parts[city_idx].clone();
    let state_zip = &parts[state_zip_idx];

    let postal_code = ZIP_RE
        .find(state_zip)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    // Full names first, so words like "of" never pass for a code
    let without_zip = ZIP_RE.replace_all(state_zip, "").replace('.', "");
    let upper = state_zip.to_uppercase();
    let state = state_code_from_name(&without_zip)
        .or_else(|| {
            STATE_CODE_RE
                .find_iter(&upper)
                .find_map(|code| state_name(code.as_str()).map(|_| code.as_str()))
        })
        .map(str::to_string)
        .unwrap_or_default();

    ParsedAddress {
        street: normalize_spaces(&street),
        city,
        state,
        postal_code,
    }
}

/// Collapses a free-text home-ownership answer to "Owner" or "Renter".
/// Anything else is passed through trimmed.
pub fn normalize_ownership(raw: &str) -> String {
    let value = raw.trim();
    let lower = value.to_lowercase();

    if lower.contains("rent") || lower.contains("lease") {
        "Renter".to_string()
    } else if lower.contains("own") {
        "Owner".to_string()
    } else {
        value.to_string()
    }
}

/// Collapses a free-text install timeline to one of
/// "ASAP", "1 Week", "2 - 3 Weeks" or "30 Days +". Unmatched input passes through.
pub fn normalize_timeline(raw: &str) -> String {
    let value = raw.trim();
    let lower = value.to_lowercase();

    // Longer horizons first so "not right now, maybe in a month" lands on 30+
    let matched = if FEW_WEEKS_RE.is_match(&lower) {
        Some("2 - 3 Weeks")
    } else if ONE_WEEK_RE.is_match(&lower) {
        Some("1 Week")
    } else if LATER_RE.is_match(&lower) {
        Some("30 Days +")
    } else if ASAP_RE.is_match(&lower) {
        Some("ASAP")
    } else {
        None
    };

    matched.map(str::to_string).unwrap_or_else(|| value.to_string())
}

/// Normalises a US phone number to E.164, falling back to the trimmed input
/// when it cannot be parsed as a valid US number.
pub fn normalize_us_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    match phonenumber::parse(Some(CountryId::US), trimmed) {
        Ok(number) if phonenumber::is_valid(&number) => {
            number.format().mode(Mode::E164).to_string()
        }
        Ok(_) => {
            tracing::debug!("Phone number is not a valid US number, keeping as entered");
            trimmed.to_string()
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone number: {:?}", e);
            trimmed.to_string()
        }
    }
}

/// Validate email address
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns (repeated digits like 9999, 1111)
/// - Valid domain structure
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let fake_patterns = ["999999", "111111", "000000", "123456789"];
    if fake_patterns.iter().any(|p| email.contains(p)) {
        tracing::warn!("Rejected placeholder email address");
        return false;
    }

    EMAIL_RE.is_match(email)
}

/// Device counts as sent by the calculator, used for the CRM device summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceLine {
    pub label: String,
    pub qty: f64,
}

/// Builds the human-readable device summary, e.g. `"Indoor Cameras x2, Smart Locks x1"`.
pub fn device_summary(lines: &[DeviceLine]) -> String {
    let parts: Vec<String> = lines
        .iter()
        .filter(|l| l.qty.is_finite() && l.qty > 0.0)
        .map(|l| format!("{} x{}", l.label.trim(), l.qty))
        .collect();

    if parts.is_empty() {
        "No devices selected".to_string()
    } else {
        parts.join(", ")
    }
}

/// `"<City>, <ST> <ZIP3>xx"`: enough for a buyer to judge the market without
/// revealing the exact address.
pub fn redacted_location(city: &str, state: &str, zip: &str) -> String {
    let zip3: String = zip.trim().chars().take(3).collect();
    let mut out = String::new();

    if !city.trim().is_empty() {
        out.push_str(city.trim());
    }
    if !state.trim().is_empty() {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(&state.trim().to_uppercase());
    }
    if zip3.len() == 3 {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&zip3);
        out.push_str("xx");
    }
    out
}
