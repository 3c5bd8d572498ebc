//! HubSpot webhook signature verification (v1 and v3 schemes).

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::errors::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hubspot-signature";
pub const SIGNATURE_VERSION_HEADER: &str = "x-hubspot-signature-version";
pub const SIGNATURE_V3_HEADER: &str = "x-hubspot-signature-v3";
pub const TIMESTAMP_HEADER: &str = "x-hubspot-request-timestamp";

/// v3 requests older than this are rejected as replays.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVersion {
    V1,
    V3,
}

/// What the verifier needs to know about the inbound request.
pub struct SignedRequest<'a> {
    pub headers: &'a HeaderMap,
    pub method: &'a str,
    /// Request path without the query string.
    pub path: &'a str,
    pub body: &'a [u8],
}

/// `hex(sha256(secret || body))`
pub fn compute_v1(client_secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_secret.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// `base64(HMAC-SHA256(secret, method || uri || body || timestamp))`
pub fn compute_v3(
    client_secret: &str,
    method: &str,
    uri: &str,
    body: &[u8],
    timestamp: &str,
) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
        .map_err(|e| AppError::InternalError(format!("Invalid HMAC key: {}", e)))?;
    mac.update(method.to_uppercase().as_bytes());
    mac.update(uri.as_bytes());
    mac.update(body);
    mac.update(timestamp.as_bytes());

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verifies the HubSpot signature on a webhook request.
///
/// v3 is used when both its signature and timestamp headers are present;
/// otherwise the v1 header is checked. Any other advertised version is
/// rejected. Must run before the body is parsed.
///
/// # Arguments
/// * `client_secret` - App client secret; `None` rejects every request
/// * `request` - Headers, method, path and raw body
/// * `now_ms` - Current time in epoch milliseconds
pub fn verify_hubspot_signature(
    client_secret: Option<&str>,
    request: &SignedRequest<'_>,
    now_ms: i64,
) -> Result<SignatureVersion, AppError> {
    let secret = client_secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Webhook client secret not configured".to_string()))?;

    let header = |name: &str| {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let (Some(signature), Some(timestamp)) = (header(SIGNATURE_V3_HEADER), header(TIMESTAMP_HEADER)) {
        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| AppError::Unauthorized("Malformed request timestamp".to_string()))?;
        if (now_ms - sent_at).abs() > MAX_TIMESTAMP_SKEW_MS {
            return Err(AppError::Unauthorized("Stale request timestamp".to_string()));
        }

        let host = header("host")
            .ok_or_else(|| AppError::Unauthorized("Missing Host header".to_string()))?;
        let uri = format!("https://{}{}", host, request.path);
        let expected = compute_v3(secret, request.method, &uri, request.body, timestamp)?;

        return if constant_time_compare(&expected, signature) {
            Ok(SignatureVersion::V3)
        } else {
            Err(AppError::Unauthorized("Invalid v3 signature".to_string()))
        };
    }

    let signature = header(SIGNATURE_HEADER)
        .ok_or_else(|| AppError::Unauthorized("Missing signature header".to_string()))?;
    let version = header(SIGNATURE_VERSION_HEADER)
        .unwrap_or("v1")
        .to_ascii_lowercase();

    if version != "v1" {
        return Err(AppError::Unauthorized(format!(
            "Unsupported signature version {}",
            version
        )));
    }

    if constant_time_compare(&compute_v1(secret, request.body), signature) {
        Ok(SignatureVersion::V1)
    } else {
        Err(AppError::Unauthorized("Invalid v1 signature".to_string()))
    }
}

/// Constant-time string comparison
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-client-secret";
    const NOW: i64 = 1_700_000_000_000;
    const PATH: &str = "/hubspot-payment-webhook";

    fn request<'a>(headers: &'a HeaderMap, body: &'a [u8]) -> SignedRequest<'a> {
        SignedRequest {
            headers,
            method: "POST",
            path: PATH,
            body,
        }
    }

    fn v1_headers(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let sig = compute_v1(SECRET, body);
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        headers
    }

    fn v3_headers(body: &[u8], timestamp: i64) -> HeaderMap {
        let ts = timestamp.to_string();
        let uri = format!("https://api.example.com{}", PATH);
        let sig = compute_v3(SECRET, "POST", &uri, body, &ts).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.example.com"));
        headers.insert(SIGNATURE_V3_HEADER, HeaderValue::from_str(&sig).unwrap());
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&ts).unwrap());
        headers
    }

    #[test]
    fn test_v1_known_vector() {
        // sha256("abc") with an empty secret
        assert_eq!(
            compute_v1("", b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_v1_valid_signature_passes() {
        let body = br#"[{"objectId":123}]"#;
        let headers = v1_headers(body);

        let version = verify_hubspot_signature(Some(SECRET), &request(&headers, body), NOW).unwrap();
        assert_eq!(version, SignatureVersion::V1);
    }

    #[test]
    fn test_v1_single_byte_mutation_fails() {
        let body = br#"[{"objectId":123}]"#.to_vec();
        let headers = v1_headers(&body);

        for i in 0..body.len() {
            let mut mutated = body.clone();
            mutated[i] ^= 0x01;
            assert!(
                verify_hubspot_signature(Some(SECRET), &request(&headers, &mutated), NOW).is_err(),
                "mutation at byte {} was accepted",
                i
            );
        }
    }

    #[test]
    fn test_missing_secret_rejects() {
        let body = b"[]";
        let headers = v1_headers(body);

        assert!(verify_hubspot_signature(None, &request(&headers, body), NOW).is_err());
        assert!(verify_hubspot_signature(Some(""), &request(&headers, body), NOW).is_err());
    }

    #[test]
    fn test_missing_header_rejects() {
        let headers = HeaderMap::new();
        let err = verify_hubspot_signature(Some(SECRET), &request(&headers, b"[]"), NOW).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let body = b"[]";
        let mut headers = v1_headers(body);
        headers.insert(SIGNATURE_VERSION_HEADER, HeaderValue::from_static("v2"));

        assert!(verify_hubspot_signature(Some(SECRET), &request(&headers, body), NOW).is_err());
    }

    #[test]
    fn test_v3_valid_signature_passes() {
        let body = br#"{"events":[{"objectId":"9"}]}"#;
        let headers = v3_headers(body, NOW - 1_000);

        let version = verify_hubspot_signature(Some(SECRET), &request(&headers, body), NOW).unwrap();
        assert_eq!(version, SignatureVersion::V3);
    }

    #[test]
    fn test_v3_stale_timestamp_rejected() {
        let body = b"[]";
        let headers = v3_headers(body, NOW - MAX_TIMESTAMP_SKEW_MS - 1);

        assert!(verify_hubspot_signature(Some(SECRET), &request(&headers, body), NOW).is_err());
    }

    #[test]
    fn test_v3_wrong_path_rejected() {
        let body = b"[]";
        let headers = v3_headers(body, NOW);
        let other = SignedRequest {
            path: "/other",
            ..request(&headers, body)
        };

        assert!(verify_hubspot_signature(Some(SECRET), &other, NOW).is_err());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
