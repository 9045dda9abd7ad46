//! Vendor webhook signatures
//!
//! Both schemes are computed over the bytes exactly as received, before any
//! parsing. Comparisons are constant time.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{NotifyError, Result};

pub const VAPI_SIGNATURE_HEADER: &str = "x-vapi-signature";
pub const VAPI_SECRET_HEADER: &str = "x-vapi-secret";
pub const TWILIO_SIGNATURE_HEADER: &str = "x-twilio-signature";

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Hex HMAC-SHA256 of the raw body
pub fn vapi_signature(raw_body: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotifyError::internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(raw_body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Accept either an HMAC of the body or the shared secret echoed back in
/// `x-vapi-secret`, which the vendor sends when no signing is configured
pub fn verify_vapi(headers: &HeaderMap, raw_body: &[u8], secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(NotifyError::signature("voice webhook secret is not configured"));
    }

    if let Some(presented) = header(headers, VAPI_SIGNATURE_HEADER) {
        let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
        let expected = vapi_signature(raw_body, secret)?;
        if constant_time_eq(presented.to_ascii_lowercase().as_bytes(), expected.as_bytes()) {
            return Ok(());
        }
        return Err(NotifyError::signature("voice webhook signature mismatch"));
    }

    if let Some(presented) = header(headers, VAPI_SECRET_HEADER) {
        if constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
            return Ok(());
        }
        return Err(NotifyError::signature("voice webhook secret mismatch"));
    }

    Err(NotifyError::signature("voice webhook is not signed"))
}

/// Base64 HMAC-SHA1 of the URL followed by every form parameter, sorted by
/// name, as `name` + `value`
pub fn twilio_signature(url: &str, params: &[(String, String)], auth_token: &str) -> Result<String> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut data = url.to_string();
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .map_err(|e| NotifyError::internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn verify_twilio(
    headers: &HeaderMap,
    url: &str,
    params: &[(String, String)],
    auth_token: &str,
) -> Result<()> {
    if auth_token.is_empty() {
        return Err(NotifyError::signature("SMS webhook auth token is not configured"));
    }
    let presented = header(headers, TWILIO_SIGNATURE_HEADER)
        .ok_or_else(|| NotifyError::signature("SMS webhook is not signed"))?;
    let expected = twilio_signature(url, params, auth_token)?;

    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(NotifyError::signature("SMS webhook signature mismatch"))
    }
}

/// Decode a form body into ordered pairs
pub fn form_pairs(raw_body: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(raw_body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
