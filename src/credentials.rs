//! Cookie-borne credentials
//!
//! The dashboard stores API keys and per-provider settings as URL-encoded
//! JSON in the `apiKeys` and `providers` cookies. They are decoded once per
//! request into [`Credentials`]; an absent cookie means "nothing configured",
//! a cookie that is present but not valid JSON is rejected.

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use secrecy::SecretString;
use serde::de::DeserializeOwned;

use crate::error::{RelayError, Result};
use crate::source::{Credentials, ProviderSetting};

pub const API_KEYS_COOKIE: &str = "apiKeys";
pub const PROVIDERS_COOKIE: &str = "providers";

/// Split a `Cookie` header into URL-decoded name/value pairs.
///
/// Items without `=` map to an empty value. Values that are not valid
/// percent-encoding are kept verbatim.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (name, value) = item.split_once('=').unwrap_or((item, ""));
            (decode(name.trim()), decode(value.trim()))
        })
        .collect()
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn decode_json<T: DeserializeOwned + Default>(
    cookies: &HashMap<String, String>,
    name: &str,
) -> Result<T> {
    match cookies.get(name).map(|v| v.trim()) {
        None | Some("") => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            tracing::warn!(cookie = name, error = %e, "malformed credential cookie");
            RelayError::bad_request(format!("Malformed {name} cookie"))
        }),
    }
}

impl Credentials {
    /// Decode credentials from a raw `Cookie` header value.
    pub fn from_cookie_header(header: Option<&str>) -> Result<Self> {
        let cookies = header.map(parse_cookies).unwrap_or_default();

        let keys: HashMap<String, String> = decode_json(&cookies, API_KEYS_COOKIE)?;
        let provider_settings: HashMap<String, ProviderSetting> =
            decode_json(&cookies, PROVIDERS_COOKIE)?;

        let api_keys = keys
            .into_iter()
            .filter(|(_, key)| !key.trim().is_empty())
            .map(|(provider, key)| (provider, SecretString::from(key)))
            .collect();

        Ok(Self {
            api_keys,
            provider_settings,
        })
    }

    /// Decode credentials from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let header = headers.get(COOKIE).and_then(|v| v.to_str().ok());
        Self::from_cookie_header(header)
    }
}
