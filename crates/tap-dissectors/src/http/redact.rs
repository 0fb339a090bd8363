//! Masking of personally identifiable data in HTTP exchanges

use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::Value;
use tap_api::{Body, Exchange, Header, Payload, TrafficFilteringOptions};

/// Replacement for masked values
pub const REDACTED: &str = "[REDACTED]";

/// Normalised field names (lower case, no `-`, `_` or spaces) that mark a
/// field as sensitive when contained in its name.
const SENSITIVE_FIELDS: &[&str] = &[
    "token",
    "authorization",
    "authentication",
    "cookie",
    "userid",
    "password",
    "username",
    "user",
    "key",
    "passcode",
    "pass",
    "auth",
    "authtoken",
    "jwt",
    "bearer",
    "clientid",
    "clientsecret",
    "redirecturi",
    "phonenumber",
    "zip",
    "zipcode",
    "address",
    "country",
    "firstname",
    "lastname",
    "middlename",
    "fname",
    "lname",
    "birthdate",
];

pub(crate) fn is_sensitive(field: &str) -> bool {
    if field == ":authority" || field.eq_ignore_ascii_case("user-agent") {
        return false;
    }
    let normalised: String = field
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_FIELDS.iter().any(|s| normalised.contains(s))
}

/// Mask headers, query parameters and bodies of both messages in place.
pub(crate) fn redact_exchange(exchange: &mut Exchange, options: &TrafficFilteringOptions) {
    if let Payload::HttpRequest(request) = &mut exchange.request.payload {
        redact_headers(&mut request.headers);
        if !request.query_string.is_empty() {
            for param in &mut request.query_string {
                if is_sensitive(&param.name) {
                    param.value = REDACTED.to_string();
                }
            }
            request.url = rewrite_query(&request.url, &request.query_string);
        }
        redact_body(&mut request.body, options);
    }
    if let Some(response) = &mut exchange.response
        && let Payload::HttpResponse(response) = &mut response.payload
    {
        redact_headers(&mut response.headers);
        redact_body(&mut response.body, options);
    }
}

fn redact_headers(headers: &mut Vec<Header>) {
    headers.retain(|h| {
        !(h.name.eq_ignore_ascii_case("cookie") || h.name.eq_ignore_ascii_case("set-cookie"))
    });
    for header in headers.iter_mut() {
        if is_sensitive(&header.name) {
            header.value = REDACTED.to_string();
        }
    }
}

fn rewrite_query(url: &str, params: &[Header]) -> String {
    let base = url.split_once('?').map_or(url, |(base, _)| base);
    let query = params
        .iter()
        .map(|p| format!("{}={}", p.name, p.value))
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

fn redact_body(body: &mut Body, options: &TrafficFilteringOptions) {
    if body.as_bytes.is_empty() {
        return;
    }
    let base64 = body.encoding.as_deref() == Some("base64");
    let raw = if base64 {
        match STANDARD.decode(&body.as_bytes) {
            Ok(raw) => raw,
            Err(_) => return,
        }
    } else {
        body.as_bytes.clone().into_bytes()
    };

    let mime = body
        .mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let filtered = match mime.as_str() {
        "application/json" => redact_json(&raw),
        "text/plain" if !options.plain_text_masking_regexes.is_empty() => {
            Some(mask_plain_text(&raw, options))
        },
        _ => None,
    };

    if let Some(filtered) = filtered {
        body.as_bytes = if base64 {
            STANDARD.encode(&filtered)
        } else {
            String::from_utf8_lossy(&filtered).into_owned()
        };
    }
}

fn redact_json(raw: &[u8]) -> Option<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(raw).ok()?;
    if !value.is_object() {
        return None;
    }
    redact_value(&mut value);
    serde_json::to_vec(&value).ok()
}

fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if nested.is_object() || nested.is_array() {
                    redact_value(nested);
                } else if !nested.is_null() && is_sensitive(key) {
                    *nested = Value::String(REDACTED.to_string());
                }
            }
        },
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        _ => {},
    }
}

fn mask_plain_text(raw: &[u8], options: &TrafficFilteringOptions) -> Vec<u8> {
    let mut text = String::from_utf8_lossy(raw).into_owned();
    for regex in &options.plain_text_masking_regexes {
        text = regex.replace_all(&text, REDACTED).into_owned();
    }
    text.into_bytes()
}
