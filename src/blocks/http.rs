//! HTTP request block.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::BlockOutcome;
use crate::context::ContextSnapshot;
use crate::error::{Error, Result};
use crate::workflow::expression::{render_template, render_value, value_to_string};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Build the shared HTTP client with timeout defaults.
pub fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|e| {
            warn!("Failed to build HTTP client with timeout defaults: {}", e);
            Client::new()
        })
}

/// Resolved request configuration after template rendering.
#[derive(Debug)]
pub struct ResolvedRequest {
    pub url: String,
    pub method: String,
    pub headers: Option<Value>,
    pub body: Option<Value>,
    pub timeout_seconds: Option<u64>,
}

/// Render the request templates against the snapshot and validate the URL.
pub fn resolve_request(
    url: &str,
    method: &str,
    headers: Option<&Value>,
    body: Option<&Value>,
    timeout_seconds: Option<u64>,
    snapshot: &ContextSnapshot,
) -> Result<ResolvedRequest> {
    let url = value_to_string(&render_template(url, snapshot)?);
    validate_url(&url)?;

    let headers = headers.map(|h| render_value(h, snapshot)).transpose()?;
    let body = body.map(|b| render_value(b, snapshot)).transpose()?;

    Ok(ResolvedRequest {
        url,
        method: method.to_uppercase(),
        headers,
        body,
        timeout_seconds,
    })
}

/// Execute a resolved request. Non-2xx responses are still successful block
/// outputs; transport failures are `Network` errors.
pub async fn execute(client: &Client, request: ResolvedRequest) -> Result<BlockOutcome> {
    debug!(method = %request.method, url = %request.url, "HTTP block request");

    let method: reqwest::Method = request
        .method
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid HTTP method '{}'", request.method)))?;

    let mut builder = client.request(method, &request.url);

    if let Some(timeout) = request.timeout_seconds {
        builder = builder.timeout(Duration::from_secs(timeout));
    }

    if let Some(Value::Object(headers)) = &request.headers {
        for (name, value) in headers {
            builder = builder.header(name, value_to_string(value));
        }
    }

    if let Some(body) = &request.body {
        builder = match body {
            Value::String(raw) => builder.body(raw.clone()),
            other => builder.json(other),
        };
    }

    let response = builder.send().await?;
    let status = response.status();
    let headers: Value = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                Value::String(v.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let text = response.text().await?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

    Ok(BlockOutcome::completed(json!({
        "status": status.as_u16(),
        "ok": status.is_success(),
        "headers": headers,
        "body": body,
    })))
}

/// Validate a resolved URL to prevent SSRF.
/// Blocks localhost, private IP ranges, and non-http(s) schemes.
fn validate_url(url: &str) -> Result<()> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| Error::Validation(format!("Invalid URL '{}': {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::Validation(format!(
                "Unsupported URL scheme '{}'. Only http and https are allowed.",
                scheme
            )));
        }
    }

    if let Some(host) = parsed.host_str() {
        let host_lower = host.to_lowercase();
        if host_lower == "localhost"
            || host_lower == "127.0.0.1"
            || host_lower == "::1"
            || host_lower == "[::1]"
            || host_lower == "0.0.0.0"
        {
            warn!("Blocked HTTP block request to localhost: {}", url);
            return Err(Error::Validation(
                "Access to localhost is not allowed.".to_string(),
            ));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_or_special_ip(&ip) {
                warn!("Blocked HTTP block request to private IP: {}", url);
                return Err(Error::Validation(
                    "Access to private or internal IP addresses is not allowed.".to_string(),
                ));
            }
        }

        if host_lower.ends_with(".local")
            || host_lower.ends_with(".internal")
            || host_lower.ends_with(".localhost")
            || host_lower == "metadata.google.internal"
            || host_lower == "169.254.169.254"
        {
            warn!("Blocked HTTP block request to internal host: {}", url);
            return Err(Error::Validation(
                "Access to internal hostnames is not allowed.".to_string(),
            ));
        }
    }

    Ok(())
}

fn is_private_or_special_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || (ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || ipv6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_or_special_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}
