//! Endpoint URL validation.

use crate::error::WebhookError;

/// Validate a subscriber endpoint URL.
///
/// Requires a parseable URL with an `https` scheme (or `http` when
/// `allow_http` is set, for development and tests) and a non-empty host.
pub fn validate_endpoint_url(raw: &str, allow_http: bool) -> Result<(), WebhookError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| WebhookError::InvalidUrl(format!("unparseable URL: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => {
            return Err(WebhookError::InvalidUrl(
                "endpoint URLs must use https".to_string(),
            ));
        }
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "unsupported scheme: {scheme}"
            )));
        }
    }

    if parsed.host_str().is_none() {
        return Err(WebhookError::InvalidUrl("URL has no host".to_string()));
    }

    Ok(())
}
