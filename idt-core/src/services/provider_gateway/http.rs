//! HTTP plumbing shared by the REST backends
//!
//! Every backend funnels status codes, transport failures and body decoding
//! through here so that all of them normalize errors the same way.

use super::{ProviderError, ProviderErrorKind};
use idt_common::{ConfigError, ProviderConfig};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

const USER_AGENT: &str = concat!("idt/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error body kept in the error message
const MAX_ERROR_BODY_CHARS: usize = 300;

pub(crate) fn build_client(config: &ProviderConfig) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.timeout())
        .build()
        .map_err(|e| ConfigError::invalid("provider", format!("cannot build HTTP client: {}", e)))
}

/// Map a non-success HTTP status to an error kind
pub(crate) fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::AuthFailed,
        429 => ProviderErrorKind::RateLimited,
        400 | 404 | 413 | 415 | 422 => ProviderErrorKind::InvalidInput,
        408 | 504 => ProviderErrorKind::Timeout,
        500..=599 => ProviderErrorKind::ProviderUnavailable,
        _ => ProviderErrorKind::UnknownError,
    }
}

/// Map a reqwest failure (no usable response) to a provider error
pub(crate) fn transport_error(err: reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ProviderErrorKind::ProviderUnavailable
    } else {
        ProviderErrorKind::UnknownError
    };
    ProviderError::new(kind, err.to_string())
}

/// Seconds form of the Retry-After header (HTTP-date form is ignored)
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pass a successful response through; turn anything else into a provider error
pub(crate) async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let hint = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();

    Err(
        ProviderError::new(classify_status(status), format!("HTTP {}: {}", status.as_u16(), snippet))
            .with_retry_after(hint),
    )
}

/// Read and decode a JSON body
pub(crate) async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ProviderError::new(
            ProviderErrorKind::UnknownError,
            format!("undecodable response body: {}", e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_classification() {
        let cases = [
            (401, ProviderErrorKind::AuthFailed),
            (403, ProviderErrorKind::AuthFailed),
            (429, ProviderErrorKind::RateLimited),
            (400, ProviderErrorKind::InvalidInput),
            (413, ProviderErrorKind::InvalidInput),
            (408, ProviderErrorKind::Timeout),
            (504, ProviderErrorKind::Timeout),
            (500, ProviderErrorKind::ProviderUnavailable),
            (503, ProviderErrorKind::ProviderUnavailable),
            (529, ProviderErrorKind::ProviderUnavailable),
            (302, ProviderErrorKind::UnknownError),
        ];
        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), expected, "status {}", code);
        }
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }
}
