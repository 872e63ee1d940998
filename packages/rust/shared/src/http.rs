//! HTTP client construction and response checks shared by every stage.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use reqwest::{Client, Response};

use crate::error::{HarvestError, Result};

/// Desktop Chrome user agent; the portal blocks obvious bots.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/123.0 Safari/537.36";

/// User agent announced to the anonymous upload host.
pub const UPLOADER_USER_AGENT: &str = concat!("domharvest-uploader/", env!("CARGO_PKG_VERSION"));

/// Build a client that looks like a browser coming from `referer`.
pub fn browser_client(referer: Option<&str>, timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Some(referer) = referer {
        let value = HeaderValue::from_str(referer)
            .map_err(|e| HarvestError::config(format!("invalid referer '{referer}': {e}")))?;
        headers.insert(REFERER, value);
    }

    Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))
}

/// Build a client for the upload host.
pub fn uploader_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(UPLOADER_USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))
}

/// Map a transport error for `url` into [`HarvestError::Network`].
pub fn network_error(url: &str, err: reqwest::Error) -> HarvestError {
    HarvestError::Network(format!("{url}: {err}"))
}

/// Turn a non-2xx response into [`HarvestError::Http`].
pub fn ensure_success(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(HarvestError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}
