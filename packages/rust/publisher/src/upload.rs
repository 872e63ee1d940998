//! Client for the anonymous file host (0x0.st protocol).

use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use domharvest_shared::http::{ensure_success, network_error, uploader_client};
use domharvest_shared::{HarvestError, Result};

/// Header carrying the management token of an upload.
const TOKEN_HEADER: &str = "X-Token";

/// A finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub url: String,
    pub token: Option<String>,
}

/// Uploads one file per call; retries are the caller's business.
#[derive(Debug, Clone)]
pub struct UploadClient {
    client: Client,
    host_url: String,
    secret: bool,
    expires_hours: Option<u32>,
}

impl UploadClient {
    pub fn new(
        host_url: impl Into<String>,
        secret: bool,
        expires_hours: Option<u32>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: uploader_client(timeout)?,
            host_url: host_url.into(),
            secret,
            expires_hours,
        })
    }

    /// POST `path` as the multipart `file` field and return the public URL.
    ///
    /// The body is streamed from disk; `bytes` is its announced length.
    pub async fn upload(&self, path: &Path, bytes: u64) -> Result<Uploaded> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| HarvestError::io(path, e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arquivo.pdf".into());

        let part = Part::stream_with_length(reqwest::Body::from(file), bytes)
            .file_name(file_name)
            .mime_str("application/pdf")
            .map_err(|e| HarvestError::validation(format!("bad content type: {e}")))?;

        let mut form = Form::new().part("file", part);
        if self.secret {
            form = form.text("secret", "");
        }
        if let Some(hours) = self.expires_hours {
            form = form.text("expires", hours.to_string());
        }

        debug!(path = %path.display(), bytes, host = %self.host_url, "uploading");
        let response = self
            .client
            .post(&self.host_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_error(&self.host_url, e))?;
        let response = ensure_success(&self.host_url, response)?;

        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let body = response
            .text()
            .await
            .map_err(|e| network_error(&self.host_url, e))?;

        let url = body.trim();
        if url.is_empty() {
            return Err(HarvestError::parse(format!(
                "{} returned an empty body",
                self.host_url
            )));
        }

        Ok(Uploaded {
            url: url.to_string(),
            token,
        })
    }
}
