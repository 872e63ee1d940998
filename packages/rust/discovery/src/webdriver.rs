//! Minimal W3C WebDriver client for the browser session.
//!
//! Only the handful of commands discovery needs are implemented: open a
//! session, navigate, poll `document.readyState`, manage tabs, read the page
//! source, and end the session. Any WebDriver server works (chromedriver,
//! selenium standalone); we request headless Chrome.

use std::time::Duration;

use domharvest_shared::{BrowserConfig, HarvestError, Result};
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::Availability;
use crate::document::find_pdf_reference;

/// Interval between `document.readyState` polls.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timeout for a single WebDriver command round-trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const READY_STATE_SCRIPT: &str = "return document.readyState";

/// An open WebDriver session. Exactly one exists per discovery run.
///
/// Call [`WebDriverSession::close`] on every path; dropping an unclosed
/// session schedules a best-effort `DELETE` so a panic does not leak a browser.
pub struct WebDriverSession {
    client: Client,
    endpoint: String,
    session_id: String,
    page_timeout: Duration,
    closed: bool,
}

impl WebDriverSession {
    /// Start a new browser session at `config.webdriver_url`.
    pub async fn start(config: &BrowserConfig) -> Result<Self> {
        let endpoint = config
            .webdriver_url
            .as_deref()
            .ok_or_else(|| HarvestError::config("no webdriver_url configured"))?
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .map_err(|e| HarvestError::Browser(format!("failed to build WebDriver client: {e}")))?;

        let mut args = vec!["--no-sandbox", "--disable-gpu", "--window-size=1366,900"];
        if config.headless {
            args.insert(0, "--headless=new");
        }
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        });

        let value = send(&client, Method::POST, &format!("{endpoint}/session"), Some(body)).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| HarvestError::Browser("new session response has no sessionId".into()))?
            .to_string();

        info!(%session_id, %endpoint, "browser session started");

        Ok(Self {
            client,
            endpoint,
            session_id,
            page_timeout: Duration::from_secs(config.page_timeout_secs),
            closed: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Load the portal and wait for it to finish rendering.
    ///
    /// Never fails: every problem becomes [`Availability::Unavailable`].
    pub async fn check_availability(&self, portal_url: &Url, timeout: Duration) -> Availability {
        let outcome = async {
            self.navigate(portal_url.as_str()).await?;
            self.wait_until_loaded(timeout).await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(%portal_url, "portal available");
                Availability::Available
            }
            Err(e) => {
                warn!(%portal_url, error = %e, "portal availability check failed");
                Availability::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Open `url` in a new tab and look for the PDF it points to.
    ///
    /// The tab is closed and focus restored whatever the outcome.
    pub async fn resolve_pdf(&self, url: &str) -> Result<Option<String>> {
        let origin = self.command(Method::GET, "window", None).await?;
        let origin = origin
            .as_str()
            .ok_or_else(|| HarvestError::Browser("window handle is not a string".into()))?
            .to_string();

        let tab = self
            .command(Method::POST, "window/new", Some(json!({ "type": "tab" })))
            .await?;
        let tab = tab
            .get("handle")
            .and_then(Value::as_str)
            .ok_or_else(|| HarvestError::Browser("new window response has no handle".into()))?
            .to_string();

        self.switch_to(&tab).await?;
        let found = self.search_current_tab(url).await;

        if let Err(e) = self.command(Method::DELETE, "window", None).await {
            debug!(error = %e, "failed to close resolution tab");
        }
        if let Err(e) = self.switch_to(&origin).await {
            debug!(error = %e, "failed to switch back to origin tab");
        }

        found
    }

    /// End the session. Errors are logged, not returned.
    pub async fn close(mut self) {
        self.closed = true;
        let url = format!("{}/session/{}", self.endpoint, self.session_id);
        match send(&self.client, Method::DELETE, &url, None).await {
            Ok(_) => info!(session_id = %self.session_id, "browser session closed"),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "failed to close browser session"),
        }
    }

    async fn search_current_tab(&self, url: &str) -> Result<Option<String>> {
        self.navigate(url).await?;
        self.wait_until_loaded(self.page_timeout).await?;

        let source = self.command(Method::GET, "source", None).await?;
        let source = source.as_str().unwrap_or_default();
        let page_url = Url::parse(url).map_err(|e| HarvestError::parse(format!("{url}: {e}")))?;

        Ok(find_pdf_reference(source, &page_url))
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        debug!(url, "browser navigating");
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn switch_to(&self, handle: &str) -> Result<()> {
        self.command(Method::POST, "window", Some(json!({ "handle": handle })))
            .await
            .map(|_| ())
    }

    /// Poll `document.readyState` until it reports `complete` or `timeout` elapses.
    async fn wait_until_loaded(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self
                .command(
                    Method::POST,
                    "execute/sync",
                    Some(json!({ "script": READY_STATE_SCRIPT, "args": [] })),
                )
                .await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HarvestError::Browser(format!(
                    "page did not finish loading within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}/session/{}/{path}", self.endpoint, self.session_id);
        send(&self.client, method, &url, body).await
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.session_id, "browser session dropped outside a runtime");
            return;
        };
        let client = self.client.clone();
        let url = format!("{}/session/{}", self.endpoint, self.session_id);
        handle.spawn(async move {
            let _ = client.delete(&url).send().await;
        });
    }
}

/// Send one WebDriver command and unwrap the `value` member.
async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| HarvestError::Browser(format!("{url}: {e}")))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| HarvestError::Browser(format!("{url}: invalid response: {e}")))?;

    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if !status.is_success() {
        let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(HarvestError::Browser(format!(
            "{url}: HTTP {status}: {error}: {message}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) const SESSION: &str = "sess-1";

    fn ok(value: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "value": value }))
    }

    /// Mount a cooperative WebDriver whose pages always finish loading and
    /// whose page source is `source`.
    pub(crate) async fn mount_webdriver(server: &MockServer, source: &str) {
        let base = format!("/session/{SESSION}");
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ok(json!({ "sessionId": SESSION, "capabilities": {} })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{base}/url")))
            .respond_with(ok(Value::Null))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{base}/execute/sync")))
            .respond_with(ok(json!("complete")))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{base}/window")))
            .respond_with(ok(json!("main-tab")))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{base}/window/new")))
            .respond_with(ok(json!({ "handle": "tab-2", "type": "tab" })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{base}/window")))
            .respond_with(ok(Value::Null))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{base}/window")))
            .respond_with(ok(json!(["main-tab"])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{base}/source")))
            .respond_with(ok(json!(source)))
            .mount(server)
            .await;
    }

    pub(crate) fn browser_config(server: &MockServer) -> BrowserConfig {
        BrowserConfig {
            webdriver_url: Some(server.uri()),
            headless: true,
            page_timeout_secs: 1,
            portal_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn start_requests_headless_chrome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_partial_json(json!({
                "capabilities": { "alwaysMatch": { "browserName": "chrome" } }
            })))
            .respond_with(ok(json!({ "sessionId": SESSION, "capabilities": {} })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/session/{SESSION}")))
            .respond_with(ok(Value::Null))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&browser_config(&server)).await.unwrap();
        assert_eq!(session.session_id(), SESSION);
        session.close().await;
    }

    #[tokio::test]
    async fn resolves_pdf_in_new_tab() {
        let server = MockServer::start().await;
        mount_webdriver(
            &server,
            r#"<html><body><iframe src="/arquivos/extra.pdf"></iframe></body></html>"#,
        )
        .await;

        let session = WebDriverSession::start(&browser_config(&server)).await.unwrap();
        let found = session
            .resolve_pdf("https://portal.example/dom/visualizar?edicao=1")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("https://portal.example/arquivos/extra.pdf"));
        session.close().await;
    }

    #[tokio::test]
    async fn availability_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ok(json!({ "sessionId": SESSION })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/session/{SESSION}/url")))
            .respond_with(ok(Value::Null))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/session/{SESSION}/execute/sync")))
            .respond_with(ok(json!("loading")))
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&browser_config(&server)).await.unwrap();
        let portal = Url::parse("https://portal.example/dom").unwrap();
        let availability = session
            .check_availability(&portal, Duration::from_millis(300))
            .await;
        assert!(matches!(availability, Availability::Unavailable { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn webdriver_errors_surface_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": { "error": "session not created", "message": "Chrome failed to start" }
            })))
            .mount(&server)
            .await;

        let err = WebDriverSession::start(&browser_config(&server))
            .await
            .err()
            .expect("start should fail");
        assert!(err.to_string().contains("Chrome failed to start"));
    }
}
