//! Gazette link discovery.
//!
//! The portal's data API is the source of truth: it lists every edition of a
//! period as HTML anchors. A WebDriver browser session is used on top of it to
//! confirm the portal is up and to resolve hrefs that point at a viewer page
//! instead of the PDF itself. The browser is optional; the API is not.

mod api;
mod document;
mod webdriver;

use std::collections::HashSet;
use std::time::Duration;

use domharvest_shared::http::{browser_client, ensure_success, network_error};
use domharvest_shared::{
    AppConfig, BrowserConfig, PortalConfig, Period, PublicationLink, Result, RetryPolicy,
    SERVER_ERROR_STATUSES, mentions_pdf,
};
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use api::{extract_hrefs, parse_payload};
pub use document::find_pdf_reference;
pub use webdriver::WebDriverSession;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of the best-effort portal check. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The portal page loaded within the timeout.
    Available,
    /// The check could not confirm the portal; discovery went on with the API.
    Unavailable { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Links found for one period.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Unique candidate URLs in first-seen order.
    pub links: Vec<PublicationLink>,
    /// Result of the portal check.
    pub availability: Availability,
    /// How many indirect hrefs the browser turned into PDF URLs.
    pub resolved: usize,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for the discovery process.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub portal: PortalConfig,
    pub browser: BrowserConfig,
    /// Open a browser session at all (needs `browser.webdriver_url`).
    pub use_browser: bool,
    /// Timeout for the API request.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for DiscoveryOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            portal: config.portal.clone(),
            browser: config.browser.clone(),
            use_browser: config.browser.webdriver_url.is_some(),
            timeout: Duration::from_secs(config.http.timeout_secs),
            retry: config.http.retry_policy(SERVER_ERROR_STATUSES),
        }
    }
}

// ---------------------------------------------------------------------------
// LinkDiscoverer
// ---------------------------------------------------------------------------

/// Resolves the PDF URLs published for a period. Holds no state across calls
/// besides its HTTP client.
pub struct LinkDiscoverer {
    client: Client,
    opts: DiscoveryOptions,
}

impl LinkDiscoverer {
    pub fn new(opts: DiscoveryOptions) -> Result<Self> {
        let portal_url = opts.portal.portal_url()?;
        let client = browser_client(Some(portal_url.as_str()), opts.timeout)?;
        Ok(Self { client, opts })
    }

    /// Discover the links of `period`.
    ///
    /// API failures (transport, non-2xx, malformed payload) are returned as
    /// errors. The browser session, when one is opened, is closed on every path
    /// before this returns.
    #[instrument(skip_all, fields(period = %period))]
    pub async fn discover(&self, period: Period) -> Result<Discovery> {
        let portal_url = self.opts.portal.portal_url()?;

        let session = self.open_session().await;
        let availability = match &session {
            Ok(session) => {
                let timeout = Duration::from_secs(self.opts.browser.portal_timeout_secs);
                session.check_availability(&portal_url, timeout).await
            }
            Err(reason) => Availability::Unavailable {
                reason: reason.clone(),
            },
        };

        let outcome = self.collect(period, session.as_ref().ok()).await;
        if let Ok(session) = session {
            session.close().await;
        }
        let (links, resolved) = outcome?;

        info!(
            links = links.len(),
            resolved,
            available = availability.is_available(),
            "discovery complete"
        );

        Ok(Discovery {
            links,
            availability,
            resolved,
        })
    }

    /// Start the browser, or explain why there is none.
    async fn open_session(&self) -> std::result::Result<WebDriverSession, String> {
        if !self.opts.use_browser || self.opts.browser.webdriver_url.is_none() {
            debug!("browser session disabled");
            return Err("browser session disabled".to_string());
        }
        WebDriverSession::start(&self.opts.browser).await.map_err(|e| {
            warn!(error = %e, "could not start browser session");
            e.to_string()
        })
    }

    async fn collect(
        &self,
        period: Period,
        session: Option<&WebDriverSession>,
    ) -> Result<(Vec<PublicationLink>, usize)> {
        let hrefs = self.fetch_api(period).await?;
        let base = self.opts.portal.base()?;
        let candidates = select_candidates(&base, hrefs, self.opts.portal.accept_indirect_links);

        let mut links = Vec::with_capacity(candidates.len());
        let mut resolved = 0;
        for link in candidates {
            let Some(session) = session.filter(|_| !link.looks_like_pdf()) else {
                links.push(link);
                continue;
            };
            match session.resolve_pdf(link.as_str()).await {
                Ok(Some(pdf)) => {
                    debug!(%link, %pdf, "resolved indirect link");
                    resolved += 1;
                    links.push(PublicationLink::from(pdf));
                }
                Ok(None) => {
                    debug!(%link, "no PDF reference found, keeping original");
                    links.push(link);
                }
                Err(e) => {
                    warn!(%link, error = %e, "link resolution failed, keeping original");
                    links.push(link);
                }
            }
        }

        Ok((dedup(links), resolved))
    }

    async fn fetch_api(&self, period: Period) -> Result<Vec<String>> {
        let url = self.opts.portal.api_url(period)?.to_string();
        info!(%url, "querying discovery API");

        let client = &self.client;
        let target = url.as_str();
        let body = self
            .opts
            .retry
            .run("discovery-api", move || async move {
                let response = client
                    .get(target)
                    .header(ACCEPT, "application/json, text/javascript, */*")
                    .send()
                    .await
                    .map_err(|e| network_error(target, e))?;
                let response = ensure_success(target, response)?;
                response.text().await.map_err(|e| network_error(target, e))
            })
            .await?;

        let hrefs = parse_payload(&body)?;
        debug!(hrefs = hrefs.len(), "API payload parsed");
        Ok(hrefs)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Absolutize hrefs against `base`, keep the PDF ones (plus web pages when
/// `accept_indirect`), and drop duplicates.
fn select_candidates(base: &Url, hrefs: Vec<String>, accept_indirect: bool) -> Vec<PublicationLink> {
    let links = hrefs.into_iter().filter_map(|href| {
        let absolute = match base.join(&href) {
            Ok(url) => url,
            Err(e) => {
                warn!(%href, error = %e, "unresolvable href");
                return mentions_pdf(&href).then(|| PublicationLink::from(href));
            }
        };
        if mentions_pdf(absolute.as_str()) {
            return Some(PublicationLink::from(absolute.to_string()));
        }
        let is_web = matches!(absolute.scheme(), "http" | "https");
        (accept_indirect && is_web).then(|| PublicationLink::from(absolute.to_string()))
    });
    dedup(links)
}

/// Drop repeated links, first occurrence wins.
fn dedup(links: impl IntoIterator<Item = PublicationLink>) -> Vec<PublicationLink> {
    let mut seen = HashSet::new();
    links
        .into_iter()
        .filter(|link| seen.insert(link.as_str().to_string()))
        .collect()
}
