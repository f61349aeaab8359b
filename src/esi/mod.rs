//! Upstream (ESI) HTTP client: pagination, bearer auth, rate-limit signals.

pub mod budget;
pub mod endpoint;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::resilience::Guard;

pub use budget::{RateBudget, RateSignal};
pub use endpoint::Endpoint;

const PAGES_HEADER: &str = "x-pages";

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Fetch every record behind `endpoint`, following pagination. A JSON
    /// object response is returned as a single record.
    async fn fetch(&self, endpoint: &Endpoint, bearer: Option<&str>)
        -> Result<Vec<Value>, SyncError>;
}

/// One decoded page plus the page count the server reported.
#[derive(Debug)]
pub struct Page {
    pub records: Vec<Value>,
    pub total_pages: u32,
    pub signal: RateSignal,
}

#[derive(Clone)]
pub struct EsiClient {
    http: Client,
    base_url: Url,
    max_pages: u32,
    budget: Arc<RateBudget>,
    guard: Option<Guard>,
}

impl fmt::Debug for EsiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsiClient")
            .field("base_url", &self.base_url)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}

impl EsiClient {
    pub fn new(cfg: &Config, budget: Arc<RateBudget>, guard: Option<Guard>) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.esi.base_url).context("invalid esi.base_url")?;
        let http = Client::builder()
            .user_agent(cfg.esi.user_agent.clone())
            .timeout(Duration::from_secs(cfg.esi.request_timeout_secs))
            .build()
            .context("building ESI http client")?;
        Ok(Self {
            http,
            base_url,
            max_pages: cfg.esi.max_pages,
            budget,
            guard,
        })
    }

    /// Client without a breaker; used by tooling and adapter tests.
    pub fn with_base_url(base_url: Url, max_pages: u32, budget: Arc<RateBudget>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("esi-sync/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .context("building ESI http client")?;
        Ok(Self {
            http,
            base_url,
            max_pages,
            budget,
            guard: None,
        })
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    pub fn build_request(
        &self,
        endpoint: &Endpoint,
        page: Option<u32>,
        bearer: Option<&str>,
    ) -> Result<reqwest::Request, SyncError> {
        let mut url = self
            .base_url
            .join(endpoint.path.trim_start_matches('/'))
            .map_err(|e| SyncError::Validation(format!("bad endpoint {}: {e}", endpoint.path)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("datasource", "tranquility");
            for (k, v) in &endpoint.query {
                pairs.append_pair(k, v);
            }
            if let Some(page) = page {
                pairs.append_pair("page", &page.to_string());
            }
        }
        let mut builder = self.http.get(url).header("Accept", "application/json");
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder
            .build()
            .map_err(|e| SyncError::Validation(format!("failed to build request: {e}")))
    }

    /// One request, one page. Rate-limit headers are recorded whatever the status.
    pub async fn fetch_page(
        &self,
        endpoint: &Endpoint,
        page: Option<u32>,
        bearer: Option<&str>,
    ) -> Result<Page, SyncError> {
        self.budget.acquire().await;
        let request = self.build_request(endpoint, page, bearer)?;
        debug!(url = %request.url().path(), ?page, "esi request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SyncError::TransientNetwork(e.to_string()))?;
        let status = res.status();
        let signal = RateSignal::from_headers(res.headers());
        self.budget.observe(&signal);

        if status.is_success() {
            let total_pages = res
                .headers()
                .get(PAGES_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(1)
                .max(1);
            let body: Value = res
                .json()
                .await
                .map_err(|e| SyncError::TransientNetwork(format!("unreadable body: {e}")))?;
            let records = match body {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            return Ok(Page {
                records,
                total_pages,
                signal,
            });
        }

        let message = res.text().await.unwrap_or_default();
        Err(classify_status(status, &signal, message, &self.budget))
    }

    async fn guarded_page(
        &self,
        endpoint: &Endpoint,
        page: Option<u32>,
        bearer: Option<&str>,
    ) -> Result<Page, SyncError> {
        match &self.guard {
            Some(guard) => {
                guard
                    .call(move || self.fetch_page(endpoint, page, bearer))
                    .await
            }
            None => self.fetch_page(endpoint, page, bearer).await,
        }
    }
}

fn classify_status(
    status: StatusCode,
    signal: &RateSignal,
    message: String,
    budget: &RateBudget,
) -> SyncError {
    match status.as_u16() {
        401 => SyncError::AuthExpired,
        420 | 429 => {
            let retry_after = signal.hard_limit_wait();
            budget.block_for(retry_after);
            SyncError::RateLimited { retry_after }
        }
        500..=599 => {
            warn!(%status, "upstream server error");
            SyncError::TransientNetwork(format!("{status}: {message}"))
        }
        code => SyncError::UpstreamRejected {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl UpstreamApi for EsiClient {
    async fn fetch(
        &self,
        endpoint: &Endpoint,
        bearer: Option<&str>,
    ) -> Result<Vec<Value>, SyncError> {
        if !endpoint.paginated {
            return Ok(self.guarded_page(endpoint, None, bearer).await?.records);
        }

        let first = self.guarded_page(endpoint, Some(1), bearer).await?;
        let total = first.total_pages;
        if total > self.max_pages {
            return Err(SyncError::PaginationLimitExceeded {
                pages: total,
                cap: self.max_pages,
            });
        }
        let mut records = first.records;
        for page in 2..=total {
            let next = self.guarded_page(endpoint, Some(page), bearer).await?;
            records.extend(next.records);
        }
        debug!(path = %endpoint.path, pages = total, records = records.len(), "esi fetch complete");
        Ok(records)
    }
}
