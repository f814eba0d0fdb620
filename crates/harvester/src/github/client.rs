//! Rate-limited, cache-aware GitHub REST client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use super::error::{GitHubError, classify_status, is_retryable};
use crate::api_cache::{CacheLookup, CacheStore, ResourceType};
use crate::conditional::{CacheCounters, CacheStats, FetchResult};
use crate::config::HarvestConfig;
use crate::http::{HttpRequest, HttpTransport};
use crate::rate_limit::ApiRateLimiter;
use crate::retry::{RetryPolicy, with_retry};

/// `X-GitHub-Api-Version` sent with every request.
pub const API_VERSION: &str = "2022-11-28";

const USER_AGENT: &str = "harvester";

/// One page of a list endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    /// True when the page was full, so another one may follow.
    pub has_more: bool,
}

/// Result of [`GitHubClient::fetch_one`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOne {
    /// `None` when the server answered `304 Not Modified`.
    pub data: Option<Value>,
    pub etag: Option<String>,
    pub not_modified: bool,
}

/// GitHub API client.
///
/// Clones share the transport, cache, rate limiter and statistics, so one
/// client can be handed to every worker.
#[derive(Clone)]
pub struct GitHubClient {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<CacheStore>,
    limiter: ApiRateLimiter,
    base_url: Arc<String>,
    token: Arc<String>,
    per_page: u32,
    timeout: Duration,
    retry: RetryPolicy,
    stats: Arc<CacheCounters>,
}

impl GitHubClient {
    pub fn new(
        config: &HarvestConfig,
        transport: Arc<dyn HttpTransport>,
        cache: Arc<CacheStore>,
    ) -> Self {
        Self {
            transport,
            cache,
            limiter: ApiRateLimiter::per_minute(config.requests_per_minute),
            base_url: Arc::new(config.api_base_url.trim_end_matches('/').to_string()),
            token: Arc::new(config.token.clone()),
            per_page: config.page_size(),
            timeout: config.request_timeout,
            retry: config.retry_policy(),
            stats: Arc::new(CacheCounters::default()),
        }
    }

    /// Replace the rate limiter, e.g. to share one across several clients.
    #[must_use]
    pub fn with_limiter(mut self, limiter: ApiRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Cache statistics accumulated by this client and its clones.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Fetch one page of a list endpoint, bypassing the cache.
    pub async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        page: u32,
    ) -> Result<Page, GitHubError> {
        let url = self.page_url(endpoint, params, page)?;
        match self.send(&url, endpoint, None).await? {
            FetchResult::Fetched { data, .. } => {
                self.stats.record_fetched();
                self.into_page(data, endpoint)
            }
            FetchResult::NotModified => Err(GitHubError::Malformed {
                route: endpoint.to_string(),
                message: "unexpected 304 for an unconditional request".to_string(),
            }),
        }
    }

    /// Fetch a single resource, optionally revalidating a known ETag.
    pub async fn fetch_one(
        &self,
        endpoint: &str,
        etag_hint: Option<&str>,
    ) -> Result<FetchOne, GitHubError> {
        let url = self.url(endpoint, &[])?;
        let fetched = match self.send(&url, endpoint, etag_hint).await? {
            FetchResult::NotModified => FetchOne {
                data: None,
                etag: etag_hint.map(String::from),
                not_modified: true,
            },
            FetchResult::Fetched { data, etag } => FetchOne {
                data: Some(data),
                etag,
                not_modified: false,
            },
        };
        Ok(fetched)
    }

    /// Fetch a single resource through the cache.
    ///
    /// `ttl_fn` picks the TTL from the fetched payload, so e.g. a closed pull
    /// request can be stored permanently and an open one for a day.
    pub async fn fetch_one_cached<F>(
        &self,
        resource: ResourceType,
        key: &str,
        endpoint: &str,
        ttl_fn: F,
    ) -> Result<Value, GitHubError>
    where
        F: Fn(&Value) -> u64,
    {
        let url = self.url(endpoint, &[])?;
        self.cached_get(resource, key, &url, endpoint, |_| Ok(()), ttl_fn)
            .await
    }

    /// Fetch one page of a list endpoint through the cache.
    pub async fn fetch_page_cached(
        &self,
        resource: ResourceType,
        key: &str,
        endpoint: &str,
        params: &[(&str, String)],
        page: u32,
        ttl: u64,
    ) -> Result<Page, GitHubError> {
        let url = self.page_url(endpoint, params, page)?;
        let data = self
            .cached_get(
                resource,
                key,
                &url,
                endpoint,
                |data| expect_array(data, endpoint),
                |_| ttl,
            )
            .await?;
        self.into_page(data, endpoint)
    }

    async fn cached_get<V, F>(
        &self,
        resource: ResourceType,
        key: &str,
        url: &str,
        route: &str,
        validate: V,
        ttl_fn: F,
    ) -> Result<Value, GitHubError>
    where
        V: Fn(&Value) -> Result<(), GitHubError>,
        F: Fn(&Value) -> u64,
    {
        let lookup = match self.cache.get(resource, key).await {
            CacheLookup {
                hit: true,
                data: Some(data),
                ..
            } => {
                self.stats.record_hit();
                tracing::trace!(%resource, key = %key, "Cache hit");
                return Ok(data);
            }
            lookup => lookup,
        };

        let fetched = self.send(url, route, lookup.revalidation_etag()).await?;
        match fetched {
            FetchResult::NotModified => {
                let CacheLookup {
                    data: Some(data), ..
                } = lookup
                else {
                    // A 304 with nothing cached: fall back to a plain fetch.
                    return self.store_fresh(resource, key, url, route, validate, ttl_fn).await;
                };
                self.cache.touch(resource, key).await?;
                self.stats.record_revalidated();
                tracing::debug!(%resource, key = %key, "Cached entry revalidated");
                Ok(data)
            }
            FetchResult::Fetched { data, etag } => {
                validate(&data)?;
                self.cache
                    .put(resource, key, data.clone(), ttl_fn(&data), etag)
                    .await?;
                self.stats.record_fetched();
                Ok(data)
            }
        }
    }

    async fn store_fresh<V, F>(
        &self,
        resource: ResourceType,
        key: &str,
        url: &str,
        route: &str,
        validate: V,
        ttl_fn: F,
    ) -> Result<Value, GitHubError>
    where
        V: Fn(&Value) -> Result<(), GitHubError>,
        F: Fn(&Value) -> u64,
    {
        match self.send(url, route, None).await? {
            FetchResult::Fetched { data, etag } => {
                validate(&data)?;
                self.cache
                    .put(resource, key, data.clone(), ttl_fn(&data), etag)
                    .await?;
                self.stats.record_fetched();
                Ok(data)
            }
            FetchResult::NotModified => Err(GitHubError::Malformed {
                route: route.to_string(),
                message: "unexpected 304 for an unconditional request".to_string(),
            }),
        }
    }

    /// Send a GET with rate limiting, timeout and retries.
    async fn send(
        &self,
        url: &str,
        route: &str,
        etag: Option<&str>,
    ) -> Result<FetchResult<Value>, GitHubError> {
        let result = with_retry(
            self.retry,
            || self.send_once(url, route, etag),
            is_retryable,
            route,
        )
        .await;

        match result {
            Err(GitHubError::RateLimited { status }) => {
                tracing::warn!(route = %route, status, "Rate limit retries exhausted");
                Err(GitHubError::RateLimitExceeded {
                    attempts: self.retry.max_attempts(),
                })
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        url: &str,
        route: &str,
        etag: Option<&str>,
    ) -> Result<FetchResult<Value>, GitHubError> {
        self.limiter.wait().await;

        let mut request = HttpRequest::get(url)
            .header("Authorization", format!("Bearer {}", self.token.as_str()))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        let response = match tokio::time::timeout(self.timeout, self.transport.send(request)).await
        {
            Err(_) => return Err(GitHubError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(GitHubError::Transport(e.to_string())),
            Ok(Ok(response)) => response,
        };

        if response.status == 304 {
            return Ok(FetchResult::NotModified);
        }
        if let Some(err) = classify_status(response.status, &response.headers, route) {
            return Err(err);
        }

        let data: Value =
            serde_json::from_slice(&response.body).map_err(|e| GitHubError::Malformed {
                route: route.to_string(),
                message: e.to_string(),
            })?;
        Ok(FetchResult::Fetched {
            data,
            etag: response.header("etag").map(String::from),
        })
    }

    fn into_page(&self, data: Value, route: &str) -> Result<Page, GitHubError> {
        match data {
            Value::Array(records) => Ok(Page {
                has_more: records.len() >= self.per_page as usize,
                records,
            }),
            _ => Err(not_an_array(route)),
        }
    }

    fn url(&self, endpoint: &str, params: &[(&str, String)]) -> Result<String, GitHubError> {
        let raw = format!("{}{}", self.base_url, endpoint);
        let mut url = Url::parse(&raw).map_err(|e| GitHubError::InvalidUrl(format!("{raw}: {e}")))?;
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (k, v) in params {
                query.append_pair(k, v);
            }
        }
        Ok(url.into())
    }

    fn page_url(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        page: u32,
    ) -> Result<String, GitHubError> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("per_page", self.per_page.to_string()));
        all.push(("page", page.to_string()));
        self.url(endpoint, &all)
    }
}

fn expect_array(data: &Value, route: &str) -> Result<(), GitHubError> {
    if data.is_array() {
        Ok(())
    } else {
        Err(not_an_array(route))
    }
}

fn not_an_array(route: &str) -> GitHubError {
    GitHubError::Malformed {
        route: route.to_string(),
        message: "expected a JSON array".to_string(),
    }
}
