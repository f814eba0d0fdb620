//! Paginated list fetching through the response cache.
//!
//! GitHub list endpoints are walked page by page until a short page comes
//! back. Each page is cached under its own key, so unchanged pages are served
//! locally or revalidated with their ETag.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::client::GitHubClient;
use super::error::GitHubError;
use crate::api_cache::{ResourceType, ttl};

/// Consecutive malformed pages after which pagination stops.
const MAX_CONSECUTIVE_MALFORMED_PAGES: u32 = 2;

/// Configuration for a paginated fetch operation.
pub struct PaginatedFetchConfig<'a> {
    pub resource: ResourceType,
    /// API path, e.g. `/orgs/acme/repos`.
    pub endpoint: String,
    /// Query parameters sent with every page.
    pub params: Vec<(&'static str, String)>,
    /// Builds the cache key for a given page number.
    pub cache_key_fn: Box<dyn Fn(u32) -> String + Send + Sync + 'a>,
    pub ttl: u64,
    /// Stop after a page for which this returns true.
    pub stop_after: Option<Box<dyn Fn(&[Value]) -> bool + Send + Sync + 'a>>,
}

impl<'a> PaginatedFetchConfig<'a> {
    /// All repositories of an organization.
    pub fn org_repos(org: &'a str) -> Self {
        Self {
            resource: ResourceType::OrgRepos,
            endpoint: format!("/orgs/{org}/repos"),
            params: vec![("type", "all".to_string())],
            cache_key_fn: Box::new(move |page| format!("{org}/page/{page}")),
            ttl: ttl::ORG_REPOS,
            stop_after: None,
        }
    }

    /// Commits on `branch` committed in `[since, until]`.
    pub fn commits(
        full_name: &'a str,
        branch: &'a str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Self {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let until = until.to_rfc3339_opts(SecondsFormat::Secs, true);
        let window = format!("{since}_{until}");
        Self {
            resource: ResourceType::CommitPages,
            endpoint: format!("/repos/{full_name}/commits"),
            params: vec![
                ("sha", branch.to_string()),
                ("since", since),
                ("until", until),
            ],
            cache_key_fn: Box::new(move |page| {
                format!("{full_name}/{branch}/{window}/page/{page}")
            }),
            ttl: ttl::LIST_PAGE,
            stop_after: None,
        }
    }

    /// Pull requests in any state, most recently updated first.
    pub fn pulls(full_name: &'a str) -> Self {
        Self {
            resource: ResourceType::PullPages,
            endpoint: format!("/repos/{full_name}/pulls"),
            params: vec![
                ("state", "all".to_string()),
                ("sort", "updated".to_string()),
                ("direction", "desc".to_string()),
            ],
            cache_key_fn: Box::new(move |page| format!("{full_name}/page/{page}")),
            ttl: ttl::LIST_PAGE,
            stop_after: None,
        }
    }

    /// Stop paginating after the first page `predicate` accepts.
    #[must_use]
    pub fn stop_after(mut self, predicate: impl Fn(&[Value]) -> bool + Send + Sync + 'a) -> Self {
        self.stop_after = Some(Box::new(predicate));
        self
    }
}

/// Result of a paginated fetch operation.
#[derive(Debug)]
pub struct PaginatedFetchResult<T> {
    pub items: Vec<T>,
    /// Pages successfully read.
    pub pages: u32,
    /// Pages dropped because the body was not a JSON array.
    pub skipped_pages: u32,
    /// Records dropped because they did not match the expected shape.
    pub skipped_records: usize,
}

impl<T> Default for PaginatedFetchResult<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            pages: 0,
            skipped_pages: 0,
            skipped_records: 0,
        }
    }
}

impl GitHubClient {
    /// Fetch every page described by `config`.
    ///
    /// Records that fail to deserialize are logged and skipped. A malformed
    /// page is skipped and the next page is tried; two malformed pages in a
    /// row end the walk. Any other error is returned.
    pub async fn fetch_pages<T: DeserializeOwned>(
        &self,
        config: &PaginatedFetchConfig<'_>,
    ) -> Result<PaginatedFetchResult<T>, GitHubError> {
        let mut result = PaginatedFetchResult::default();
        let mut page = 1u32;
        let mut consecutive_malformed = 0;

        loop {
            let key = (config.cache_key_fn)(page);
            let fetched = self
                .fetch_page_cached(
                    config.resource,
                    &key,
                    &config.endpoint,
                    &config.params,
                    page,
                    config.ttl,
                )
                .await;

            match fetched {
                Ok(fetched) => {
                    consecutive_malformed = 0;
                    result.pages += 1;
                    let stop = config
                        .stop_after
                        .as_ref()
                        .is_some_and(|f| f(&fetched.records));

                    for record in fetched.records {
                        match serde_json::from_value::<T>(record) {
                            Ok(item) => result.items.push(item),
                            Err(e) => {
                                result.skipped_records += 1;
                                tracing::warn!(
                                    endpoint = %config.endpoint,
                                    page,
                                    error = %e,
                                    "Skipping malformed record"
                                );
                            }
                        }
                    }

                    if !fetched.has_more || stop {
                        break;
                    }
                }
                Err(GitHubError::Malformed { route, message }) => {
                    result.skipped_pages += 1;
                    consecutive_malformed += 1;
                    tracing::warn!(route = %route, page, error = %message, "Skipping malformed page");
                    if consecutive_malformed >= MAX_CONSECUTIVE_MALFORMED_PAGES {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
            page += 1;
        }

        tracing::debug!(
            endpoint = %config.endpoint,
            pages = result.pages,
            items = result.items.len(),
            "Finished paginated fetch"
        );
        Ok(result)
    }
}
