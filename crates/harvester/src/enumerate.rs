//! Organization repository listing.

use crate::error::{HarvestError, Result};
use crate::github::{ApiRepository, GitHubClient, GitHubError, PaginatedFetchConfig, to_repository};
use crate::model::Repository;

/// Lists the repositories of an organization worth extracting.
#[derive(Clone)]
pub struct RepoEnumerator {
    client: GitHubClient,
}

/// Result of [`RepoEnumerator::list_active`].
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub repos: Vec<Repository>,
    /// Repositories returned by the API before filtering.
    pub total: usize,
}

impl RepoEnumerator {
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }

    /// Every repository of `org`, most recently pushed first.
    ///
    /// Archived and disabled repositories are dropped unless
    /// `include_archived` is set.
    #[tracing::instrument(skip(self))]
    pub async fn list_active(&self, org: &str, include_archived: bool) -> Result<Enumeration> {
        let config = PaginatedFetchConfig::org_repos(org);
        let fetched = self
            .client
            .fetch_pages::<ApiRepository>(&config)
            .await
            .map_err(|e| match e {
                GitHubError::NotFound(_) => HarvestError::OrganizationNotFound(org.to_string()),
                other => other.into(),
            })?;

        let total = fetched.items.len();
        let mut repos: Vec<Repository> = fetched
            .items
            .into_iter()
            .map(to_repository)
            .filter(|r| include_archived || r.is_active())
            .collect();
        sort_by_activity(&mut repos);

        tracing::info!(
            org,
            total,
            selected = repos.len(),
            pages = fetched.pages,
            skipped_records = fetched.skipped_records,
            "Enumerated repositories"
        );
        Ok(Enumeration { repos, total })
    }
}

/// `pushed_at` descending, repositories never pushed last, ties by name.
fn sort_by_activity(repos: &mut [Repository]) {
    repos.sort_by(|a, b| {
        b.pushed_at
            .cmp(&a.pushed_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}
