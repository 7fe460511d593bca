//! Execution of validated cohort queries against the local data repository.
//!
//! One invocation per (site, cohort); a failing repository call is converted
//! into an error-tagged [`SiteResult`] instead of propagating, so a single
//! site's outage never stalls a batch. Retries, if any, belong to the
//! transport below the repository client.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use fedquery_core::{
    result::{ResultSet, SiteResult},
    study::QueryMode,
    CohortId,
    OrganizationIdentifier,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("data repository unreachable: {0}")]
    Unreachable(String),

    #[error("data repository returned malformed data: {0}")]
    MalformedData(String),
}

/// The opaque query interface to a site's local data repository.
#[async_trait]
pub trait CohortRepository {
    /// Executes a count query and returns its scalar result.
    async fn count(&self, query: &str) -> Result<u64, RepositoryError>;

    /// Executes an identifier query and returns the full row set.
    async fn rows(&self, query: &str) -> Result<ResultSet, RepositoryError>;
}

/// Runs every validated query against the repository, one result per cohort.
pub async fn execute_queries<R>(
    repository: &R,
    organization: &OrganizationIdentifier,
    queries: &[(CohortId, String)],
    mode: QueryMode,
) -> Vec<SiteResult>
where
    R: CohortRepository + ?Sized,
{
    let mut results = Vec::with_capacity(queries.len());
    for (cohort_id, query) in queries {
        results.push(execute_query(repository, organization, cohort_id, query, mode).await);
    }
    results
}

async fn execute_query<R>(
    repository: &R,
    organization: &OrganizationIdentifier,
    cohort_id: &CohortId,
    query: &str,
    mode: QueryMode,
) -> SiteResult
where
    R: CohortRepository + ?Sized,
{
    debug!("executing query for cohort {}", cohort_id);
    match mode {
        QueryMode::Count => match repository.count(query).await {
            Ok(count) => SiteResult::count(organization.clone(), cohort_id.clone(), count),
            Err(error) => failed(organization, cohort_id, error),
        },
        QueryMode::Identifier => match repository.rows(query).await {
            Ok(rows) => SiteResult::rows(organization.clone(), cohort_id.clone(), rows),
            Err(error) => failed(organization, cohort_id, error),
        },
    }
}

fn failed(
    organization: &OrganizationIdentifier,
    cohort_id: &CohortId,
    error: RepositoryError,
) -> SiteResult {
    warn!("query execution for cohort {} failed: {}", cohort_id, error);
    SiteResult::failed(organization.clone(), cohort_id.clone(), error.to_string())
}
