//! Bitbucket Server REST client.
//!
//! Wraps a blocking `reqwest` client with bearer-token authentication and
//! follows Bitbucket's `start`/`nextPageStart` paging.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::types::{Activity, Page, PullRequest};
use super::{PullRequestSource, Result, SourceError};

/// Page size requested from paged endpoints.
const PAGE_LIMIT: u64 = 100;

/// Upper bound on pages fetched from one endpoint.
///
/// Protects against a server that keeps answering `isLastPage: false`.
const MAX_PAGES: usize = 1_000;

/// A Bitbucket Server API client.
#[derive(Clone)]
pub struct BitbucketClient {
    http: Client,
    /// Base REST URL, e.g. `https://bitbucket.example.com/rest/api/1.0`.
    endpoint: String,
    token: String,
}

impl BitbucketClient {
    /// Creates a client for `endpoint`, authenticating with a personal access token.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Configuration` if the endpoint is empty or the
    /// HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.trim().is_empty() {
            return Err(SourceError::Configuration(
                "endpoint must not be empty".to_string(),
            ));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            endpoint,
            token: token.into(),
        })
    }

    /// Returns the base REST URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let url = format!("{}{}", self.endpoint, path);
        trace!(url = %url, ?query, "GET");
        let response = self
            .http
            .get(&url)
            .query(query)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()?;
        check_status(response)
    }

    fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let mut start = 0;

        for _ in 0..MAX_PAGES {
            let mut paged_query = query.to_vec();
            paged_query.push(("start", start.to_string()));
            paged_query.push(("limit", PAGE_LIMIT.to_string()));

            let body = self.get(path, &paged_query)?.bytes()?;
            let page: Page<T> = serde_json::from_slice(&body)?;
            values.extend(page.values);

            match page.next_page_start {
                Some(next) if !page.is_last_page && next > start => start = next,
                _ => return Ok(values),
            }
        }

        Err(SourceError::Parse(format!(
            "{path}: more than {MAX_PAGES} pages, giving up"
        )))
    }

    fn pull_request_path(pr: &PullRequest, suffix: &str) -> String {
        let repo = pr.repo();
        format!(
            "/projects/{}/repos/{}/pull-requests/{}/{}",
            repo.project, repo.slug, pr.id.0, suffix
        )
    }
}

impl PullRequestSource for BitbucketClient {
    fn pull_requests(&self) -> Result<Vec<PullRequest>> {
        let prs: Vec<PullRequest> =
            self.get_paged("/dashboard/pull-requests", &[("state", "OPEN".to_string())])?;
        debug!(count = prs.len(), "Fetched pull requests");
        Ok(prs)
    }

    fn activities(&self, pr: &PullRequest) -> Result<Vec<Activity>> {
        self.get_paged(&Self::pull_request_path(pr, "activities"), &[])
    }

    fn diff(&self, pr: &PullRequest) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.endpoint, Self::pull_request_path(pr, "diff"));
        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(ACCEPT, "text/plain")
            .send()?;
        Ok(check_status(response)?.bytes()?.to_vec())
    }
}

impl std::fmt::Debug for BitbucketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitbucketClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
    Err(SourceError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_endpoint() {
        assert!(matches!(
            BitbucketClient::new("  ", "token"),
            Err(SourceError::Configuration(_))
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = BitbucketClient::new("https://bb.example.com/rest/api/1.0/", "t").unwrap();
        assert_eq!(client.endpoint(), "https://bb.example.com/rest/api/1.0");
    }

    #[test]
    fn debug_hides_token() {
        let client = BitbucketClient::new("https://bb.example.com", "s3cret").unwrap();
        assert!(!format!("{client:?}").contains("s3cret"));
    }

    #[test]
    fn pull_request_paths() {
        let pr: PullRequest = serde_json::from_value(serde_json::json!({
            "id": 9, "version": 1, "title": "t", "createdDate": 0,
            "author": { "user": { "displayName": "A" } },
            "toRef": { "repository": { "slug": "repo", "project": { "key": "PROJ" } } }
        }))
        .unwrap();

        assert_eq!(
            BitbucketClient::pull_request_path(&pr, "activities"),
            "/projects/PROJ/repos/repo/pull-requests/9/activities"
        );
    }
}
