//! Forge metadata API client.
//!
//! Talks to a GitHub-compatible REST and GraphQL API for repository
//! metadata, lifecycle state and rate-limit introspection. Semantic
//! results (404, archived) come back as data; only transport and auth
//! problems are errors.

mod graphql;

use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::canon;
use crate::error::{Error, Result};
use crate::types::{RateLimit, RepoInfo};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("gitvault/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY_MS: u64 = 1_000;
/// Applied when a rate-limit response carries no reset hint.
const DEFAULT_SUSPEND_SECS: i64 = 60;
/// GitHub caps GraphQL batches at 100 aliases per query.
pub const BATCH_CHUNK: usize = 100;
/// Concurrency bound for the singular-REST fallback path.
const FALLBACK_CONCURRENCY: usize = 4;

#[derive(Debug, Deserialize)]
struct RepoResponse {
    description: Option<String>,
    archived: bool,
    private: bool,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Debug, Deserialize)]
struct RateLimitCore {
    limit: u32,
    remaining: u32,
    reset: i64,
}

#[derive(Clone)]
pub struct ForgeClient {
    http: reqwest::Client,
    base_url: String,
    graphql_url: String,
    token: Arc<RwLock<Option<String>>>,
    /// Epoch until which all calls are short-circuited after a rate-limit
    /// response.
    suspended_until: Arc<Mutex<Option<i64>>>,
}

fn host_is_local(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

fn validate_base_url(base_url: &str, allow_insecure: bool) -> Result<String> {
    let parsed: reqwest::Url = base_url
        .parse()
        .map_err(|e| Error::ForgeApi(format!("invalid forge base url '{base_url}': {e}")))?;

    if parsed.scheme() != "https" && !allow_insecure {
        return Err(Error::ForgeApi(format!(
            "forge base url must use https, got '{}'",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::ForgeApi("forge base url has no host".to_string()))?;
    if host_is_local(host) && !allow_insecure {
        return Err(Error::ForgeApi(format!(
            "forge base url resolves to a local address: '{host}'"
        )));
    }

    Ok(base_url.trim_end_matches('/').to_string())
}

impl ForgeClient {
    /// Creates a client against `base_url` (the public GitHub API when
    /// absent). `allow_insecure` permits http and loopback hosts; it exists
    /// for tests against a local mock server and is never set in
    /// production paths.
    pub fn new(
        base_url: Option<&str>,
        token: Option<String>,
        allow_insecure: bool,
    ) -> Result<Self> {
        let base_url = validate_base_url(base_url.unwrap_or(DEFAULT_BASE_URL), allow_insecure)?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            graphql_url: format!("{base_url}/graphql"),
            base_url,
            http,
            token: Arc::new(RwLock::new(token)),
            suspended_until: Arc::new(Mutex::new(None)),
        })
    }

    /// Replaces the bearer token used for subsequent requests.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_suspension(&self) -> Result<()> {
        let guard = self
            .suspended_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(until) = *guard {
            if Utc::now().timestamp() < until {
                return Err(Error::RateLimited(until));
            }
        }
        Ok(())
    }

    fn suspend_until(&self, reset_epoch: i64) {
        *self
            .suspended_until
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reset_epoch);
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(token) = self.token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Sends with up to [`MAX_ATTEMPTS`] tries on transport failure,
    /// backing off exponentially between attempts.
    async fn send_with_retry(&self, builder: reqwest::RequestBuilder) -> Result<Response> {
        self.check_suspension()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = builder
                .try_clone()
                .ok_or_else(|| Error::ForgeApi("request cannot be retried".to_string()))?;
            match request.send().await {
                Ok(response) => return self.check_status(response),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    let delay = BASE_RETRY_DELAY_MS * 2u64.pow(attempt - 1);
                    tracing::debug!(
                        "Forge request failed (attempt {}/{}): {}; retrying in {}ms",
                        attempt,
                        MAX_ATTEMPTS,
                        e,
                        delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Separates auth failures from rate-limit exhaustion. A rate-limit
    /// response arms the suspension gate before surfacing.
    fn check_status(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::ForgeAuth("forge rejected the token".to_string()));
        }

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let remaining = header_value(&response, "x-ratelimit-remaining");
            let exhausted = status == StatusCode::TOO_MANY_REQUESTS
                || remaining.as_deref() == Some("0")
                || header_value(&response, "retry-after").is_some();

            if exhausted {
                let reset = header_value(&response, "x-ratelimit-reset")
                    .and_then(|v| v.parse::<i64>().ok())
                    .or_else(|| {
                        header_value(&response, "retry-after")
                            .and_then(|v| v.parse::<i64>().ok())
                            .map(|secs| Utc::now().timestamp() + secs)
                    })
                    .unwrap_or_else(|| Utc::now().timestamp() + DEFAULT_SUSPEND_SECS);
                self.suspend_until(reset);
                return Err(Error::RateLimited(reset));
            }
            return Err(Error::ForgeAuth(
                "forge denied access to this repository".to_string(),
            ));
        }

        Ok(response)
    }

    /// Fetches one repository's metadata. 404 is data, not an error.
    pub async fn get_repo(&self, owner: &str, name: &str) -> Result<RepoInfo> {
        if !canon::is_valid_segment(owner) || !canon::is_valid_segment(name) {
            return Err(Error::ForgeApi(format!(
                "refusing to query invalid repository segment '{owner}/{name}'"
            )));
        }

        let url = format!("{}/repos/{owner}/{name}", self.base_url);
        let response = self
            .send_with_retry(self.request(reqwest::Method::GET, &url))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RepoInfo {
                not_found: true,
                ..RepoInfo::default()
            });
        }
        if !response.status().is_success() {
            return Err(Error::ForgeApi(format!(
                "forge returned status {}",
                response.status()
            )));
        }

        let repo: RepoResponse = response.json().await?;
        Ok(RepoInfo {
            description: repo.description,
            archived: repo.archived,
            is_private: repo.private,
            not_found: false,
        })
    }

    /// Looks up many repositories, preserving input order. With a token
    /// each chunk of [`BATCH_CHUNK`] goes out as one GraphQL query; without
    /// one, or when GraphQL fails in transport, the chunk degrades to
    /// bounded parallel REST calls. `None` marks a subject whose fallback
    /// lookup itself failed.
    pub async fn batch_get_repos(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<Option<RepoInfo>>> {
        let mut results = Vec::with_capacity(pairs.len());
        for chunk in pairs.chunks(BATCH_CHUNK) {
            if self.token().is_some() {
                match self.graphql_chunk(chunk).await {
                    Ok(infos) => {
                        results.extend(infos.into_iter().map(Some));
                        continue;
                    }
                    Err(Error::RateLimited(reset)) => return Err(Error::RateLimited(reset)),
                    Err(e) => {
                        tracing::warn!(
                            "GraphQL batch failed ({}); falling back to REST for {} repos",
                            e,
                            chunk.len()
                        );
                    }
                }
            }
            results.extend(self.rest_chunk(chunk).await);
        }
        Ok(results)
    }

    async fn graphql_chunk(&self, chunk: &[(String, String)]) -> Result<Vec<RepoInfo>> {
        let query = graphql::build_query(chunk)?;
        let response = self
            .send_with_retry(
                self.request(reqwest::Method::POST, &self.graphql_url)
                    .json(&json!({ "query": query })),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Error::ForgeApi(format!(
                "graphql endpoint returned status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await?;
        graphql::parse_response(&body, chunk.len())
    }

    async fn rest_chunk(&self, chunk: &[(String, String)]) -> Vec<Option<RepoInfo>> {
        let limit = Arc::new(Semaphore::new(FALLBACK_CONCURRENCY));
        let mut join_set = JoinSet::new();

        for (idx, (owner, name)) in chunk.iter().cloned().enumerate() {
            let client = self.clone();
            let limit = Arc::clone(&limit);
            join_set.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let info = match client.get_repo(&owner, &name).await {
                    Ok(info) => Some(info),
                    Err(e) => {
                        tracing::warn!("Status lookup failed for {}/{}: {}", owner, name, e);
                        None
                    }
                };
                (idx, info)
            });
        }

        let mut results: Vec<Option<RepoInfo>> = vec![None; chunk.len()];
        while let Some(joined) = join_set.join_next().await {
            if let Ok((idx, info)) = joined {
                results[idx] = info;
            }
        }
        results
    }

    /// Current core rate-limit window.
    pub async fn rate_limit(&self) -> Result<RateLimit> {
        let url = format!("{}/rate_limit", self.base_url);
        let response = self
            .send_with_retry(self.request(reqwest::Method::GET, &url))
            .await?;

        if !response.status().is_success() {
            return Err(Error::ForgeApi(format!(
                "rate_limit returned status {}",
                response.status()
            )));
        }

        let data: RateLimitResponse = response.json().await?;
        Ok(RateLimit {
            limit: data.resources.core.limit,
            remaining: data.resources.core.remaining,
            reset_epoch: data.resources.core.reset,
        })
    }
}

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
