use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::PipelineError;

pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Page fetching. A non-2xx status is a normal response, not an error;
/// `Err` is reserved for transport failures.
pub trait Fetch: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = Result<FetchResponse>> + Send;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(HttpFetcher { client })
    }
}

impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse> {
        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(
            "GET {} -> {} ({} chars, {}ms)",
            url,
            status,
            body.chars().count(),
            start.elapsed().as_millis()
        );
        Ok(FetchResponse { status, body })
    }
}

/// Detail page URLs in the order they are tried: the listing link (if any),
/// then each pattern with `{origin}` and `{event_id}` filled in. Duplicates
/// are dropped.
pub fn detail_candidates(
    link: &str,
    event_id: &str,
    origin: &str,
    patterns: &[String],
) -> Vec<String> {
    let mut urls: Vec<String> = Vec::with_capacity(patterns.len() + 1);
    if !link.is_empty() {
        urls.push(link.to_string());
    }
    for p in patterns {
        let url = p
            .replace("{origin}", origin.trim_end_matches('/'))
            .replace("{event_id}", event_id);
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// First candidate answering 2xx. Failed candidates are logged and skipped.
pub async fn fetch_first_success<F: Fetch>(
    fetcher: &F,
    event_id: &str,
    candidates: &[String],
) -> Result<(String, FetchResponse), PipelineError> {
    for url in candidates {
        match fetcher.get(url).await {
            Ok(resp) if resp.is_success() => return Ok((url.clone(), resp)),
            Ok(resp) => debug!("{} answered {}", url, resp.status),
            Err(e) => warn!("{} failed: {:#}", url, e),
        }
    }
    Err(PipelineError::Fetch {
        event_id: event_id.to_string(),
        attempts: candidates.len(),
    })
}
