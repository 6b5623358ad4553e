//! Caching reverse proxy for the Binance REST API.
//!
//! Browser clients hit this instead of the exchange directly, so a page
//! full of widgets polling the same endpoint costs one upstream request
//! per second: responses are cached for one second keyed on the absolute
//! URL, and concurrent misses for one URL coalesce into a single fetch.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

struct CacheEntry {
    fetched_at: Instant,
    response: ProxyResponse,
}

pub struct ApiProxy {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ApiProxy {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, "https://api.binance.com")
    }

    pub fn with_base_url(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch `{base_url}/{path}[?query]`, serving from the 1-second cache
    /// when possible.
    pub async fn get(&self, path: &str, query: Option<&str>) -> Result<ProxyResponse> {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        if let Some(hit) = self.cache_lookup(&url) {
            return Ok(hit);
        }

        // One flight per URL: late arrivals wait on the gate, then re-check
        // the cache instead of fetching again.
        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(url.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        if let Some(hit) = self.cache_lookup(&url) {
            return Ok(hit);
        }

        debug!(url = %url, "proxying upstream request");
        let result = self.fetch(&url).await;

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&url);
        }

        let response = result?;
        self.cache.write().insert(
            url,
            CacheEntry {
                fetched_at: Instant::now(),
                response: response.clone(),
            },
        );
        Ok(response)
    }

    fn cache_lookup(&self, url: &str) -> Option<ProxyResponse> {
        let cache = self.cache.read();
        let entry = cache.get(url)?;
        if entry.fetched_at.elapsed() <= CACHE_TTL {
            Some(entry.response.clone())
        } else {
            None
        }
    }

    async fn fetch(&self, url: &str) -> Result<ProxyResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("proxy upstream request failed")?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response
            .bytes()
            .await
            .context("proxy upstream body read failed")?
            .to_vec();

        if status >= 400 {
            warn!(url = %url, status, "proxy upstream returned an error status");
        }

        Ok(ProxyResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn second_get_within_a_second_is_served_from_cache() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/ping");
            then.status(200)
                .header("content-type", "application/json")
                .body("{}");
        });

        let proxy = ApiProxy::with_base_url(reqwest::Client::new(), &server.base_url());

        let first = proxy.get("v1/ping", None).await.unwrap();
        let second = proxy.get("v1/ping", None).await.unwrap();

        mock.assert_hits(1);
        assert_eq!(first.body, second.body);
        assert_eq!(first.content_type, second.content_type);
        assert_eq!(second.status, 200);
    }

    #[tokio::test]
    async fn query_string_is_part_of_the_cache_key() {
        let server = MockServer::start();
        let a = server.mock(|when, then| {
            when.method(GET)
                .path("/v3/depth")
                .query_param("symbol", "BTCUSDT");
            then.status(200).body("a");
        });
        let b = server.mock(|when, then| {
            when.method(GET)
                .path("/v3/depth")
                .query_param("symbol", "ETHUSDT");
            then.status(200).body("b");
        });

        let proxy = ApiProxy::with_base_url(reqwest::Client::new(), &server.base_url());

        let first = proxy.get("v3/depth", Some("symbol=BTCUSDT")).await.unwrap();
        let second = proxy.get("v3/depth", Some("symbol=ETHUSDT")).await.unwrap();

        a.assert_hits(1);
        b.assert_hits(1);
        assert_eq!(first.body, b"a".to_vec());
        assert_eq!(second.body, b"b".to_vec());
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_upstream_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/time");
            then.status(200).body("{\"serverTime\":1}");
        });

        let proxy = Arc::new(ApiProxy::with_base_url(
            reqwest::Client::new(),
            &server.base_url(),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let proxy = proxy.clone();
            handles.push(tokio::spawn(async move {
                proxy.get("v1/time", None).await.unwrap()
            }));
        }
        for handle in handles {
            let response = handle.await.unwrap();
            assert_eq!(response.body, b"{\"serverTime\":1}".to_vec());
        }

        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn upstream_error_statuses_pass_through() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/missing");
            then.status(404).body("not found");
        });

        let proxy = ApiProxy::with_base_url(reqwest::Client::new(), &server.base_url());
        let response = proxy.get("v1/missing", None).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"not found".to_vec());
    }
}
