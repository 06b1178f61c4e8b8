use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::header::HeaderMap;
use hyper::{Body, Client as HttpClient, Method, Request, Response};
use tracing::{debug, info, warn};

use crate::error::{GuardError, Result};

/// One upstream Elasticsearch node and its probed health state
struct Node {
    url: String,
    healthy: AtomicBool,
}

/// Round-robin pool over the configured Elasticsearch nodes.
///
/// Unhealthy nodes are skipped until a background probe sees them answer
/// again; with no healthy node left, requests fall back to trying every
/// node so a probe outage cannot take the proxy down on its own.
pub struct UpstreamPool {
    nodes: Vec<Node>,
    counter: AtomicUsize,
    http: HttpClient<HttpConnector>,
    timeout: Duration,
}

impl UpstreamPool {
    pub fn new(nodes: Vec<String>, timeout: Duration) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|url| Node {
                url,
                healthy: AtomicBool::new(true),
            })
            .collect();

        Self {
            nodes,
            counter: AtomicUsize::new(0),
            http: HttpClient::builder().build_http(),
            timeout,
        }
    }

    /// The next node to try, preferring healthy ones
    fn pick(&self) -> Option<&Node> {
        if self.nodes.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.nodes.len() {
            let node = &self.nodes[(start + offset) % self.nodes.len()];
            if node.healthy.load(Ordering::Relaxed) {
                return Some(node);
            }
        }

        Some(&self.nodes[start % self.nodes.len()])
    }

    /// Forward a request to the next node, within the configured timeout.
    /// The body may be a still-streaming client body; it is not buffered
    /// here.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<Response<Body>> {
        let node = self
            .pick()
            .ok_or_else(|| GuardError::Upstream("no nodes configured".to_string()))?;

        let uri = format!("{}{}", node.url, path_and_query);
        let mut request = Request::builder().method(method).uri(&uri);
        if let Some(request_headers) = request.headers_mut() {
            for (name, value) in headers {
                if name != hyper::header::HOST && name != hyper::header::CONTENT_LENGTH {
                    request_headers.insert(name.clone(), value.clone());
                }
            }
        }

        let request = request
            .body(body)
            .map_err(|e| GuardError::Upstream(e.to_string()))?;

        debug!(uri = uri.as_str(), "Forwarding request upstream");
        match tokio::time::timeout(self.timeout, self.http.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                node.healthy.store(false, Ordering::Relaxed);
                warn!(node = node.url.as_str(), error = %e, "Upstream request failed");
                Err(GuardError::Upstream(e.to_string()))
            }
            Err(_) => {
                warn!(node = node.url.as_str(), "Upstream request timed out");
                Err(GuardError::Upstream("request timed out".to_string()))
            }
        }
    }

    /// Probe every node once, updating its health state
    pub async fn probe(&self) {
        for node in &self.nodes {
            let request = Request::builder()
                .method(Method::HEAD)
                .uri(&node.url)
                .body(Body::empty());
            let Ok(request) = request else {
                continue;
            };

            let reachable = matches!(
                tokio::time::timeout(self.timeout, self.http.request(request)).await,
                Ok(Ok(_))
            );

            let was_healthy = node.healthy.swap(reachable, Ordering::Relaxed);
            if was_healthy != reachable {
                if reachable {
                    info!(node = node.url.as_str(), "Upstream node is back");
                } else {
                    warn!(node = node.url.as_str(), "Upstream node is down");
                }
            }
        }
    }

    /// Spawn the periodic health probe loop
    pub fn start_health_probes(pool: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.probe().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_skips_unhealthy_nodes() {
        let pool = UpstreamPool::new(
            vec![
                "http://es1:9200".to_string(),
                "http://es2:9200".to_string(),
            ],
            Duration::from_secs(1),
        );

        pool.nodes[0].healthy.store(false, Ordering::Relaxed);
        for _ in 0..4 {
            let node = pool.pick().unwrap();
            assert_eq!(node.url, "http://es2:9200");
        }
    }

    #[test]
    fn test_pick_round_robins() {
        let pool = UpstreamPool::new(
            vec![
                "http://es1:9200".to_string(),
                "http://es2:9200".to_string(),
            ],
            Duration::from_secs(1),
        );

        let first = pool.pick().unwrap().url.clone();
        let second = pool.pick().unwrap().url.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn test_pick_falls_back_when_all_down() {
        let pool = UpstreamPool::new(vec!["http://es1:9200".to_string()], Duration::from_secs(1));
        pool.nodes[0].healthy.store(false, Ordering::Relaxed);
        assert!(pool.pick().is_some());
    }
}
