//! Per-function load balancer.
//!
//! Picks a backend from the pool, forwards the buffered request through
//! the shared hyper client, and reports one response sample per attempt.
//! Upstream failures hand the request to the backend's recovery callback
//! (normally a re-queue) until the attempt budget is spent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use edgegrid_core::FunctionKey;
use edgegrid_core::config::BalancePolicy;
use edgegrid_metrics::{ResponseSample, epoch_millis};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::pool::{Backend, BackendPool};
use crate::transform;

/// Response body handed back to the listener.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Client used for every upstream call.
pub type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Called with a request whose upstream attempt failed.
pub type Recovery = Arc<dyn Fn(PendingRequest) + Send + Sync>;

pub fn upstream_client() -> UpstreamClient {
    Client::builder(hyper_util::rt::TokioExecutor::new()).build_http()
}

/// Small plain-text response.
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(body.to_string()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    resp
}

/// A buffered inbound request waiting for (another) upstream attempt.
pub struct PendingRequest {
    pub function: FunctionKey,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote: Option<SocketAddr>,
    /// Failed upstream attempts so far.
    pub attempts: u32,
    pub received: Instant,
    responder: oneshot::Sender<Response<ProxyBody>>,
}

impl PendingRequest {
    pub fn new(
        function: FunctionKey,
        parts: http::request::Parts,
        body: Bytes,
        remote: Option<SocketAddr>,
    ) -> (Self, oneshot::Receiver<Response<ProxyBody>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                function,
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
                remote,
                attempts: 0,
                received: Instant::now(),
                responder: tx,
            },
            rx,
        )
    }

    /// Deliver the final response. A gone client is not an error.
    pub fn respond(self, response: Response<ProxyBody>) {
        if self.responder.send(response).is_err() {
            debug!(function = %self.function, "client went away before response");
        }
    }

    fn to_request(&self) -> Request<Full<Bytes>> {
        let mut req = Request::new(Full::new(self.body.clone()));
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.headers_mut() = self.headers.clone();
        req
    }
}

/// Balances one function's traffic over its backend pool.
pub struct LoadBalancer {
    function: FunctionKey,
    pool: BackendPool,
    recovery: Mutex<HashMap<String, Recovery>>,
    client: UpstreamClient,
    samples: Option<mpsc::Sender<ResponseSample>>,
    dropped: Arc<AtomicU64>,
    max_attempts: u32,
    timeout: Duration,
}

impl LoadBalancer {
    pub fn new(
        function: FunctionKey,
        policy: BalancePolicy,
        client: UpstreamClient,
        samples: Option<mpsc::Sender<ResponseSample>>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            function,
            pool: BackendPool::new(policy),
            recovery: Mutex::new(HashMap::new()),
            client,
            samples,
            dropped,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_limits(mut self, max_attempts: u32, timeout: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.timeout = timeout;
        self
    }

    pub fn function(&self) -> &FunctionKey {
        &self.function
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    /// Add (or replace) a backend with its weight and failure callback.
    pub fn add_server(&self, backend: Backend, weight: f64, recovery: Recovery) {
        let url = backend.url.clone();
        self.recovery
            .lock()
            .expect("recovery lock")
            .insert(url.clone(), recovery);
        self.pool.set_backend(Arc::new(backend), weight);
        debug!(function = %self.function, %url, weight, "server added");
    }

    pub fn delete_server(&self, url: &str) -> ProxyResult<()> {
        if self.pool.get_backend(url).is_none() {
            return Err(ProxyError::NotFound(url.to_string()));
        }
        self.pool.remove_backend(url);
        self.recovery.lock().expect("recovery lock").remove(url);
        debug!(function = %self.function, %url, "server deleted");
        Ok(())
    }

    pub fn update_workload(&self, url: &str, weight: f64) -> ProxyResult<()> {
        if !self.pool.set_weight(url, weight) {
            return Err(ProxyError::NotFound(url.to_string()));
        }
        debug!(function = %self.function, %url, weight, "server workload updated");
        Ok(())
    }

    pub fn server_exists(&self, url: &str) -> bool {
        self.pool.get_backend(url).is_some()
    }

    /// Servers in the pool that are not in `desired`.
    pub fn server_pool_diff<S: AsRef<str>>(&self, desired: &[S]) -> Vec<String> {
        self.pool.backend_diff(desired)
    }

    pub fn weight(&self, url: &str) -> Option<f64> {
        self.pool.weight(url)
    }

    fn emit(&self, backend: &Backend, latency: Duration, status: u16, description: String) {
        let Some(samples) = &self.samples else {
            return;
        };
        let sample = ResponseSample {
            timestamp_ms: epoch_millis(),
            function: self.function.clone(),
            backend_url: backend.url.clone(),
            destination: backend.node.clone(),
            community: backend.community.clone(),
            gpu: backend.gpu,
            latency,
            status,
            description,
        };
        if samples.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Serve one request. Always answers it, directly or via recovery.
    pub async fn balance(&self, mut req: PendingRequest) {
        let Some(backend) = self.pool.next_backend() else {
            debug!(function = %self.function, "no backend available");
            req.respond(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no backend available",
            ));
            return;
        };

        let upstream = match transform::upstream_request(
            req.to_request(),
            &backend.uri,
            req.remote.map(|a| a.ip()),
        ) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(function = %self.function, error = %e, "cannot build upstream request");
                req.respond(text_response(StatusCode::BAD_REQUEST, &e.to_string()));
                return;
            }
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.client.request(upstream)).await;
        let latency = start.elapsed();

        let error = match result {
            Ok(Ok(resp)) => {
                let status = resp.status();
                self.emit(&backend, latency, status.as_u16(), String::new());
                let (parts, body) = resp.into_parts();
                req.respond(Response::from_parts(parts, body.boxed_unsync()));
                return;
            }
            Ok(Err(e)) => ProxyError::Upstream(e.to_string()),
            Err(_) => ProxyError::Upstream(format!("timed out after {:?}", self.timeout)),
        };

        self.emit(
            &backend,
            latency,
            StatusCode::BAD_GATEWAY.as_u16(),
            error.to_string(),
        );
        req.attempts += 1;
        if req.attempts >= self.max_attempts {
            warn!(
                function = %self.function,
                url = %backend.url,
                attempts = req.attempts,
                error = %error,
                "upstream failed, giving up"
            );
            req.respond(text_response(StatusCode::BAD_GATEWAY, &error.to_string()));
            return;
        }

        let recovery = self
            .recovery
            .lock()
            .expect("recovery lock")
            .get(&backend.url)
            .cloned();
        match recovery {
            Some(recover) => {
                debug!(
                    function = %self.function,
                    url = %backend.url,
                    attempts = req.attempts,
                    error = %error,
                    "upstream failed, recovering"
                );
                recover(req);
            }
            None => req.respond(text_response(StatusCode::BAD_GATEWAY, &error.to_string())),
        }
    }
}
