//! Dispatcher HTTP listener.
//!
//! Requests with a `function/<ns>/<name>` run of segments anywhere in the
//! path are buffered and queued for the dispatch workers; anything else is
//! passed through to its own `Host`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use edgegrid_core::FunctionKey;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::balancer::{PendingRequest, ProxyBody, UpstreamClient, text_response, upstream_client};
use crate::dispatcher::Dispatcher;

/// Function addressed by the two segments after the first `function`
/// segment of `path`.
pub fn extract_function_key(path: &str) -> Option<FunctionKey> {
    let mut segments = path.split('/').skip_while(|s| *s != "function").skip(1);
    let namespace = segments.next().filter(|s| !s.is_empty())?;
    let name = segments.next().filter(|s| !s.is_empty())?;
    Some(FunctionKey::new(namespace, name))
}

/// HTTP front door of one dispatcher.
pub struct DispatchServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    client: UpstreamClient,
}

impl DispatchServer {
    pub fn new(bind_addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            bind_addr,
            dispatcher,
            client: upstream_client(),
        }
    }

    /// Bind and serve until shutdown.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind dispatcher on {}", self.bind_addr))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("listener address")?;
        info!(%addr, node = %self.dispatcher.node(), "dispatcher listening");

        let handler = Arc::new(Handler {
            dispatcher: self.dispatcher,
            client: self.client,
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted.context("accept failed")?;
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let handler = handler.clone();
                            async move { Ok::<_, hyper::Error>(handler.handle(req, peer_addr).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), svc)
                            .await
                        {
                            debug!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("dispatcher listener shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

struct Handler {
    dispatcher: Arc<Dispatcher>,
    client: UpstreamClient,
}

impl Handler {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(%peer, error = %e, "failed to read request body");
                return text_response(StatusCode::BAD_REQUEST, "unreadable request body");
            }
        };

        match extract_function_key(parts.uri.path()) {
            Some(function) => self.enqueue(function, parts, body, peer).await,
            None => self.pass_through(parts, body).await,
        }
    }

    async fn enqueue(
        &self,
        function: FunctionKey,
        parts: http::request::Parts,
        body: Bytes,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        let (pending, response) = PendingRequest::new(function, parts, body, Some(peer));
        if self.dispatcher.queue().enqueue(pending).is_err() {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "dispatcher shutting down");
        }
        match response.await {
            Ok(resp) => resp,
            Err(_) => text_response(StatusCode::SERVICE_UNAVAILABLE, "request dropped"),
        }
    }

    async fn pass_through(&self, parts: http::request::Parts, body: Bytes) -> Response<ProxyBody> {
        let Some(host) = parts
            .headers
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
        else {
            return text_response(StatusCode::BAD_REQUEST, "missing Host header");
        };
        let pq = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!("http://{host}{pq}").parse() {
            Ok(uri) => uri,
            Err(e) => {
                return text_response(StatusCode::BAD_REQUEST, &format!("invalid target: {e}"));
            }
        };

        let mut req = Request::from_parts(parts, Full::new(body));
        *req.uri_mut() = uri;
        match self.client.request(req).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.boxed_unsync())
            }
            Err(e) => {
                error!(%host, error = %e, "pass-through request failed");
                text_response(StatusCode::BAD_GATEWAY, "upstream unavailable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::tests::echo_upstream;
    use edgegrid_core::config::DispatcherConfig;
    use edgegrid_state::{
        ClusterApi, CommunitySchedule, FunctionSpec, MemoryCluster, NodeView, PodPhase, PodView,
        Resources, RoutingRules,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn function_keys_come_from_the_first_two_segments() {
        assert_eq!(
            extract_function_key("/function/ns/echo/a/b"),
            Some(FunctionKey::new("ns", "echo"))
        );
        assert_eq!(
            extract_function_key("/function/ns/echo"),
            Some(FunctionKey::new("ns", "echo"))
        );
        assert_eq!(extract_function_key("/function/ns"), None);
        assert_eq!(extract_function_key("/function//echo"), None);
        assert_eq!(extract_function_key("/other/ns/echo"), None);
        assert_eq!(extract_function_key("/functions/ns/echo"), None);
    }

    #[test]
    fn function_segment_need_not_lead_the_path() {
        assert_eq!(
            extract_function_key("/gateway/function/ns/echo/a"),
            Some(FunctionKey::new("ns", "echo"))
        );
        assert_eq!(
            extract_function_key("/v1/function/ns/echo"),
            Some(FunctionKey::new("ns", "echo"))
        );
        assert_eq!(extract_function_key("/gateway/function/ns"), None);
    }

    fn node(name: &str) -> NodeView {
        NodeView {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            capacity_memory_bytes: 1 << 30,
            capacity_cpu_millis: 2000,
            gpu_memory_bytes: None,
            community: Some("c-0".to_string()),
            role: None,
            ready: true,
            master: false,
            labels: Default::default(),
            resource_version: 0,
        }
    }

    async fn routed_dispatcher(port: u16) -> Arc<Dispatcher> {
        let cluster = Arc::new(MemoryCluster::new(true));
        cluster.insert_node(node("node-1"));
        cluster.insert_function(FunctionSpec {
            key: FunctionKey::new("ns", "echo"),
            image: "echo:1".to_string(),
            env: Default::default(),
            port,
            requests: Resources::default(),
            limits: Resources::default(),
            gpu: false,
            max_delay_ms: 100,
        });
        let pod = PodView {
            namespace: "ns".to_string(),
            name: "echo-1".to_string(),
            function: FunctionKey::new("ns", "echo"),
            community: "c-0".to_string(),
            node: None,
            gpu: false,
            phase: PodPhase::Pending,
            ready: false,
            deletion_requested: false,
            ip: None,
            port,
            image: "echo:1".to_string(),
            env: Default::default(),
            requests: Resources::default(),
            limits: Resources::default(),
            labels: Default::default(),
            resource_version: 0,
        };
        cluster.create_pod(&pod).await.unwrap();
        cluster.bind_pod("ns", "echo-1", "node-1").await.unwrap();

        let mut schedule = CommunitySchedule::empty("ns", "c-0");
        let mut rules = RoutingRules::new();
        rules
            .entry("node-1".to_string())
            .or_default()
            .entry("node-1".to_string())
            .or_default()
            .insert(FunctionKey::new("ns", "echo"), 1.0);
        schedule.cpu_routing_rules = rules;
        cluster.create_schedule(&schedule).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            "node-1",
            "ns",
            &DispatcherConfig::default(),
            cluster,
        ));
        dispatcher.sync_routing().await.unwrap();
        dispatcher
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: gateway.local\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn function_requests_flow_through_the_queue() {
        let upstream = echo_upstream().await;
        let dispatcher = routed_dispatcher(upstream.port()).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = tokio::spawn(dispatcher.clone().run_workers(stop_rx.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(
            DispatchServer::new(addr, dispatcher.clone()).serve_listener(listener, stop_rx),
        );

        let response = raw_get(addr, "/function/ns/echo/hello?x=1").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("/hello?x=1 127.0.0.1 "), "{response}");

        // Queued too; only a leading prefix is stripped upstream.
        let nested = raw_get(addr, "/gateway/function/ns/echo/hello").await;
        assert!(nested.starts_with("HTTP/1.1 200"), "{nested}");
        assert!(nested.contains("/gateway/function/ns/echo/hello "), "{nested}");

        let missing = raw_get(addr, "/function/ns/missing/").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn closed_queue_answers_503() {
        let dispatcher = routed_dispatcher(1).await;
        dispatcher.queue().close();

        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(DispatchServer::new(addr, dispatcher).serve_listener(listener, stop_rx));

        let response = raw_get(addr, "/function/ns/echo/").await;
        assert!(response.starts_with("HTTP/1.1 503"), "{response}");

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
