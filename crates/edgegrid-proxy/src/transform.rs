//! Rewrites an inbound request for a chosen backend.

use std::net::IpAddr;

use http::header::{HOST, HeaderName, HeaderValue};
use http::uri::PathAndQuery;
use http::{Request, Uri};

use crate::error::{ProxyError, ProxyResult};

pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Drop a leading `/function/<ns>/<name>`; other paths are kept as is.
pub fn strip_function_prefix(path: &str) -> String {
    let Some(rest) = path.strip_prefix("/function/") else {
        return path.to_string();
    };
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next()) {
        (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
            format!("/{}", parts.next().unwrap_or_default())
        }
        _ => path.to_string(),
    }
}

/// Point `req` at `backend`.
///
/// Scheme and authority come from the backend; the path loses its
/// function prefix; the query and all headers are kept. Forwarding
/// headers are only added when the client did not send them.
pub fn upstream_request<B>(
    req: Request<B>,
    backend: &Uri,
    remote: Option<IpAddr>,
) -> ProxyResult<Request<B>> {
    let (mut parts, body) = req.into_parts();

    let path = strip_function_prefix(parts.uri.path());
    let base = backend.path().trim_end_matches('/');
    let path_and_query = match parts.uri.query() {
        Some(q) => format!("{base}{path}?{q}"),
        None => format!("{base}{path}"),
    };
    let path_and_query: PathAndQuery = path_and_query
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::Request(e.to_string()))?;

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = backend.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = backend.authority() {
        builder = builder.authority(authority.clone());
    }
    let original_host = parts
        .headers
        .get(HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
    parts.uri = builder
        .build()
        .map_err(|e| ProxyError::Request(e.to_string()))?;

    if !parts.headers.contains_key(&X_FORWARDED_HOST) {
        if let Some(host) = original_host {
            parts.headers.insert(X_FORWARDED_HOST.clone(), host);
        }
    }
    if !parts.headers.contains_key(&X_FORWARDED_FOR) {
        if let Some(ip) = remote {
            let value = HeaderValue::from_str(&ip.to_string())
                .map_err(|e| ProxyError::Request(e.to_string()))?;
            parts.headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }

    Ok(Request::from_parts(parts, body))
}
