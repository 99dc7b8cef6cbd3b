// src/router.rs
//! Path dispatch for the store API
//!
//! A request path is matched in this order:
//! 1. the global table, keyed by the first path segment (`status`, `meta/`, ...)
//! 2. otherwise an entity reference is parsed off the front of the path, and
//!    what follows it is matched against the id table (`archive`, `meta/`, ...)
//!
//! Table keys are either exact (`"foo"`, nothing may follow) or prefixes
//! (`"foo/"`, something must follow; the handler sees it as `path`).

use crate::error::{classify, ErrorEnvelope, StoreError};
use crate::reference::EntityReference;
use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// An inbound request as handlers see it
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path left after the matched table key
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// First value of a query parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated query parameter, in order
    pub fn params(&self, name: &str) -> Vec<String> {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// What a handler produced
pub enum Reply {
    /// Marshalled JSON, sent with status 200
    Json(Vec<u8>),
    /// A response the handler built itself (archives, files, other statuses)
    Response(Response),
}

impl Reply {
    /// Marshal `value` now, so a serialization failure is an error and not a half-written body
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Reply::Json(serde_json::to_vec(value)?))
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Json(data) => json_bytes_response(StatusCode::OK, data),
            Reply::Response(response) => response,
        }
    }
}

pub type GlobalHandler<S> = Arc<dyn Fn(S, Request) -> BoxFuture<'static, Result<Reply>> + Send + Sync>;
pub type IdHandler<S> =
    Arc<dyn Fn(S, EntityReference, Request) -> BoxFuture<'static, Result<Reply>> + Send + Sync>;

pub struct RouterBuilder<S> {
    global: BTreeMap<String, GlobalHandler<S>>,
    id: BTreeMap<String, IdHandler<S>>,
    timeout: Option<Duration>,
}

impl<S: Clone + Send + Sync + 'static> RouterBuilder<S> {
    pub fn global<F, Fut>(mut self, key: &str, f: F) -> Result<Self>
    where
        F: Fn(S, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        check_key(key, self.global.contains_key(key))?;
        self.global
            .insert(key.to_string(), Arc::new(move |state, req| f(state, req).boxed()));
        Ok(self)
    }

    pub fn id<F, Fut>(mut self, key: &str, f: F) -> Result<Self>
    where
        F: Fn(S, EntityReference, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        check_key(key, self.id.contains_key(key))?;
        self.id.insert(
            key.to_string(),
            Arc::new(move |state, id, req| f(state, id, req).boxed()),
        );
        Ok(self)
    }

    /// Fail requests still running after `timeout`, abandoning their work
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Router<S> {
        Router {
            global: self.global,
            id: self.id,
            timeout: self.timeout,
        }
    }
}

fn check_key(key: &str, exists: bool) -> Result<()> {
    if key.is_empty() || key.starts_with('/') {
        anyhow::bail!("invalid handler key {:?}", key);
    }
    if exists {
        anyhow::bail!("handler {:?} registered twice", key);
    }
    Ok(())
}

pub struct Router<S> {
    global: BTreeMap<String, GlobalHandler<S>>,
    id: BTreeMap<String, IdHandler<S>>,
    timeout: Option<Duration>,
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    pub fn builder() -> RouterBuilder<S> {
        RouterBuilder {
            global: BTreeMap::new(),
            id: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Route one request, turning any failure into the JSON error envelope
    pub async fn dispatch(&self, state: S, req: Request) -> Response {
        let method = req.method.clone();
        let path = req.path.clone();
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.route(state, req)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(format!("request timed out after {:?}", timeout)).into()),
            },
            None => self.route(state, req).await,
        };
        match result {
            Ok(reply) => reply.into_response(),
            Err(e) => {
                log::debug!("[Router] {} /{}: {:#}", method, path.trim_start_matches('/'), e);
                error_response(&e)
            }
        }
    }

    async fn route(&self, state: S, mut req: Request) -> Result<Reply> {
        let path = req.path.trim_start_matches('/').to_string();

        if let Some((handler, rest)) = match_key(&self.global, &path) {
            req.path = rest.to_string();
            return handler(state, req).await;
        }

        // Grammar detail of a bad reference is not shown to the client.
        let (id, rest) = EntityReference::split_path(&path)?;

        let (handler, rest) = match_key(&self.id, rest)
            .ok_or_else(|| StoreError::not_found(format!("not found: /{}", path)))?;
        req.path = rest.to_string();
        handler(state, id, req).await
    }
}

/// Match the first segment of `path` against a handler table.
///
/// An exact key matches only when nothing but an optional trailing slash
/// follows; a `key/` entry matches only when a non-empty remainder follows.
pub fn match_key<'a, H>(table: &'a BTreeMap<String, H>, path: &'a str) -> Option<(&'a H, &'a str)> {
    let path = path.trim_start_matches('/');
    let (first, rest) = match path.find('/') {
        Some(i) => (&path[..i], path[i + 1..].trim_start_matches('/')),
        None => (path, ""),
    };
    if first.is_empty() {
        return None;
    }
    if rest.is_empty() {
        return table.get(first).map(|h| (h, ""));
    }
    table
        .iter()
        .find(|(key, _)| key.len() == first.len() + 1 && key.starts_with(first) && key.ends_with('/'))
        .map(|(_, h)| (h, rest))
}

fn json_bytes_response(status: StatusCode, data: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(data));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Marshal `value` fully, then build the response; a marshal failure is a 500 envelope
pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(data) => json_bytes_response(status, data),
        Err(e) => {
            log::error!("[Router] Cannot marshal response: {}", e);
            error_response(&anyhow::Error::new(e).context("cannot marshal response"))
        }
    }
}

/// The JSON error envelope for `err`, with the status its classification carries
pub fn error_response(err: &anyhow::Error) -> Response {
    let (status, envelope) = match classify(err) {
        Some(store_err) => (store_err.status(), ErrorEnvelope::from(store_err)),
        None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorEnvelope {
                    message: err.to_string(),
                    code: None,
                },
            ),
    };
    if status.is_server_error() {
        log::warn!("[Router] {}: {:#}", status, err);
    }
    // An envelope of two strings always marshals.
    let data = serde_json::to_vec(&envelope).unwrap_or_default();
    json_bytes_response(status, data)
}
