//! Request data handed to the hook pipeline by the HTTP layer

use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;

/// Everything the filters and the normalizer need from one inbound request.
/// The body is already decoded; the pipeline never sees raw bytes.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub remote_addr: IpAddr,
    /// Captures from the matched route, e.g. `{token}` in `/hook/{token}`.
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Value,
}

impl HookRequest {
    pub fn new(remote_addr: IpAddr, body: Value) -> Self {
        Self {
            remote_addr: remote_addr.to_canonical(),
            path_params: HashMap::new(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_path_params(mut self, path_params: HashMap<String, String>) -> Self {
        self.path_params = path_params;
        self
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Looks a parameter up in the route captures, then the body, then the
    /// query string. Scalar body values are stringified; objects and arrays
    /// are ignored.
    pub fn param(&self, key: &str) -> Option<String> {
        if let Some(value) = self.path_params.get(key) {
            return Some(value.clone());
        }
        let from_body = match self.body.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        };
        from_body.or_else(|| self.query.get(key).cloned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
