//! Request filters
//!
//! Each filter pulls one value out of the request (remote address, a token
//! parameter, the pushed ref) and tests it against an [`AllowList`]. Filters
//! are chained in order and the chain stops at the first one that fails.

use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{HookError, Result};
use crate::request::HookRequest;
use crate::webhook::parse_ref;

/// Header GitLab uses to carry the secret token configured on a hook.
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";

pub type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Accepted values for one filter.
#[derive(Clone)]
pub enum AllowList {
    Exact(String),
    Set(Vec<String>),
    Wildcard,
    Predicate(Predicate),
}

impl AllowList {
    /// Builds a list from plain values, collapsing `*` into [`AllowList::Wildcard`].
    /// Returns `None` when there is nothing to match against.
    pub fn from_values<I, S>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_empty())
            .collect();

        if values.iter().any(|v| v == "*") {
            return Some(AllowList::Wildcard);
        }
        match values.len() {
            0 => None,
            1 => values.pop().map(AllowList::Exact),
            _ => Some(AllowList::Set(values)),
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        AllowList::Predicate(Arc::new(f))
    }

    /// A missing value only passes a wildcard.
    pub fn permits(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (AllowList::Wildcard, _) => true,
            (_, None) => false,
            (AllowList::Exact(expected), Some(v)) => expected == v,
            (AllowList::Set(allowed), Some(v)) => allowed.iter().any(|a| a == v),
            (AllowList::Predicate(f), Some(v)) => f(v),
        }
    }
}

impl fmt::Debug for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowList::Exact(v) => f.debug_tuple("Exact").field(v).finish(),
            AllowList::Set(v) => f.debug_tuple("Set").field(v).finish(),
            AllowList::Wildcard => f.write_str("Wildcard"),
            AllowList::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Allow-list as written in the config file: `false`, `"*"`, `"value"` or `["a", "b"]`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AllowListSetting {
    Enabled(bool),
    One(String),
    Many(Vec<String>),
}

impl AllowListSetting {
    /// `None` means the filter is disabled and must not be installed.
    pub fn into_allow_list(self) -> Option<AllowList> {
        match self {
            AllowListSetting::Enabled(false) => None,
            AllowListSetting::Enabled(true) => Some(AllowList::Wildcard),
            AllowListSetting::One(value) => AllowList::from_values([value]),
            AllowListSetting::Many(values) => AllowList::from_values(values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Ip,
    Token,
    Branch,
}

impl FilterKind {
    /// Auth failures answer 404 so the endpoint is not confirmed to strangers.
    pub fn rejection_status(&self) -> StatusCode {
        match self {
            FilterKind::Ip | FilterKind::Token => StatusCode::NOT_FOUND,
            FilterKind::Branch => StatusCode::FORBIDDEN,
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterKind::Ip => "ip",
            FilterKind::Token => "token",
            FilterKind::Branch => "branch",
        };
        f.write_str(name)
    }
}

/// Where a filter reads the value it tests.
#[derive(Debug, Clone)]
enum FieldSource {
    RemoteAddr,
    Param { key: String, fallback_header: &'static str },
    PayloadRef,
}

/// A request that did not get through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub filter: FilterKind,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        self.filter.rejection_status()
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    kind: FilterKind,
    allow: AllowList,
    source: FieldSource,
}

impl Filter {
    pub fn ip(allow: AllowList) -> Self {
        Self {
            kind: FilterKind::Ip,
            allow,
            source: FieldSource::RemoteAddr,
        }
    }

    /// Token read from the `token_key` parameter, or the GitLab token header
    /// when the parameter is absent.
    pub fn token(allow: AllowList, token_key: impl Into<String>) -> Self {
        Self {
            kind: FilterKind::Token,
            allow,
            source: FieldSource::Param {
                key: token_key.into(),
                fallback_header: GITLAB_TOKEN_HEADER,
            },
        }
    }

    /// Compares the short ref name (`production`, not `refs/heads/production`).
    pub fn branch(allow: AllowList) -> Self {
        Self {
            kind: FilterKind::Branch,
            allow,
            source: FieldSource::PayloadRef,
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    fn extract(&self, req: &HookRequest) -> Option<String> {
        match &self.source {
            FieldSource::RemoteAddr => Some(req.remote_addr.to_string()),
            FieldSource::Param {
                key,
                fallback_header,
            } => req
                .param(key)
                .or_else(|| req.header(fallback_header).map(str::to_owned)),
            FieldSource::PayloadRef => request_ref(&req.body),
        }
    }

    pub fn check(&self, req: &HookRequest) -> std::result::Result<(), Rejection> {
        let value = self.extract(req);
        if self.allow.permits(value.as_deref()) {
            Ok(())
        } else {
            if self.kind == FilterKind::Token {
                debug!("token filter rejected request");
            } else {
                debug!(
                    "{} filter rejected {:?}, allowed: {:?}",
                    self.kind, value, self.allow
                );
            }
            Err(Rejection { filter: self.kind })
        }
    }
}

/// Ref name the branch filter tests: the short name for `refs/heads/*` and
/// `refs/tags/*`, otherwise the raw `ref` string.
fn request_ref(body: &Value) -> Option<String> {
    let reference = body.get("ref")?.as_str()?;
    match parse_ref(reference).short_name() {
        Some(name) => Some(name.to_owned()),
        None => Some(reference.to_owned()),
    }
}

/// Ordered, short-circuiting set of filters. Never empty.
#[derive(Debug, Clone)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new(filters: Vec<Filter>) -> Result<Self> {
        if filters.is_empty() {
            return Err(HookError::ConfigError(
                "Invalid webhook configuration. Need some filters to apply handler".to_string(),
            ));
        }
        Ok(Self { filters })
    }

    pub fn check(&self, req: &HookRequest) -> std::result::Result<(), Rejection> {
        self.filters.iter().try_for_each(|filter| filter.check(req))
    }

    pub fn kinds(&self) -> Vec<FilterKind> {
        self.filters.iter().map(Filter::kind).collect()
    }
}
