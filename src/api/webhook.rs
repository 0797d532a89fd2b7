//! Webhook handler shared by every configured hook route

use axum::{
    body::Bytes,
    extract::{ConnectInfo, MatchedPath, Path, Query, State as AxumState},
    http::{HeaderMap, StatusCode},
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use crate::SharedState;
use crate::hook::Decision;
use crate::request::HookRequest;

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Caller address: the socket peer, or the first `X-Forwarded-For` entry
/// when the service runs behind a trusted proxy.
fn remote_addr(peer: SocketAddr, headers: &HeaderMap, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// Handles a webhook POST on any configured hook route.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    path: MatchedPath,
    Path(path_params): Path<HashMap<String, String>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let route = path.as_str();

    // Parse body as JSON; an empty body is an empty object
    let payload: serde_json::Value = if body.is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                info!("Could not parse JSON body on {}: {:?}", route, e);
                return StatusCode::BAD_REQUEST;
            }
        }
    };

    let ip = remote_addr(peer, &headers, state.trust_proxy);
    debug!("New hook request on {} from {}", route, ip);
    let req = HookRequest::new(ip, payload)
        .with_path_params(path_params)
        .with_query(params)
        .with_headers(headers);

    let hook = match state.hooks.decide(route, &req) {
        Decision::Matched(hook) => hook,
        Decision::Rejected(rejection) => return rejection.status(),
        Decision::NoMatch => {
            debug!("No hook on {} accepted the request from {}", route, ip);
            return StatusCode::NOT_FOUND;
        }
    };

    let reservation = match hook.rate_limit() {
        Some(limit) => match state.rate_limiter.lock().await.reserve(hook.name(), limit) {
            Some(reservation) => Some(reservation),
            None => {
                warn!(
                    "Too many dispatches for hook {:?} - {:?} per {:?} seconds",
                    hook.name(),
                    limit.max,
                    limit.window_secs
                );
                return StatusCode::TOO_MANY_REQUESTS;
            }
        },
        None => None,
    };

    let outcome = hook.respond(&req).await;
    if let Some(reservation) = reservation {
        if !outcome.launched {
            state.rate_limiter.lock().await.release(reservation);
        }
    }
    if outcome.status.is_success() {
        state.accepted_count.fetch_add(1, Ordering::Relaxed);
    }
    outcome.status
}
