use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use convoy_core::ConvoyError;
use convoy_security::RateLimitDecision;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

/// Paths served without credentials.
const PUBLIC_PATHS: &[&str] = &["/health"];

static RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Resolve the caller and store its [`Identity`](convoy_security::Identity)
/// in the request extensions.
///
/// Credentials come from `Authorization: Bearer <jwt>`, `X-API-Key`, or a
/// `token` query parameter (browsers cannot set headers on WebSocket
/// upgrades).
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let headers = request.headers();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .or_else(|| query_param(request.uri().query(), "token"));
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());

    match state.auth.authenticate(bearer.as_deref(), api_key.as_deref()) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Rejected request");
            ApiError::from(e)
                .with_hint("send 'Authorization: Bearer <token>' or 'X-API-Key: <key>'")
                .into_response()
        }
    }
}

/// Sliding-window limit per `(client ip, endpoint)`.
///
/// Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
/// `X-RateLimit-Reset` (seconds); rejected requests get 429 with
/// `Retry-After`.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = client_ip(request.headers(), peer, |ip| {
        state.rate_limiter.trusts_proxy(ip)
    });
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |p| p.as_str().to_string());

    let decision = state.rate_limiter.check(&client_ip, &endpoint).await;
    let mut response = if decision.limited {
        warn!(client = %client_ip, endpoint = %endpoint, limit = decision.limit, "Rate limit exceeded");
        ApiError::from(ConvoyError::RateLimited {
            retry_after_secs: reset_secs(&decision),
        })
        .into_response()
    } else {
        next.run(request).await
    };
    apply_headers(response.headers_mut(), &decision);
    response
}

/// Client address used as the rate-limit key.
///
/// Forwarding headers are only read when the socket peer is a trusted proxy.
/// `X-Forwarded-For` is then walked from the right, skipping trusted hops, so
/// a client cannot pick its own key by prepending addresses. Without a peer
/// (no connect info) the key is `unknown`.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted: impl Fn(&IpAddr) -> bool,
) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted(&peer) {
        return peer.to_string();
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let hops: Vec<IpAddr> = forwarded
            .split(',')
            .filter_map(|hop| hop.trim().parse().ok())
            .collect();
        if let Some(client) = hops.iter().rev().find(|ip| !trusted(ip)).or(hops.first()) {
            return client.to_string();
        }
    }
    if let Some(real) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return real.to_string();
    }
    peer.to_string()
}

fn reset_secs(decision: &RateLimitDecision) -> u64 {
    let reset = decision.reset_after;
    let secs = reset.as_secs() + u64::from(reset.subsec_nanos() > 0);
    if decision.limited {
        secs.max(1)
    } else {
        secs
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RATE_LIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING.clone(), HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET.clone(), HeaderValue::from(reset_secs(decision)));
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
