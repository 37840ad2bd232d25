//! axum middleware wiring the [`SecurityGate`] into a router.
//!
//! ```ignore
//! Router::new()
//!     .route("/api/v1/security/sessions/stats", get(session_stats))
//!     .route_layer(from_fn_with_state(
//!         PermissionGuard::new(gate.clone(), "sessions.read"),
//!         permission_middleware,
//!     ))
//!     .route_layer(from_fn_with_state(gate.clone(), auth_middleware))
//! ```

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::SecurityError;
use crate::gate::{AuthContext, RequestOrigin, SecurityGate};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Build the audit origin from the peer address, or from forwarding headers
/// when `trust_forwarded` is set
pub fn request_origin(request: &Request, trust_forwarded: bool) -> RequestOrigin {
    let headers = request.headers();
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let forwarded = || {
        header_str("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| header_str("x-real-ip").map(str::to_string))
    };

    let ip_address = trust_forwarded
        .then(forwarded)
        .flatten()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let user_agent = header_str(header::USER_AGENT.as_str()).unwrap_or_default();
    let origin = RequestOrigin::new(ip_address, user_agent);

    match header_str(REQUEST_ID_HEADER) {
        Some(id) => origin.with_request_id(id),
        None => origin,
    }
}

/// Require a live session; inserts [`AuthContext`] and [`RequestOrigin`]
/// into the request extensions
pub async fn auth_middleware(
    State(gate): State<SecurityGate>,
    mut request: Request,
    next: Next,
) -> Result<Response, SecurityError> {
    let origin = request_origin(&request, gate.trusts_forwarded_headers());
    let token = bearer_token(request.headers())
        .ok_or(SecurityError::MissingCredentials)?
        .to_string();

    let context = gate.authenticate(&token, &origin).await?;

    request.extensions_mut().insert(context);
    request.extensions_mut().insert(origin);

    Ok(next.run(request).await)
}

/// State for [`permission_middleware`]
#[derive(Clone, Debug)]
pub struct PermissionGuard {
    pub gate: SecurityGate,
    pub permission: &'static str,
}

impl PermissionGuard {
    pub fn new(gate: SecurityGate, permission: &'static str) -> Self {
        Self { gate, permission }
    }
}

/// Reject callers whose role lacks a permission. Must run after [`auth_middleware`].
pub async fn permission_middleware(
    State(guard): State<PermissionGuard>,
    request: Request,
    next: Next,
) -> Result<Response, SecurityError> {
    let context = request
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or(SecurityError::MissingCredentials)?;
    let origin = request
        .extensions()
        .get::<RequestOrigin>()
        .cloned()
        .unwrap_or_else(|| request_origin(&request, guard.gate.trusts_forwarded_headers()));

    guard
        .gate
        .authorize(&context, guard.permission, &origin)
        .await?;

    Ok(next.run(request).await)
}

/// State for [`rate_limit_middleware`]
#[derive(Clone, Debug)]
pub struct EndpointLimit {
    pub gate: SecurityGate,
    pub endpoint: &'static str,
}

impl EndpointLimit {
    pub fn new(gate: SecurityGate, endpoint: &'static str) -> Self {
        Self { gate, endpoint }
    }
}

/// Throttle per authenticated user, or per client address when anonymous.
/// Admitted responses carry `X-RateLimit-*` headers.
pub async fn rate_limit_middleware(
    State(limit): State<EndpointLimit>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .extensions()
        .get::<RequestOrigin>()
        .cloned()
        .unwrap_or_else(|| request_origin(&request, limit.gate.trusts_forwarded_headers()));
    let identity = request
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.user_id.to_string())
        .unwrap_or_else(|| origin.ip_address.clone());

    match limit.gate.admit(limit.endpoint, &identity, &origin).await {
        Ok(decision) => {
            let mut response = next.run(request).await;
            if let Some(decision) = decision {
                decision.apply_headers(response.headers_mut());
            }
            response
        }
        Err(e) => e.into_response(),
    }
}
