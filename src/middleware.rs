use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::background::panic_message;
use crate::error::{ErrorResponse, ThrottlerError, ThrottlerResult};
use crate::identity::ClientIdentityResolver;
use crate::registry::ClientRegistry;

/// Admission decision point in front of all routing.
pub struct RateLimitGate {
    registry: Arc<ClientRegistry>,
    resolver: ClientIdentityResolver,
}

impl RateLimitGate {
    pub fn new(registry: Arc<ClientRegistry>, resolver: ClientIdentityResolver) -> Self {
        Self { registry, resolver }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Resolve the client and consult the registry. `Ok(None)` admits the
    /// request; `Ok(Some(wait))` rejects it with the suggested retry delay.
    pub fn admit(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> ThrottlerResult<Option<Duration>> {
        let identity = self.resolver.resolve(headers, peer);

        if self.registry.check(&identity)? {
            return Ok(None);
        }

        warn!(
            target: "gatekeeper::middleware",
            client = %identity,
            "rate limit exceeded"
        );
        let wait = self.registry.retry_after(&identity)?;
        Ok(Some(wait.unwrap_or(Duration::from_secs(1))))
    }
}

/// Rejects over-limit clients with 429 before any handler runs.
pub async fn rate_limit_middleware(
    State(gate): State<Arc<RateLimitGate>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match gate.admit(request.headers(), peer) {
        Ok(None) => next.run(request).await,
        Ok(Some(wait)) => {
            let mut response = ThrottlerError::RateLimitExceeded.into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, retry_after_header(wait));
            response
        }
        Err(e) => e.into_response(),
    }
}

fn retry_after_header(wait: Duration) -> HeaderValue {
    // Whole seconds, rounded up, at least one.
    let secs = wait.as_secs_f64().ceil();
    let secs = if secs.is_finite() && secs < u32::MAX as f64 {
        (secs as u64).max(1)
    } else {
        u32::MAX as u64
    };
    HeaderValue::from(secs)
}

/// Rewrites error responses produced outside the handlers (request timeouts,
/// body limits, method mismatches) into the JSON error envelope.
pub async fn json_error_envelope(State(body_limit): State<usize>, response: Response) -> Response {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) || is_json(response.headers()) {
        return response;
    }

    let error = match status {
        StatusCode::PAYLOAD_TOO_LARGE => ErrorResponse::from_throttler_error(
            &ThrottlerError::PayloadTooLarge { limit: body_limit },
        ),
        StatusCode::REQUEST_TIMEOUT => {
            ErrorResponse::from_throttler_error(&ThrottlerError::RequestTimeout)
        }
        status if status.is_server_error() => ErrorResponse::server_error(),
        status => ErrorResponse::new(
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_lowercase(),
        ),
    };

    let (mut parts, _) = response.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    parts
        .headers
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Response::from_parts(parts, Json(error).into_response().into_body())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

/// Response for a handler that panicked. The connection is closed since the
/// handler may have left it in an unknown state.
pub fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!(panic = %panic_message(&*panic), "handler panicked");

    let mut response = (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::server_error()),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
