//! HTTP/JSON surface.
//!
//! hyper http1 with `TokioIo`, hand-routed like the rest of the stack: a
//! `match (method, path)` resolves each request to operational endpoints or
//! to a dispatcher op key. Every response is the common envelope
//! `{code, message, data}`; `code == 0` is success and error kinds map to
//! HTTP statuses. Request metrics are counted regardless of outcome.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request as HttpRequest, Response as HttpResponse, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::auth::{extract_token_from_header, Identity};
use crate::dispatch::{OpKey, Request, Response};
use crate::metrics::Metrics;
use crate::routes;
use crate::types::{MiddlewareError, Result};

use super::AppState;

/// Run the HTTP listener until the process exits.
pub async fn run_http(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.http_listen).await?;
    info!(listen = %state.args.http_listen, "http surface listening");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(peer = %addr, error = ?e, "http connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "http accept failed");
            }
        }
    }
}

/// Route one HTTP request.
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: HttpRequest<Incoming>,
) -> std::result::Result<HttpResponse<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    Metrics::incr(&state.metrics.http_requests);
    debug!(peer = %addr, %method, %path, "http request");

    let response = match (method.clone(), path.as_str()) {
        (Method::GET, "/health") => routes::health_check(Arc::clone(&state)),
        (Method::GET, "/health/detailed") => routes::health_detailed(Arc::clone(&state)),
        (Method::GET, "/health/components") => routes::health_components(Arc::clone(&state)),
        (Method::GET, "/metrics") => routes::metrics_endpoint(Arc::clone(&state)),

        (_, p) if p.starts_with("/api/v1/") => handle_api_request(Arc::clone(&state), req).await,

        _ => {
            Metrics::incr(&state.metrics.http_errors);
            let err = MiddlewareError::RouteNotFound(path.clone());
            envelope_response(err.http_status(), &Response::from_error(&err))
        }
    };

    Ok(response)
}

/// Resolve an `/api/v1/*` path to a dispatcher op key plus path parameters.
fn resolve_api_op(method: &Method, path: &str) -> Option<(OpKey, HashMap<String, String>)> {
    let mut params = HashMap::new();
    let op = match (method, path) {
        (&Method::POST, "/api/v1/players/register") => {
            OpKey::http(Method::POST, "/api/v1/players/register")
        }
        (&Method::POST, "/api/v1/players/login") => {
            OpKey::http(Method::POST, "/api/v1/players/login")
        }
        (&Method::GET, p) if p.starts_with("/api/v1/players/") => {
            let id = p.strip_prefix("/api/v1/players/")?;
            if id.is_empty() || id.contains('/') {
                return None;
            }
            params.insert("id".to_string(), id.to_string());
            OpKey::http(Method::GET, "/api/v1/players/{id}")
        }
        (&Method::GET, "/api/v1/items") => OpKey::http(Method::GET, "/api/v1/items"),
        (&Method::POST, "/api/v1/items") => OpKey::http(Method::POST, "/api/v1/items"),
        (&Method::POST, "/api/v1/orders") => OpKey::http(Method::POST, "/api/v1/orders"),
        (&Method::GET, "/api/v1/games") => OpKey::http(Method::GET, "/api/v1/games"),
        _ => return None,
    };
    Some((op, params))
}

/// Handle a business API request: auth, envelope parsing, dispatch.
async fn handle_api_request(
    state: Arc<AppState>,
    req: HttpRequest<Incoming>,
) -> HttpResponse<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (op, params) = match resolve_api_op(&method, &path) {
        Some(resolved) => resolved,
        None => {
            Metrics::incr(&state.metrics.http_errors);
            let err = MiddlewareError::RouteNotFound(format!("{method} {path}"));
            return envelope_response(err.http_status(), &Response::from_error(&err));
        }
    };

    // Bearer token, when present, must be valid even on public routes.
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .map(String::from);
    let identity = match auth_header.as_deref() {
        Some(header) => match extract_token_from_header(header) {
            Some(token) => match state.jwt.validate(token) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    Metrics::incr(&state.metrics.auth_rejections);
                    Metrics::incr(&state.metrics.http_errors);
                    return envelope_response(e.http_status(), &Response::from_error(&e));
                }
            },
            None => {
                Metrics::incr(&state.metrics.auth_rejections);
                Metrics::incr(&state.metrics.http_errors);
                let err =
                    MiddlewareError::Unauthenticated("malformed authorization header".to_string());
                return envelope_response(err.http_status(), &Response::from_error(&err));
            }
        },
        None => None,
    };

    let game_header = req
        .headers()
        .get("x-game-id")
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    let payload = match read_json_body(req).await {
        Ok(payload) => payload,
        Err(e) => {
            Metrics::incr(&state.metrics.http_errors);
            return envelope_response(e.http_status(), &Response::from_error(&e));
        }
    };

    let game_id = match resolve_game_id(&state, game_header, identity.as_ref(), &payload) {
        Ok(game_id) => game_id,
        Err(e) => {
            Metrics::incr(&state.metrics.http_errors);
            return envelope_response(e.http_status(), &Response::from_error(&e));
        }
    };

    let mut request = Request::new(game_id, op, payload);
    request.identity = identity;
    request.params = params;

    match state.dispatcher.dispatch(request).await {
        Ok(response) => envelope_response(StatusCode::OK, &response),
        Err(e) => {
            Metrics::incr(&state.metrics.http_errors);
            if matches!(e, MiddlewareError::Unauthenticated(_)) {
                Metrics::incr(&state.metrics.auth_rejections);
            }
            envelope_response(e.http_status(), &Response::from_error(&e))
        }
    }
}

/// Tenant resolution: `X-Game-Id` header, then a `game_id` payload field,
/// then the token's scope, then the sole configured game.
fn resolve_game_id(
    state: &AppState,
    header: Option<String>,
    identity: Option<&Identity>,
    payload: &Value,
) -> Result<String> {
    if let Some(game) = header {
        return Ok(game);
    }
    if let Some(game) = payload.get("game_id").and_then(Value::as_str) {
        return Ok(game.to_string());
    }
    if let Some(identity) = identity {
        return Ok(identity.game_id.clone());
    }
    let games = state.args.game_list();
    if games.len() == 1 {
        return Ok(games[0].clone());
    }
    Err(MiddlewareError::BadRequest(
        "game id required (X-Game-Id header or game_id field)".to_string(),
    ))
}

async fn read_json_body(req: HttpRequest<Incoming>) -> Result<Value> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| MiddlewareError::BadRequest(format!("body read failed: {e}")))?
        .to_bytes();
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| MiddlewareError::BadRequest(format!("invalid json body: {e}")))
}

fn envelope_response(status: StatusCode, response: &Response) -> HttpResponse<Full<Bytes>> {
    let body = serde_json::to_string(response).unwrap_or_else(|_| {
        json!({ "code": 5000, "message": "serialization failure", "data": null }).to_string()
    });
    HttpResponse::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_api_op_patterns() {
        let (op, params) = resolve_api_op(&Method::GET, "/api/v1/players/u7").expect("resolve");
        assert_eq!(op, OpKey::http(Method::GET, "/api/v1/players/{id}"));
        assert_eq!(params["id"], "u7");

        assert!(resolve_api_op(&Method::GET, "/api/v1/players/").is_none());
        assert!(resolve_api_op(&Method::GET, "/api/v1/players/u7/extra").is_none());
        assert!(resolve_api_op(&Method::DELETE, "/api/v1/items").is_none());

        let (op, params) = resolve_api_op(&Method::POST, "/api/v1/orders").expect("resolve");
        assert_eq!(op, OpKey::http(Method::POST, "/api/v1/orders"));
        assert!(params.is_empty());
    }
}
