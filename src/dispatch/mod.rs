//! Request router shared by the TCP and HTTP surfaces.
//!
//! The route table is keyed by `(game_id, op_key)` where the op key is the
//! binary message type on TCP and `(method, path pattern)` on HTTP. The table
//! is built once at startup and published read-only behind an `Arc`; lookups
//! are O(1) hash probes.
//!
//! Handlers never run inline on a session's read loop: dispatch submits them
//! to the `normal` worker pool and awaits the result, so one slow handler
//! cannot stall frame intake.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::Method;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::metrics::Metrics;
use crate::pool::{PoolRegistry, POOL_NORMAL};
use crate::types::{MiddlewareError, Result};

/// Route key: binary message type for TCP, method + path pattern for HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKey {
    Message(u16),
    Http(Method, String),
}

impl OpKey {
    pub fn http(method: Method, pattern: &str) -> Self {
        OpKey::Http(method, pattern.to_string())
    }
}

impl std::fmt::Display for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKey::Message(t) => write!(f, "msg:{t}"),
            OpKey::Http(m, p) => write!(f, "{m} {p}"),
        }
    }
}

/// Surface-agnostic request envelope.
#[derive(Debug)]
pub struct Request {
    pub game_id: String,
    pub op: OpKey,
    /// JSON payload: the parsed HTTP body or the parsed frame body.
    pub payload: Value,
    /// Present iff auth succeeded; public routes may see `None`.
    pub identity: Option<Identity>,
    /// Path parameters extracted by the HTTP surface (e.g. `id`).
    pub params: HashMap<String, String>,
    /// Frame sequence for request/response correlation on TCP; 0 on HTTP.
    pub sequence: u32,
}

impl Request {
    pub fn new(game_id: impl Into<String>, op: OpKey, payload: Value) -> Self {
        Self {
            game_id: game_id.into(),
            op,
            payload,
            identity: None,
            params: HashMap::new(),
            sequence: 0,
        }
    }

    /// Identity or `Unauthenticated`; handlers on protected routes use this.
    pub fn require_identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| MiddlewareError::Unauthenticated("identity required".to_string()))
    }
}

/// Common response envelope. `code == 0` is success.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Response {
    pub code: i32,
    pub message: String,
    pub data: Value,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            code: 0,
            message: "ok".to_string(),
            data,
        }
    }

    pub fn from_error(err: &MiddlewareError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            data: Value::Null,
        }
    }
}

/// A request handler. Implementations are surface-agnostic.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response>;
}

struct Route {
    handler: Arc<dyn Handler>,
    /// Explicit allow-list flag; auth is never bypassed by inference.
    public: bool,
}

/// Builder for the static route table.
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<(String, OpKey), Route>,
    games: HashSet<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn game(mut self, game_id: &str) -> Self {
        self.games.insert(game_id.to_string());
        self
    }

    pub fn route(
        mut self,
        game_id: &str,
        op: OpKey,
        public: bool,
        handler: Arc<dyn Handler>,
    ) -> Self {
        self.games.insert(game_id.to_string());
        self.routes
            .insert((game_id.to_string(), op), Route { handler, public });
        self
    }

    pub fn build(self, pools: Arc<PoolRegistry>, metrics: Arc<Metrics>) -> Dispatcher {
        Dispatcher {
            routes: self.routes,
            games: self.games,
            pools,
            metrics,
        }
    }
}

/// The dispatch fabric. Built once, then shared read-only.
pub struct Dispatcher {
    routes: HashMap<(String, OpKey), Route>,
    games: HashSet<String>,
    pools: Arc<PoolRegistry>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn is_registered_game(&self, game_id: &str) -> bool {
        self.games.contains(game_id)
    }

    pub fn has_route(&self, game_id: &str, op: &OpKey) -> bool {
        self.routes
            .contains_key(&(game_id.to_string(), op.clone()))
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Dispatch a request to its handler on the `normal` pool.
    pub async fn dispatch(&self, request: Request) -> Result<Response> {
        if !self.is_registered_game(&request.game_id) {
            return Err(MiddlewareError::BadRequest(format!(
                "unregistered game {}",
                request.game_id
            )));
        }

        let key = (request.game_id.clone(), request.op.clone());
        let route = match self.routes.get(&key) {
            Some(route) => route,
            None => {
                Metrics::incr(&self.metrics.dispatch_misses);
                debug!(game = %request.game_id, op = %request.op, "no route");
                return Err(MiddlewareError::RouteNotFound(format!(
                    "{} for game {}",
                    request.op, request.game_id
                )));
            }
        };

        if !route.public {
            let identity = request.require_identity()?;
            if identity.game_id != request.game_id {
                warn!(
                    token_game = %identity.game_id,
                    request_game = %request.game_id,
                    "token scoped to a different game"
                );
                return Err(MiddlewareError::Forbidden(
                    "token is scoped to a different game".to_string(),
                ));
            }
        }

        Metrics::incr(&self.metrics.dispatch_hits);
        self.run_on_pool(Arc::clone(&route.handler), request).await
    }

    async fn run_on_pool(
        &self,
        handler: Arc<dyn Handler>,
        request: Request,
    ) -> Result<Response> {
        let pool = self
            .pools
            .get(POOL_NORMAL)
            .ok_or_else(|| MiddlewareError::Internal("normal pool not registered".to_string()))?;

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let result = handler.handle(request).await;
            let _ = tx.send(result);
        })
        .await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(MiddlewareError::Cancelled(
                "handler task dropped before completion".to_string(),
            )),
        }
    }
}
