//! Per-game request handlers.
//!
//! Handlers are surface-agnostic: the same implementations back the HTTP
//! routes and the TCP message types. All reads and writes go through the
//! cache manager, and non-critical follow-up work (audit logs, business
//! sync, cleanup) is enqueued on the async manager rather than done inline.

mod games;
mod items;
mod orders;
mod players;
mod system;

use std::sync::Arc;

use hyper::Method;

use crate::auth::JwtValidator;
use crate::cache::CacheManager;
use crate::dispatch::{OpKey, RouterBuilder};
use crate::protocol::{MSG_HANDSHAKE, MSG_LOGIN, MSG_PLAYER_DATA};
use crate::queue::AsyncTaskManager;

pub use games::ListGamesHandler;
pub use items::{CreateItemHandler, ListItemsHandler};
pub use orders::CreateOrderHandler;
pub use players::{GetPlayerHandler, LoginHandler, PlayerDataHandler, RegisterHandler};
pub use system::HandshakeHandler;

/// Shared dependencies injected into every handler.
pub struct HandlerContext {
    pub cache: Arc<CacheManager>,
    pub tasks: Arc<AsyncTaskManager>,
    pub jwt: Arc<JwtValidator>,
    pub games: Vec<String>,
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::cache::{CacheManager, CacheManagerConfig, InMemoryRemoteCache, L2Cache, L2Config};
    use crate::dispatch::{OpKey, Request};
    use crate::queue::NoopExecutor;
    use crate::storage::MemoryStorage;
    use serde_json::Value;

    /// Handler context wired to in-memory backends, async manager started.
    pub async fn test_context() -> Arc<HandlerContext> {
        let cache = Arc::new(CacheManager::new(
            CacheManagerConfig::default(),
            L2Cache::new(Arc::new(InMemoryRemoteCache::new()), L2Config::default()),
            Arc::new(MemoryStorage::new()),
        ));
        let tasks = Arc::new(AsyncTaskManager::new(1, Arc::new(NoopExecutor)));
        tasks.start();
        Arc::new(HandlerContext {
            cache,
            tasks,
            jwt: Arc::new(JwtValidator::new("test-secret", 3600)),
            games: vec!["game1".to_string()],
        })
    }

    /// Request carrying a valid identity for `game1`.
    pub fn authed_request(op: OpKey, payload: Value) -> Request {
        let mut request = Request::new("game1", op, payload);
        request.identity = Some(crate::auth::Identity {
            user_id: "u7".to_string(),
            game_id: "game1".to_string(),
            scopes: vec!["player".to_string()],
            expires_at: i64::MAX,
        });
        request
    }
}

/// Register the full route set for every configured game.
pub fn register_routes(mut builder: RouterBuilder, ctx: &Arc<HandlerContext>) -> RouterBuilder {
    let register = Arc::new(RegisterHandler::new(Arc::clone(ctx)));
    let login = Arc::new(LoginHandler::new(Arc::clone(ctx)));
    let get_player = Arc::new(GetPlayerHandler::new(Arc::clone(ctx)));
    let player_data = Arc::new(PlayerDataHandler::new(Arc::clone(ctx)));
    let list_items = Arc::new(ListItemsHandler::new(Arc::clone(ctx)));
    let create_item = Arc::new(CreateItemHandler::new(Arc::clone(ctx)));
    let create_order = Arc::new(CreateOrderHandler::new(Arc::clone(ctx)));
    let list_games = Arc::new(ListGamesHandler::new(Arc::clone(ctx)));
    let handshake = Arc::new(HandshakeHandler);

    for game in &ctx.games {
        builder = builder
            // HTTP surface. Public routes are an explicit allow-list.
            .route(
                game,
                OpKey::http(Method::POST, "/api/v1/players/register"),
                true,
                register.clone(),
            )
            .route(
                game,
                OpKey::http(Method::POST, "/api/v1/players/login"),
                true,
                login.clone(),
            )
            .route(
                game,
                OpKey::http(Method::GET, "/api/v1/players/{id}"),
                false,
                get_player.clone(),
            )
            .route(
                game,
                OpKey::http(Method::GET, "/api/v1/items"),
                false,
                list_items.clone(),
            )
            .route(
                game,
                OpKey::http(Method::POST, "/api/v1/items"),
                false,
                create_item.clone(),
            )
            .route(
                game,
                OpKey::http(Method::POST, "/api/v1/orders"),
                false,
                create_order.clone(),
            )
            .route(
                game,
                OpKey::http(Method::GET, "/api/v1/games"),
                false,
                list_games.clone(),
            )
            // TCP surface.
            .route(game, OpKey::Message(MSG_HANDSHAKE), true, handshake.clone())
            .route(game, OpKey::Message(MSG_LOGIN), true, login.clone())
            .route(
                game,
                OpKey::Message(MSG_PLAYER_DATA),
                false,
                player_data.clone(),
            );
    }
    builder
}
