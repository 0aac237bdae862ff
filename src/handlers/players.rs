//! Player registration, login, and data access.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::user_key;
use crate::dispatch::{Handler, Request, Response};
use crate::queue::{AsyncTaskManager, LogLevel};
use crate::types::{MiddlewareError, Result};

use super::HandlerContext;

/// Stored player record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub user_id: String,
    pub display_name: String,
    pub level: u32,
    pub created_at: i64,
    pub data: Value,
}

fn load_player(bytes: &[u8]) -> Result<PlayerRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| MiddlewareError::Internal(format!("corrupt player record: {e}")))
}

/// `POST /api/v1/players/register` (public).
pub struct RegisterHandler {
    ctx: Arc<HandlerContext>,
}

impl RegisterHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for RegisterHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        let user_id = request.payload["user_id"]
            .as_str()
            .ok_or_else(|| MiddlewareError::BadRequest("user_id is required".to_string()))?
            .to_string();
        let display_name = request.payload["display_name"]
            .as_str()
            .unwrap_or(&user_id)
            .to_string();

        let key = user_key(&request.game_id, &user_id);
        if self.ctx.cache.get(&key).await?.is_some() {
            return Err(MiddlewareError::Conflict(format!(
                "player {user_id} already registered"
            )));
        }

        let record = PlayerRecord {
            user_id: user_id.clone(),
            display_name,
            level: 1,
            created_at: chrono::Utc::now().timestamp(),
            data: json!({}),
        };
        self.ctx.cache.put(&key, serde_json::to_vec(&record)?).await?;

        self.ctx
            .tasks
            .enqueue(AsyncTaskManager::business_task(
                "register",
                json!({ "game_id": request.game_id, "user_id": user_id }),
                None,
            ))
            .ok();
        debug!(game = %request.game_id, user = %record.user_id, "player registered");

        Ok(Response::ok(json!({
            "user_id": record.user_id,
            "display_name": record.display_name,
        })))
    }
}

/// `POST /api/v1/players/login` and TCP message 4353 (public). Issues the
/// bearer token the guard validates on subsequent requests.
pub struct LoginHandler {
    ctx: Arc<HandlerContext>,
}

impl LoginHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for LoginHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        let user_id = request.payload["user_id"]
            .as_str()
            .ok_or_else(|| MiddlewareError::BadRequest("user_id is required".to_string()))?;

        let key = user_key(&request.game_id, user_id);
        let record = match self.ctx.cache.get(&key).await? {
            Some(bytes) => load_player(&bytes)?,
            None => {
                return Err(MiddlewareError::Unauthenticated(format!(
                    "unknown player {user_id}"
                )))
            }
        };

        let token = self
            .ctx
            .jwt
            .issue(&record.user_id, &request.game_id, vec!["player".to_string()])?;

        self.ctx
            .tasks
            .enqueue(AsyncTaskManager::business_task(
                "login",
                json!({ "game_id": request.game_id, "user_id": record.user_id }),
                None,
            ))
            .ok();
        self.ctx
            .tasks
            .enqueue(AsyncTaskManager::log_task(
                LogLevel::Info,
                "player login",
                json!({ "game_id": request.game_id, "user_id": record.user_id }),
            ))
            .ok();

        Ok(Response::ok(json!({
            "token": token,
            "user_id": record.user_id,
            "display_name": record.display_name,
        })))
    }
}

/// `GET /api/v1/players/{id}` (auth).
pub struct GetPlayerHandler {
    ctx: Arc<HandlerContext>,
}

impl GetPlayerHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for GetPlayerHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        request.require_identity()?;
        let user_id = request
            .params
            .get("id")
            .cloned()
            .or_else(|| request.payload["user_id"].as_str().map(String::from))
            .ok_or_else(|| MiddlewareError::BadRequest("player id is required".to_string()))?;

        let key = user_key(&request.game_id, &user_id);
        match self.ctx.cache.get(&key).await? {
            Some(bytes) => {
                let record = load_player(&bytes)?;
                Ok(Response::ok(serde_json::to_value(record)?))
            }
            None => Err(MiddlewareError::NotFound(format!("player {user_id}"))),
        }
    }
}

/// TCP message 4354: read or update the calling player's record.
pub struct PlayerDataHandler {
    ctx: Arc<HandlerContext>,
}

impl PlayerDataHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for PlayerDataHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        let identity = request.require_identity()?.clone();
        let key = user_key(&request.game_id, &identity.user_id);

        match request.payload["action"].as_str().unwrap_or("get") {
            "get" => match self.ctx.cache.get(&key).await? {
                Some(bytes) => Ok(Response::ok(serde_json::to_value(load_player(&bytes)?)?)),
                None => Err(MiddlewareError::NotFound(format!(
                    "player {}",
                    identity.user_id
                ))),
            },
            "set" => {
                let mut record = match self.ctx.cache.get(&key).await? {
                    Some(bytes) => load_player(&bytes)?,
                    None => {
                        return Err(MiddlewareError::NotFound(format!(
                            "player {}",
                            identity.user_id
                        )))
                    }
                };
                record.data = request.payload["data"].clone();
                self.ctx.cache.put(&key, serde_json::to_vec(&record)?).await?;

                self.ctx
                    .tasks
                    .enqueue(AsyncTaskManager::business_task(
                        "player_data_sync",
                        json!({ "game_id": request.game_id, "user_id": identity.user_id }),
                        None,
                    ))
                    .ok();
                Ok(Response::ok(json!({ "updated": true })))
            }
            other => Err(MiddlewareError::BadRequest(format!(
                "unknown action {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests_support::test_context;
    use crate::dispatch::OpKey;
    use crate::protocol::MSG_PLAYER_DATA;
    use hyper::Method;

    fn register_request(user: &str) -> Request {
        Request::new(
            "game1",
            OpKey::http(Method::POST, "/api/v1/players/register"),
            json!({ "user_id": user, "display_name": "Alice" }),
        )
    }

    #[tokio::test]
    async fn test_register_login_get_flow() {
        let ctx = test_context().await;
        let register = RegisterHandler::new(Arc::clone(&ctx));
        let login = LoginHandler::new(Arc::clone(&ctx));
        let get = GetPlayerHandler::new(Arc::clone(&ctx));

        let response = register
            .handle(register_request("u7"))
            .await
            .expect("register");
        assert_eq!(response.code, 0);

        // Duplicate registration conflicts.
        assert!(matches!(
            register.handle(register_request("u7")).await,
            Err(MiddlewareError::Conflict(_))
        ));

        let response = login
            .handle(Request::new(
                "game1",
                OpKey::http(Method::POST, "/api/v1/players/login"),
                json!({ "user_id": "u7" }),
            ))
            .await
            .expect("login");
        let token = response.data["token"].as_str().expect("token").to_string();
        let identity = ctx.jwt.validate(&token).expect("valid token");
        assert_eq!(identity.user_id, "u7");

        let mut request = Request::new(
            "game1",
            OpKey::http(Method::GET, "/api/v1/players/{id}"),
            Value::Null,
        );
        request.identity = Some(identity);
        request.params.insert("id".to_string(), "u7".to_string());
        let response = get.handle(request).await.expect("get");
        assert_eq!(response.data["display_name"], "Alice");
    }

    #[tokio::test]
    async fn test_login_unknown_player_is_unauthenticated() {
        let ctx = test_context().await;
        let login = LoginHandler::new(Arc::clone(&ctx));
        assert!(matches!(
            login
                .handle(Request::new(
                    "game1",
                    OpKey::http(Method::POST, "/api/v1/players/login"),
                    json!({ "user_id": "ghost" }),
                ))
                .await,
            Err(MiddlewareError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_player_data_set_then_get() {
        let ctx = test_context().await;
        RegisterHandler::new(Arc::clone(&ctx))
            .handle(register_request("u9"))
            .await
            .expect("register");

        let identity = crate::auth::Identity {
            user_id: "u9".to_string(),
            game_id: "game1".to_string(),
            scopes: vec![],
            expires_at: i64::MAX,
        };
        let handler = PlayerDataHandler::new(Arc::clone(&ctx));

        let mut set = Request::new(
            "game1",
            OpKey::Message(MSG_PLAYER_DATA),
            json!({ "action": "set", "data": { "hp": 100 } }),
        );
        set.identity = Some(identity.clone());
        assert_eq!(handler.handle(set).await.expect("set").code, 0);

        let mut get = Request::new(
            "game1",
            OpKey::Message(MSG_PLAYER_DATA),
            json!({ "action": "get" }),
        );
        get.identity = Some(identity);
        let response = handler.handle(get).await.expect("get");
        assert_eq!(response.data["data"]["hp"], 100);
    }
}
