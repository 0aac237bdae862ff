//! Tenant listing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::dispatch::{Handler, Request, Response};
use crate::types::Result;

use super::HandlerContext;

/// `GET /api/v1/games` (auth): the registered tenant games.
pub struct ListGamesHandler {
    ctx: Arc<HandlerContext>,
}

impl ListGamesHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for ListGamesHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        request.require_identity()?;
        Ok(Response::ok(json!({ "games": self.ctx.games })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OpKey;
    use crate::handlers::tests_support::{authed_request, test_context};
    use hyper::Method;
    use serde_json::Value;

    #[tokio::test]
    async fn test_lists_configured_games() {
        let ctx = test_context().await;
        let handler = ListGamesHandler::new(ctx);
        let response = handler
            .handle(authed_request(
                OpKey::http(Method::GET, "/api/v1/games"),
                Value::Null,
            ))
            .await
            .expect("list");
        assert_eq!(response.data["games"][0], "game1");
    }
}
