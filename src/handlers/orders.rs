//! Order placement.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cache::{item_key, order_key};
use crate::dispatch::{Handler, Request, Response};
use crate::queue::{AsyncTaskManager, LogLevel};
use crate::types::{MiddlewareError, Result};

use super::HandlerContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub user_id: String,
    pub item_id: String,
    pub quantity: u64,
    pub total_price: u64,
    pub created_at: i64,
}

/// `POST /api/v1/orders` (auth).
pub struct CreateOrderHandler {
    ctx: Arc<HandlerContext>,
}

impl CreateOrderHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for CreateOrderHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        let identity = request.require_identity()?.clone();
        let item_id = request.payload["item_id"]
            .as_str()
            .ok_or_else(|| MiddlewareError::BadRequest("item_id is required".to_string()))?;
        let quantity = request.payload["quantity"].as_u64().unwrap_or(1).max(1);

        let item_bytes = self
            .ctx
            .cache
            .get(&item_key(&request.game_id, item_id))
            .await?
            .ok_or_else(|| MiddlewareError::NotFound(format!("item {item_id}")))?;
        let item: super::items::ItemRecord = serde_json::from_slice(&item_bytes)
            .map_err(|e| MiddlewareError::Internal(format!("corrupt item record: {e}")))?;

        let record = OrderRecord {
            order_id: Uuid::new_v4().to_string(),
            user_id: identity.user_id.clone(),
            item_id: item.item_id.clone(),
            quantity,
            total_price: item.price.saturating_mul(quantity),
            created_at: chrono::Utc::now().timestamp(),
        };
        let key = order_key(&request.game_id, &record.order_id);
        self.ctx.cache.put(&key, serde_json::to_vec(&record)?).await?;

        // Commit confirmation runs at critical priority; the audit record is
        // fire-and-forget.
        self.ctx
            .tasks
            .enqueue(AsyncTaskManager::business_task(
                "order_commit",
                json!({
                    "game_id": request.game_id,
                    "order_id": record.order_id,
                    "user_id": record.user_id,
                }),
                None,
            ))
            .ok();
        self.ctx
            .tasks
            .enqueue(AsyncTaskManager::log_task(
                LogLevel::Info,
                "order placed",
                json!({ "order_id": record.order_id, "total": record.total_price }),
            ))
            .ok();

        Ok(Response::ok(serde_json::to_value(record)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OpKey;
    use crate::handlers::tests_support::{authed_request, test_context};
    use crate::handlers::CreateItemHandler;
    use hyper::Method;

    #[tokio::test]
    async fn test_order_for_existing_item() {
        let ctx = test_context().await;
        CreateItemHandler::new(Arc::clone(&ctx))
            .handle(authed_request(
                OpKey::http(Method::POST, "/api/v1/items"),
                json!({ "item_id": "sword", "price": 120 }),
            ))
            .await
            .expect("create item");

        let handler = CreateOrderHandler::new(Arc::clone(&ctx));
        let response = handler
            .handle(authed_request(
                OpKey::http(Method::POST, "/api/v1/orders"),
                json!({ "item_id": "sword", "quantity": 3 }),
            ))
            .await
            .expect("order");
        assert_eq!(response.data["total_price"], 360);
        assert_eq!(response.data["user_id"], "u7");

        // The order is durable and readable back through the cache.
        let order_id = response.data["order_id"].as_str().expect("id");
        let stored = ctx
            .cache
            .get(&order_key("game1", order_id))
            .await
            .expect("get")
            .expect("present");
        let record: OrderRecord = serde_json::from_slice(&stored).expect("decode");
        assert_eq!(record.quantity, 3);
    }

    #[tokio::test]
    async fn test_order_for_missing_item_is_not_found() {
        let ctx = test_context().await;
        let handler = CreateOrderHandler::new(ctx);
        assert!(matches!(
            handler
                .handle(authed_request(
                    OpKey::http(Method::POST, "/api/v1/orders"),
                    json!({ "item_id": "ghost" }),
                ))
                .await,
            Err(MiddlewareError::NotFound(_))
        ));
    }
}
