//! Item catalog handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::{item_key, item_prefix};
use crate::dispatch::{Handler, Request, Response};
use crate::queue::AsyncTaskManager;
use crate::types::{MiddlewareError, Result};

use super::HandlerContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: String,
    pub name: String,
    pub price: u64,
    pub created_at: i64,
}

/// `GET /api/v1/items` (auth).
pub struct ListItemsHandler {
    ctx: Arc<HandlerContext>,
}

impl ListItemsHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for ListItemsHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        request.require_identity()?;

        let mut keys = self.ctx.cache.list_keys(&item_prefix(&request.game_id)).await?;
        keys.sort();

        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.ctx.cache.get(&key).await? {
                let item: ItemRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| MiddlewareError::Internal(format!("corrupt item record: {e}")))?;
                items.push(item);
            }
        }
        Ok(Response::ok(json!({ "items": items })))
    }
}

/// `POST /api/v1/items` (auth).
pub struct CreateItemHandler {
    ctx: Arc<HandlerContext>,
}

impl CreateItemHandler {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for CreateItemHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        request.require_identity()?;
        let item_id = request.payload["item_id"]
            .as_str()
            .ok_or_else(|| MiddlewareError::BadRequest("item_id is required".to_string()))?
            .to_string();
        let name = request.payload["name"]
            .as_str()
            .unwrap_or(&item_id)
            .to_string();
        let price = request.payload["price"].as_u64().unwrap_or(0);

        let key = item_key(&request.game_id, &item_id);
        if self.ctx.cache.get(&key).await?.is_some() {
            return Err(MiddlewareError::Conflict(format!(
                "item {item_id} already exists"
            )));
        }

        let record = ItemRecord {
            item_id: item_id.clone(),
            name,
            price,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.ctx.cache.put(&key, serde_json::to_vec(&record)?).await?;

        self.ctx
            .tasks
            .enqueue(AsyncTaskManager::business_task(
                "item_created",
                json!({ "game_id": request.game_id, "item_id": item_id }),
                None,
            ))
            .ok();

        Ok(Response::ok(serde_json::to_value(record)?))
    }
}
