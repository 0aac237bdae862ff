//! Protocol-level system handlers for the TCP surface.

use async_trait::async_trait;
use serde_json::json;

use crate::dispatch::{Handler, Request, Response};
use crate::protocol::PROTOCOL_VERSION;
use crate::types::Result;

/// TCP message 4098: connection handshake. Public; returns the protocol
/// version so clients can fail fast on a mismatch.
pub struct HandshakeHandler;

#[async_trait]
impl Handler for HandshakeHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        Ok(Response::ok(json!({
            "protocol_version": PROTOCOL_VERSION,
            "game_id": request.game_id,
            "server_time": chrono::Utc::now().timestamp(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OpKey;
    use crate::protocol::MSG_HANDSHAKE;
    use serde_json::Value;

    #[tokio::test]
    async fn test_handshake_reports_protocol_version() {
        let response = HandshakeHandler
            .handle(Request::new(
                "game1",
                OpKey::Message(MSG_HANDSHAKE),
                Value::Null,
            ))
            .await
            .expect("handshake");
        assert_eq!(response.data["protocol_version"], 1);
    }
}
