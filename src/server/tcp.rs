//! Binary TCP accept loop.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::session::run_session;
use crate::types::Result;

use super::AppState;

/// Run the TCP listener until the process exits. Each accepted connection
/// gets its own session task.
pub async fn run_tcp(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.tcp_listen).await?;
    info!(listen = %state.args.tcp_listen, "tcp surface listening");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let deps = Arc::clone(&state.session_deps);
                tokio::spawn(async move {
                    run_session(stream, addr.to_string(), deps).await;
                });
            }
            Err(e) => {
                error!(error = %e, "tcp accept failed");
            }
        }
    }
}
