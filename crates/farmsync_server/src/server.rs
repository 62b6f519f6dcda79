//! HTTP surface of the receiver.
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/farmsync/apply` | POST | apply a signed batch |
//! | `/farmsync/health` | GET | liveness and counters |
//!
//! Handlers touch local state synchronously, so every apply runs on the
//! blocking pool.

use crate::auth::SignedHeaders;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::ApplyHandler;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use farmsync_core::{SyncStats, TaskRegistry, VersionLedger};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Path of the apply endpoint.
pub const APPLY_ROUTE: &str = "/farmsync/apply";
/// Path of the health endpoint.
pub const HEALTH_ROUTE: &str = "/farmsync/health";

/// The receiving side of a node.
///
/// # Example
///
/// ```
/// use farmsync_core::{SyncStats, TaskRegistryBuilder};
/// use farmsync_server::{ServerConfig, SyncServer};
/// use std::sync::Arc;
///
/// let config = ServerConfig::default().with_trusted_sender("node-a", "token");
/// let registry = Arc::new(TaskRegistryBuilder::new().seal());
/// let server = SyncServer::new(config, registry, Arc::new(SyncStats::new()));
///
/// // Unsigned requests are refused.
/// let (status, _) = server.handle_apply(&[] as &[(&str, &str)], b"{}");
/// assert_eq!(status, 401);
/// ```
pub struct SyncServer {
    config: ServerConfig,
    handler: ApplyHandler,
}

impl SyncServer {
    /// Creates a receiver applying tasks through `registry`.
    pub fn new(config: ServerConfig, registry: Arc<TaskRegistry>, stats: Arc<SyncStats>) -> Self {
        let handler = ApplyHandler::new(&config, registry, stats);
        Self { config, handler }
    }

    /// Shares a version ledger with the local logger.
    #[must_use]
    pub fn with_versions(mut self, versions: Arc<VersionLedger>) -> Self {
        self.handler = self.handler.with_versions(versions);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the apply handler.
    pub fn handler(&self) -> &ApplyHandler {
        &self.handler
    }

    /// Handles an apply request given as raw headers and body.
    ///
    /// Returns the HTTP status and JSON body. This is what the router
    /// calls, and what in-process transports call directly.
    pub fn handle_apply<N: AsRef<str>, V: AsRef<str>>(
        &self,
        headers: &[(N, V)],
        body: &[u8],
    ) -> (u16, Vec<u8>) {
        self.respond(&SignedHeaders::from_pairs(headers), body)
    }

    fn respond(&self, headers: &SignedHeaders, body: &[u8]) -> (u16, Vec<u8>) {
        let result = self
            .handler
            .handle(headers, body)
            .and_then(|response| response.to_json().map_err(ServerError::from));
        match result {
            Ok(json) => (200, json),
            Err(e) => {
                if e.is_server_error() {
                    error!(error = %e, "apply request failed");
                } else {
                    info!(origin = ?headers.origin, error = %e, "apply request refused");
                }
                (e.status_code(), e.to_body())
            }
        }
    }

    /// Builds the axum router.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(APPLY_ROUTE, post(apply))
            .route(HEALTH_ROUTE, get(health))
            .with_state(Arc::clone(self))
    }

    /// Serves the router on `listener` until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener fails.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, server = %self.config.server_id, "receiver listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!(server = %self.config.server_id, "receiver stopped");
        Ok(())
    }
}

async fn apply(State(server): State<Arc<SyncServer>>, headers: HeaderMap, body: Bytes) -> Response {
    let signed = SignedHeaders::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok()));
    let joined = tokio::task::spawn_blocking(move || server.respond(&signed, &body)).await;
    let (status, body) = match joined {
        Ok(reply) => reply,
        Err(e) => {
            let err = ServerError::Internal(format!("apply task failed: {e}"));
            error!(error = %err, "apply request failed");
            (err.status_code(), err.to_body())
        }
    };
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn health(State(server): State<Arc<SyncServer>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "serverId": server.config.server_id.as_str(),
        "stats": server.handler.stats().snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_core::{BuiltinHandlers, ObjectStore, TaskRegistryBuilder};
    use farmsync_protocol::{
        signing, ApplyRequest, ApplyResponse, SequenceId, ServerId, Task, TaskKindId,
    };

    fn server() -> (Arc<SyncServer>, Arc<ObjectStore>) {
        let store = Arc::new(ObjectStore::new());
        let mut builder = TaskRegistryBuilder::new();
        BuiltinHandlers::new(store.clone())
            .register_into(&mut builder)
            .unwrap();
        let config = ServerConfig::new("node-b", "127.0.0.1:0".parse().unwrap())
            .with_trusted_sender("node-a", "shared");
        let server = SyncServer::new(config, Arc::new(builder.seal()), Arc::new(SyncStats::new()));
        (Arc::new(server), store)
    }

    fn delete(seq: u64, key: &str) -> Task {
        Task {
            sequence_id: SequenceId(seq),
            kind: TaskKindId::new("object.delete"),
            object_type: "cms.document".into(),
            target_key: key.into(),
            payload: vec![],
            origin: ServerId::new("node-a"),
            created_at: 1,
            groups: vec![],
            schema_version: 1,
        }
    }

    fn signed(body: &[u8]) -> Vec<(&'static str, String)> {
        let now = farmsync_core::unix_millis();
        vec![
            (signing::ORIGIN_HEADER, "node-a".to_string()),
            (signing::TIMESTAMP_HEADER, now.to_string()),
            (
                signing::SIGNATURE_HEADER,
                signing::sign(b"shared", "node-a", now, body).unwrap(),
            ),
        ]
    }

    #[test]
    fn handle_apply_returns_acks() {
        let (server, _) = server();
        let body = ApplyRequest::new(&[delete(1, "doc:1"), delete(2, "doc:2")])
            .to_json()
            .unwrap();
        let (status, reply) = server.handle_apply(&signed(&body), &body);

        assert_eq!(status, 200);
        let response = ApplyResponse::from_json(&reply).unwrap();
        assert_eq!(response.acked_prefix(), 2);
    }

    #[test]
    fn wrong_signature_is_401() {
        let (server, _) = server();
        let body = ApplyRequest::new(&[delete(1, "doc:1")]).to_json().unwrap();
        let headers = signed(b"something else");
        let (status, reply) = server.handle_apply(&headers, &body);

        assert_eq!(status, 401);
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert!(value["error"].as_str().unwrap().contains("signature"));
    }

    #[tokio::test]
    async fn serves_over_http() {
        let (server, _) = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.serve(listener, async move {
            let _ = stopped.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /farmsync/health HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("\"serverId\":\"node-b\""));

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
