//! HTTP transport.
//!
//! Requests go to `POST {base_url}/farmsync/apply` as JSON, signed with the
//! target's shared token. The HTTP client itself is abstracted so the same
//! transport runs over reqwest in production and over a loopback to an
//! in-process receiver in tests.

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;
use async_trait::async_trait;
use farmsync_core::{unix_millis, DeliveryTarget};
use farmsync_protocol::signing::{self, ORIGIN_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use farmsync_protocol::{ApplyRequest, ApplyResponse, ServerId};
use std::time::Duration;
use tracing::debug;

/// Path of the apply endpoint.
pub const APPLY_PATH: &str = "/farmsync/apply";

/// Raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request. `Err` means no response was received.
    async fn post(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String>;
}

/// HTTP-based delivery transport.
pub struct HttpTransport<C: HttpClient> {
    origin: ServerId,
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport that signs requests as `origin`.
    pub fn new(origin: impl Into<ServerId>, client: C) -> Self {
        Self {
            origin: origin.into(),
            client,
        }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn send(
        &self,
        target: &DeliveryTarget,
        request: &ApplyRequest,
    ) -> EngineResult<ApplyResponse> {
        let body = request.to_json()?;
        let timestamp = unix_millis();
        let signature = signing::sign(
            target.token.as_bytes(),
            self.origin.as_str(),
            timestamp,
            &body,
        )?;
        let headers = [
            (ORIGIN_HEADER, self.origin.to_string()),
            (TIMESTAMP_HEADER, timestamp.to_string()),
            (SIGNATURE_HEADER, signature),
        ];

        let url = format!("{}{}", target.base_url.trim_end_matches('/'), APPLY_PATH);
        debug!(%url, batch = %request.batch_id, tasks = request.tasks.len(), "posting batch");
        let response = self
            .client
            .post(&url, &headers, body)
            .await
            .map_err(EngineError::transport_retryable)?;

        if !(200..300).contains(&response.status) {
            return Err(EngineError::Rejected {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(ApplyResponse::from_json(&response.body)?)
    }
}

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::transport_fatal(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request.
    fn handle_post(&self, path: &str, headers: &[(&'static str, String)], body: &[u8])
        -> HttpResponse;
}

/// An HTTP client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client connected to `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String> {
        let path = url.find("/farmsync/").map_or(url, |i| &url[i..]);
        Ok(self.server.handle_post(path, headers, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_protocol::{SequenceId, Task, TaskAck, TaskKindId};
    use parking_lot::Mutex;

    struct Recording {
        status: u16,
        seen: Mutex<Vec<(String, Vec<(&'static str, String)>)>>,
    }

    impl LoopbackServer for Recording {
        fn handle_post(
            &self,
            path: &str,
            headers: &[(&'static str, String)],
            body: &[u8],
        ) -> HttpResponse {
            self.seen.lock().push((path.to_string(), headers.to_vec()));
            let request = ApplyRequest::from_json(body).unwrap();
            let acks = request
                .tasks
                .iter()
                .map(|t| TaskAck::ack(SequenceId(t.sequence_id)))
                .collect();
            HttpResponse {
                status: self.status,
                body: ApplyResponse { acks }.to_json().unwrap(),
            }
        }
    }

    fn request() -> ApplyRequest {
        let task = Task {
            sequence_id: SequenceId(3),
            kind: TaskKindId::new("object.delete"),
            object_type: "cms.document".into(),
            target_key: "doc:5".into(),
            payload: Vec::new(),
            origin: "node-1".into(),
            created_at: 1,
            groups: Vec::new(),
            schema_version: 1,
        };
        ApplyRequest::new([&task])
    }

    fn transport(status: u16) -> HttpTransport<LoopbackClient<Recording>> {
        HttpTransport::new(
            "node-1",
            LoopbackClient::new(Recording {
                status,
                seen: Mutex::new(Vec::new()),
            }),
        )
    }

    #[tokio::test]
    async fn requests_are_signed_and_routed() {
        let transport = transport(200);
        let target = DeliveryTarget::farm("node-2", "http://node-2:8080/", "secret");

        let response = transport.send(&target, &request()).await.unwrap();
        assert_eq!(response.acked_prefix(), 1);

        let seen = transport.client().server().seen.lock();
        let (path, headers) = &seen[0];
        assert_eq!(path, APPLY_PATH);
        let names: Vec<_> = headers.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, [ORIGIN_HEADER, TIMESTAMP_HEADER, SIGNATURE_HEADER]);
        assert_eq!(headers[0].1, "node-1");
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let transport = transport(401);
        let target = DeliveryTarget::farm("node-2", "http://node-2", "secret");

        let err = transport.send(&target, &request()).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected { status: 401, .. }));
        assert!(!err.is_retryable());
    }
}
