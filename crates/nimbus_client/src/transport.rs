//! Transport layer abstraction.
//!
//! Entities and queries describe requests as method + path + JSON body;
//! a [`Transport`] delivers them. The transport owns credentials and
//! the base URL, so nothing above this layer handles either.

use crate::error::TransportError;
use async_trait::async_trait;
use nimbus_codec::Json;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read.
    Get,
    /// Create (or run an aggregate / file upload).
    Post,
    /// Update.
    Put,
    /// Delete.
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// JSON document. For GET requests its top-level entries become
    /// query parameters.
    Json(Json),
    /// Raw bytes (file uploads).
    Bytes {
        /// MIME type of the content.
        content_type: String,
        /// Content.
        data: Vec<u8>,
    },
}

impl Body {
    /// The JSON document, if this is a JSON body.
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Body::Json(json) => Some(json),
            Body::Bytes { .. } => None,
        }
    }
}

/// A request to the REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Path below the server URL, starting with `/`.
    pub path: String,
    /// Optional payload.
    pub body: Option<Body>,
    /// Extra headers for this request only.
    pub headers: BTreeMap<String, String>,
}

impl Request {
    /// Creates a request without a body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    /// Attaches a JSON body.
    pub fn with_json(mut self, json: Json) -> Self {
        self.body = Some(Body::Json(json));
        self
    }

    /// Attaches a raw body.
    pub fn with_bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = Some(Body::Bytes {
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The JSON body, if any.
    pub fn json(&self) -> Option<&Json> {
        self.body.as_ref().and_then(Body::as_json)
    }
}

/// A response from the REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Decoded JSON body (`Null` when empty).
    pub body: Json,
}

impl Response {
    /// A 200 response.
    pub fn ok(body: Json) -> Self {
        Self { status: 200, body }
    }

    /// A 201 response.
    pub fn created(body: Json) -> Self {
        Self { status: 201, body }
    }

    /// An error response with the server's `{code, error}` body.
    pub fn error(status: u16, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "code": code, "error": message.into() }),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Delivers requests to the REST API.
///
/// Implementations must be safe for concurrent use; one transport is
/// shared by every entity and query of a client. Implementations do
/// not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request.
    async fn request(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        (**self).request(request).await
    }
}

/// A scripted transport for tests.
///
/// Responses are returned in the order they were queued; every request
/// is recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<Response, TransportError>>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    /// Creates a mock with no queued responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: Response) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: TransportError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::new("no mock response queued")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_replays_in_order() {
        let transport = MockTransport::new();
        transport.push_response(Response::ok(json!({ "n": 1 })));
        transport.push_error(TransportError::new("down"));

        let first = transport
            .request(Request::new(Method::Get, "/classes/A"))
            .await
            .unwrap();
        assert_eq!(first.body["n"], 1);
        assert!(transport
            .request(Request::new(Method::Get, "/classes/B"))
            .await
            .is_err());
        assert!(transport
            .request(Request::new(Method::Get, "/classes/C"))
            .await
            .is_err());
        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.requests()[1].path, "/classes/B");
    }

    #[test]
    fn request_builder() {
        let request = Request::new(Method::Post, "/files/a.txt")
            .with_bytes("text/plain", b"hi".to_vec())
            .with_header("X-Test", "1");
        assert!(request.json().is_none());
        assert_eq!(request.headers["X-Test"], "1");
        assert_eq!(Method::Post.to_string(), "POST");
    }

    #[test]
    fn response_status() {
        assert!(Response::created(Json::Null).is_success());
        let err = Response::error(404, 101, "missing");
        assert!(!err.is_success());
        assert_eq!(err.body["code"], 101);
    }
}
