//! HTTP transport implementation.
//!
//! [`HttpTransport`] turns a [`Request`] into a concrete HTTP call: it
//! joins the path onto the server URL, moves GET bodies into the query
//! string and attaches the credential headers from [`ClientConfig`].
//! The HTTP library itself sits behind [`HttpClient`], so the CLI can
//! plug in reqwest while tests use [`LoopbackClient`].

use crate::config::ClientConfig;
use crate::error::{ErrorCode, TransportError};
use crate::transport::{Body, Method, Request, Response, Transport};
use async_trait::async_trait;
use nimbus_codec::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the application id.
pub const APPLICATION_ID_HEADER: &str = "X-Parse-Application-Id";
/// Header carrying the REST API key.
pub const REST_KEY_HEADER: &str = "X-Parse-REST-API-Key";
/// Header carrying the session token.
pub const SESSION_TOKEN_HEADER: &str = "X-Parse-Session-Token";

/// A fully resolved HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Headers in sorted order.
    pub headers: BTreeMap<String, String>,
    /// Encoded body.
    pub body: Option<Vec<u8>>,
    /// Timeout for the whole exchange.
    pub timeout: Duration,
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Undecoded body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP library. Errors are
/// failures to complete the exchange (DNS, refused connection, timeout);
/// non-2xx statuses are responses, not errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Performs one exchange.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// REST transport over an [`HttpClient`].
pub struct HttpTransport<C: HttpClient> {
    config: ClientConfig,
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the configured server.
    pub fn new(config: ClientConfig, client: C) -> Self {
        Self { config, client }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.config.server_url
    }

    /// Resolves a request into its HTTP form.
    pub fn prepare(&self, request: Request) -> Result<HttpRequest, TransportError> {
        let mut url = format!("{}{}", self.config.server_url, request.path);
        let mut headers = BTreeMap::new();
        headers.insert(APPLICATION_ID_HEADER.to_string(), self.config.app_id.clone());
        if let Some(key) = &self.config.rest_key {
            headers.insert(REST_KEY_HEADER.to_string(), key.clone());
        }
        if let Some(token) = &self.config.session_token {
            headers.insert(SESSION_TOKEN_HEADER.to_string(), token.clone());
        }

        let body = match (request.method, request.body) {
            (_, None) => None,
            (Method::Get, Some(Body::Json(json))) => {
                let query = encode_query(&json)?;
                if !query.is_empty() {
                    url.push('?');
                    url.push_str(&query);
                }
                None
            }
            (_, Some(Body::Json(json))) => {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
                Some(
                    serde_json::to_vec(&json)
                        .map_err(|e| TransportError::new(format!("failed to encode body: {e}")))?,
                )
            }
            (_, Some(Body::Bytes { content_type, data })) => {
                headers.insert("Content-Type".to_string(), content_type);
                Some(data)
            }
        };
        headers.extend(request.headers);

        Ok(HttpRequest {
            method: request.method,
            url,
            headers,
            body,
            timeout: self.config.timeout,
        })
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let http = self.prepare(request)?;
        let method = http.method;
        debug!(method = %method, url = %http.url, "sending request");
        let response = self.client.send(http).await.map_err(TransportError::new)?;
        debug!(status = response.status, bytes = response.body.len(), "received response");
        Ok(decode_response(response))
    }
}

/// Decodes a raw response. An undecodable body becomes an
/// `InvalidJson` error response so callers see a remote failure.
fn decode_response(response: HttpResponse) -> Response {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Response {
            status: response.status,
            body: Json::Null,
        };
    }
    match serde_json::from_slice(&response.body) {
        Ok(body) => Response {
            status: response.status,
            body,
        },
        Err(err) => {
            warn!(status = response.status, error = %err, "undecodable response body");
            let status = if (200..300).contains(&response.status) {
                500
            } else {
                response.status
            };
            Response::error(
                status,
                i64::from(ErrorCode::InvalidJson.code()),
                format!("invalid JSON in response: {err}"),
            )
        }
    }
}

/// Encodes the top-level entries of a JSON object as a query string.
/// Strings are sent raw; everything else as compact JSON.
fn encode_query(json: &Json) -> Result<String, TransportError> {
    let Json::Object(params) = json else {
        return Err(TransportError::new("GET body must be a JSON object"));
    };
    let pairs: Vec<String> = params
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Json::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&value)
            )
        })
        .collect();
    Ok(pairs.join("&"))
}

/// Query parameters whose values are JSON rather than plain text.
const JSON_PARAMS: &[&str] = &["where", "limit", "skip", "count", "pipeline"];

/// Decodes a query string back into the JSON object it came from.
///
/// Only [`JSON_PARAMS`] are parsed; every other value stays a string.
fn decode_query(query: &str) -> Result<Json, String> {
    let mut params = serde_json::Map::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map_err(|e| e.to_string())?;
        let value = urlencoding::decode(value).map_err(|e| e.to_string())?;
        let value = if JSON_PARAMS.contains(&key.as_ref()) {
            serde_json::from_str::<Json>(&value)
                .map_err(|e| format!("invalid JSON in query parameter {key}: {e}"))?
        } else {
            Json::String(value.into_owned())
        };
        params.insert(key.into_owned(), value);
    }
    Ok(Json::Object(params))
}

/// An HTTP client that hands requests straight to an in-process
/// [`Transport`], undoing what [`HttpTransport`] did to them.
///
/// Useful for exercising the full HTTP path without a network.
pub struct LoopbackClient<T: Transport> {
    base_url: String,
    server: T,
}

impl<T: Transport> LoopbackClient<T> {
    /// Creates a loopback client for requests under `base_url`.
    pub fn new(base_url: impl Into<String>, server: T) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            server,
        }
    }

    /// The wrapped server.
    pub fn server(&self) -> &T {
        &self.server
    }
}

#[async_trait]
impl<T: Transport> HttpClient for LoopbackClient<T> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let rest = request
            .url
            .strip_prefix(&self.base_url)
            .ok_or_else(|| format!("url {} outside {}", request.url, self.base_url))?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut inner = Request::new(request.method, path);
        if !query.is_empty() {
            inner = inner.with_json(decode_query(query)?);
        } else if let Some(body) = request.body {
            let content_type = request
                .headers
                .get("Content-Type")
                .cloned()
                .unwrap_or_default();
            inner = if content_type == "application/json" {
                inner.with_json(serde_json::from_slice(&body).map_err(|e| e.to_string())?)
            } else {
                inner.with_bytes(content_type, body)
            };
        }
        for (name, value) in request.headers {
            inner = inner.with_header(name, value);
        }

        let response = self.server.request(inner).await.map_err(|e| e.message)?;
        let body = match response.body {
            Json::Null => Vec::new(),
            body => serde_json::to_vec(&body).map_err(|e| e.to_string())?,
        };
        Ok(HttpResponse {
            status: response.status,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn config() -> ClientConfig {
        ClientConfig::new("app-1", "https://api.example.com/v1")
            .with_rest_key("rest")
            .with_session_token("r:token")
    }

    struct FixedClient(HttpResponse);

    #[async_trait]
    impl HttpClient for FixedClient {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, String> {
            Ok(self.0.clone())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl HttpClient for FailingClient {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, String> {
            Err("connection refused".into())
        }
    }

    #[test]
    fn prepare_attaches_credentials() {
        let transport = HttpTransport::new(config(), FailingClient);
        let http = transport
            .prepare(Request::new(Method::Put, "/classes/Game/x1").with_json(json!({ "a": 1 })))
            .unwrap();
        assert_eq!(http.url, "https://api.example.com/v1/classes/Game/x1");
        assert_eq!(http.headers[APPLICATION_ID_HEADER], "app-1");
        assert_eq!(http.headers[REST_KEY_HEADER], "rest");
        assert_eq!(http.headers[SESSION_TOKEN_HEADER], "r:token");
        assert_eq!(http.headers["Content-Type"], "application/json");
        assert_eq!(http.body.unwrap(), br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn get_bodies_become_query_parameters() {
        let transport = HttpTransport::new(config(), FailingClient);
        let http = transport
            .prepare(Request::new(Method::Get, "/classes/Game").with_json(json!({
                "where": { "status": "open" },
                "limit": 2,
                "order": "createdAt",
            })))
            .unwrap();
        assert!(http.body.is_none());
        assert_eq!(
            http.url,
            "https://api.example.com/v1/classes/Game?limit=2&order=createdAt&where=%7B%22status%22%3A%22open%22%7D"
        );
    }

    #[test]
    fn query_round_trip() {
        let params = json!({ "where": { "a": [1, 2] }, "keys": "a,b", "count": 1 });
        let encoded = encode_query(&params).unwrap();
        assert_eq!(decode_query(&encoded).unwrap(), params);
    }

    #[test]
    fn text_parameters_stay_text() {
        let params = json!({
            "distinct": "2024",
            "keys": "true",
            "order": "-1",
            "redirectClassNameForKey": "[x]",
            "skip": 3,
        });
        let encoded = encode_query(&params).unwrap();
        assert_eq!(decode_query(&encoded).unwrap(), params);
        assert!(decode_query("where=%7Bbad").is_err());
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let transport = HttpTransport::new(config(), FailingClient);
        let err = transport
            .request(Request::new(Method::Get, "/classes/Game"))
            .await
            .unwrap_err();
        assert!(err.message.contains("refused"));
    }

    #[tokio::test]
    async fn undecodable_body_becomes_invalid_json() {
        let transport = HttpTransport::new(
            config(),
            FixedClient(HttpResponse {
                status: 200,
                body: b"<html>".to_vec(),
            }),
        );
        let response = transport
            .request(Request::new(Method::Get, "/classes/Game"))
            .await
            .unwrap();
        assert!(!response.is_success());
        assert_eq!(response.body["code"], 107);
    }

    #[tokio::test]
    async fn loopback_restores_the_request() {
        let server = Arc::new(MockTransport::new());
        server.push_response(Response::ok(json!({ "results": [] })));
        let loopback = LoopbackClient::new("https://api.example.com/v1", Arc::clone(&server));
        let transport = HttpTransport::new(config(), loopback);

        let request = Request::new(Method::Get, "/classes/Game")
            .with_json(json!({ "where": { "n": { "$gt": 3 } }, "limit": 5 }));
        let response = transport.request(request.clone()).await.unwrap();
        assert_eq!(response.body, json!({ "results": [] }));

        let seen = &server.requests()[0];
        assert_eq!(seen.path, "/classes/Game");
        assert_eq!(seen.json(), request.json());
        assert_eq!(seen.headers[APPLICATION_ID_HEADER], "app-1");
    }
}
