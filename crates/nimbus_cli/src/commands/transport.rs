//! reqwest-backed HTTP client.

use async_trait::async_trait;
use nimbus_client::{HttpClient, HttpRequest, HttpResponse, Method};

/// [`HttpClient`] over a shared `reqwest::Client`.
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with its own connection pool.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            inner: reqwest::Client::builder().build()?,
        })
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let mut builder = self
            .inner
            .request(method(request.method), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_methods() {
        assert_eq!(method(Method::Get), reqwest::Method::GET);
        assert_eq!(method(Method::Delete), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn unreachable_server_is_an_exchange_error() {
        let client = ReqwestClient::new().unwrap();
        let request = HttpRequest {
            method: Method::Get,
            url: "http://127.0.0.1:9/classes/Ticket".into(),
            headers: Default::default(),
            body: None,
            timeout: std::time::Duration::from_secs(2),
        };
        assert!(client.send(request).await.is_err());
    }
}
