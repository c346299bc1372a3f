//! Client context shared by every entity and query.

use crate::config::ClientConfig;
use crate::entity::Entity;
use crate::error::{ClientError, ClientResult, ErrorBody, ErrorCode};
use crate::query::Query;
use crate::transport::{Request, Response, Transport};
use nimbus_codec::Json;
use nimbus_core::{ClassRegistry, ClassSpec};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    registry: ClassRegistry,
}

/// Entry point: configuration, transport and class registry.
///
/// Cloning is cheap and every clone talks through the same transport.
/// Separate `Client` values are fully isolated from each other.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client over `transport`.
    pub fn new(config: ClientConfig, transport: impl Transport + 'static) -> Self {
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates a client over an already shared transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                registry: ClassRegistry::new(),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the class registry.
    pub fn registry(&self) -> &ClassRegistry {
        &self.inner.registry
    }

    /// Registers a class.
    pub fn register(&self, spec: ClassSpec) {
        self.inner.registry.register(spec);
    }

    /// Creates a new, unsaved entity of `class_name`, with the class
    /// defaults applied.
    pub fn object(&self, class_name: &str) -> ClientResult<Entity> {
        Entity::create(self, class_name)
    }

    /// Creates a reference to an existing record. Only its identity is
    /// known until it is fetched.
    pub fn object_with_id(&self, class_name: &str, id: &str) -> ClientResult<Entity> {
        Entity::with_id(self, class_name, id)
    }

    /// Starts a query over `class_name`.
    pub fn query(&self, class_name: &str) -> Query {
        Query::new(self.clone(), class_name)
    }

    /// Saves entities one after another, stopping at the first error.
    pub async fn save_all(&self, entities: &[Entity]) -> ClientResult<()> {
        for entity in entities {
            entity.save().await?;
        }
        Ok(())
    }

    /// Fetches entities one after another, stopping at the first error.
    pub async fn fetch_all(&self, entities: &[Entity]) -> ClientResult<()> {
        for entity in entities {
            entity.fetch().await?;
        }
        Ok(())
    }

    /// Fetches the entities whose data is not loaded yet, one after
    /// another, stopping at the first error.
    pub async fn fetch_all_if_needed(&self, entities: &[Entity]) -> ClientResult<()> {
        for entity in entities.iter().filter(|e| !e.is_data_available()) {
            entity.fetch().await?;
        }
        Ok(())
    }

    /// Destroys entities one after another, stopping at the first error.
    pub async fn destroy_all(&self, entities: &[Entity]) -> ClientResult<()> {
        for entity in entities {
            entity.destroy().await?;
        }
        Ok(())
    }

    /// Sends a request and returns the body of a successful response.
    pub(crate) async fn send(&self, request: Request) -> ClientResult<Json> {
        let method = request.method;
        let path = request.path.clone();
        let response = self.inner.transport.request(request).await.map_err(|e| {
            warn!(method = %method, path = %path, error = %e, "transport failure");
            ClientError::from(e)
        })?;
        if response.is_success() {
            debug!(method = %method, path = %path, status = response.status, "request succeeded");
            Ok(response.body)
        } else {
            let err = remote_error(response);
            debug!(method = %method, path = %path, error = %err, "request rejected");
            Err(err)
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("app_id", &self.inner.config.app_id)
            .field("server_url", &self.inner.config.server_url)
            .finish_non_exhaustive()
    }
}

fn remote_error(response: Response) -> ClientError {
    let status = response.status;
    match serde_json::from_value::<ErrorBody>(response.body) {
        Ok(body) => {
            let code = match ErrorCode::from_code(body.code) {
                ErrorCode::OtherCause if status == 404 => ErrorCode::ObjectNotFound,
                code => code,
            };
            let message = if body.error.is_empty() {
                format!("request failed with status {status}")
            } else {
                body.error
            };
            ClientError::remote(code, message)
        }
        Err(_) => ClientError::remote(
            if status == 404 {
                ErrorCode::ObjectNotFound
            } else {
                ErrorCode::OtherCause
            },
            format!("request failed with status {status}"),
        ),
    }
}

/// Error for a successful response whose body has the wrong shape.
pub(crate) fn invalid_response(message: impl fmt::Display) -> ClientError {
    ClientError::remote(ErrorCode::InvalidJson, format!("unexpected response: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Method, MockTransport};
    use serde_json::json;

    fn client(mock: Arc<MockTransport>) -> Client {
        Client::with_transport(ClientConfig::new("app", "http://localhost"), mock)
    }

    #[tokio::test]
    async fn decodes_error_bodies() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(Response::error(400, 137, "duplicate value"));
        let err = client(mock)
            .send(Request::new(Method::Post, "/classes/Game"))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::remote(ErrorCode::DuplicateValue, "duplicate value"));
    }

    #[tokio::test]
    async fn unknown_codes_become_other_cause() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response(Response::error(500, 4242, "odd"));
        mock.push_response(Response {
            status: 404,
            body: json!("nope"),
        });
        let client = client(mock);
        let err = client
            .send(Request::new(Method::Get, "/classes/Game"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OtherCause));
        let err = client
            .send(Request::new(Method::Get, "/classes/Game/x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ObjectNotFound));
    }

    #[tokio::test]
    async fn clients_are_isolated() {
        let a = client(Arc::new(MockTransport::new()));
        let b = client(Arc::new(MockTransport::new()));
        a.register(ClassSpec::new("Game").unwrap());
        assert!(a.registry().contains("Game"));
        assert!(!b.registry().contains("Game"));
        assert!(a.clone().registry().contains("Game"));
    }
}
