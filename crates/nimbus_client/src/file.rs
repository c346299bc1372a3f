//! File references.

use crate::client::{invalid_response, Client};
use crate::error::{ClientError, ClientResult};
use crate::transport::{Method, Request};
use nimbus_codec::{FileDescriptor, Json, Value};
use tracing::info;

/// Content type used when none is given.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A file stored by the server, or local bytes waiting to be uploaded.
///
/// Before [`FileRef::save`] succeeds the reference holds only local
/// bytes; afterwards its name and URL are the server's and never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    name: String,
    url: Option<String>,
    data: Option<Vec<u8>>,
    content_type: String,
}

impl FileRef {
    /// Creates an unsaved file.
    ///
    /// # Errors
    ///
    /// The name must start with an ASCII letter or digit and contain only
    /// letters, digits, `.`, ` `, `_` and `-`.
    pub fn new(name: &str, data: Vec<u8>, content_type: Option<&str>) -> ClientResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            url: None,
            data: Some(data),
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
        })
    }

    /// Reference to a file already on the server, e.g. read from an
    /// attribute.
    pub fn from_descriptor(descriptor: &FileDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            url: descriptor.url.clone(),
            data: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    /// File name; the server's name once saved.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Download URL, once saved.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Local bytes, if any.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// MIME type sent with the upload.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns true once the server has stored the file.
    pub fn is_saved(&self) -> bool {
        self.url.is_some()
    }

    /// Uploads the bytes. Saving a saved file does nothing.
    pub async fn save(&mut self, client: &Client) -> ClientResult<()> {
        if self.is_saved() {
            return Ok(());
        }
        let data = self
            .data
            .clone()
            .ok_or_else(|| ClientError::validation(format!("file {} has no data", self.name)))?;
        let path = format!("/files/{}", urlencoding::encode(&self.name));
        let body = client
            .send(Request::new(Method::Post, path).with_bytes(self.content_type.clone(), data))
            .await?;
        let name = body.get("name").and_then(Json::as_str);
        let url = body.get("url").and_then(Json::as_str);
        match (name, url) {
            (Some(name), Some(url)) => {
                self.name = name.to_string();
                self.url = Some(url.to_string());
                info!(name = %self.name, "file saved");
                Ok(())
            }
            _ => Err(invalid_response("file upload response lacks name or url")),
        }
    }

    /// Attribute value referring to this file.
    pub fn to_value(&self) -> Value {
        Value::File(FileDescriptor {
            name: self.name.clone(),
            url: self.url.clone(),
        })
    }
}

impl From<&FileRef> for Value {
    fn from(file: &FileRef) -> Self {
        file.to_value()
    }
}

fn validate_name(name: &str) -> ClientResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ' ' | '_' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ClientError::validation(format!("invalid file name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::{Body, MockTransport, Response};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn validates_names() {
        assert!(FileRef::new("photo 1.png", vec![], None).is_ok());
        assert!(FileRef::new("a-b_c.txt", vec![], Some("text/plain")).is_ok());
        for bad in ["", ".hidden", "a/b", "x?.png"] {
            assert!(FileRef::new(bad, vec![], None).unwrap_err().is_local(), "{bad}");
        }
    }

    #[tokio::test]
    async fn save_uploads_once() {
        let mock = Arc::new(MockTransport::new());
        let client = Client::with_transport(ClientConfig::new("app", "http://localhost"), mock.clone());
        mock.push_response(Response::created(json!({
            "name": "abc_photo 1.png",
            "url": "http://files.local/abc_photo%201.png",
        })));

        let mut file = FileRef::new("photo 1.png", b"png".to_vec(), Some("image/png")).unwrap();
        assert_eq!(file.to_value(), Value::File(FileDescriptor { name: "photo 1.png".into(), url: None }));
        file.save(&client).await.unwrap();
        file.save(&client).await.unwrap();

        assert!(file.is_saved());
        assert_eq!(file.name(), "abc_photo 1.png");
        assert_eq!(mock.request_count(), 1);
        let request = &mock.requests()[0];
        assert_eq!(request.path, "/files/photo%201.png");
        assert_eq!(
            request.body,
            Some(Body::Bytes {
                content_type: "image/png".into(),
                data: b"png".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn stored_files_are_saved_references() {
        let mock = Arc::new(MockTransport::new());
        let client = Client::with_transport(ClientConfig::new("app", "http://localhost"), mock.clone());
        let descriptor = FileDescriptor {
            name: "abc_me.png".into(),
            url: Some("http://files.local/abc_me.png".into()),
        };
        let mut file = FileRef::from_descriptor(&descriptor);
        assert!(file.is_saved());
        assert_eq!(file.data(), None);
        assert_eq!(file.content_type(), DEFAULT_CONTENT_TYPE);
        assert_eq!(file.to_value(), Value::File(descriptor));

        file.save(&client).await.unwrap();
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn bad_upload_response() {
        let mock = Arc::new(MockTransport::new());
        let client = Client::with_transport(ClientConfig::new("app", "http://localhost"), mock.clone());
        mock.push_response(Response::created(json!({ "name": "x" })));
        let mut file = FileRef::new("x", vec![1], None).unwrap();
        assert!(file.save(&client).await.is_err());
        assert!(!file.is_saved());
    }
}
