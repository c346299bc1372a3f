//! Users: `_User` entities carrying a username, an email and a password.

use crate::client::Client;
use crate::entity::Entity;
use crate::error::{ClientError, ClientResult};
use nimbus_core::keys::USER_CLASS;

const USERNAME: &str = "username";
const EMAIL: &str = "email";
const PASSWORD: &str = "password";

/// A `_User` entity.
///
/// A new user needs a username and a password before it can be saved.
/// The password is only ever sent, never read back.
#[derive(Debug, Clone)]
pub struct User {
    entity: Entity,
}

impl User {
    /// Creates an unsaved user.
    pub fn new(client: &Client, username: &str, password: &str) -> ClientResult<Self> {
        let user = Self {
            entity: client.object(USER_CLASS)?,
        };
        user.set_username(username)?;
        user.set_password(password)?;
        Ok(user)
    }

    /// Wraps an entity of class `_User`.
    pub fn from_entity(entity: Entity) -> ClientResult<Self> {
        if entity.class_name() != USER_CLASS {
            return Err(ClientError::validation(format!(
                "{} is not a user class",
                entity.class_name()
            )));
        }
        Ok(Self { entity })
    }

    /// The underlying entity.
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Username.
    pub fn username(&self) -> Option<String> {
        self.text(USERNAME)
    }

    /// Sets the username.
    pub fn set_username(&self, username: &str) -> ClientResult<()> {
        if username.trim().is_empty() {
            return Err(ClientError::validation("username must not be empty"));
        }
        self.entity.set(USERNAME, username)
    }

    /// Email address.
    pub fn email(&self) -> Option<String> {
        self.text(EMAIL)
    }

    /// Sets the email address.
    pub fn set_email(&self, email: &str) -> ClientResult<()> {
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                self.entity.set(EMAIL, email)
            }
            _ => Err(ClientError::validation(format!("invalid email address: {email:?}"))),
        }
    }

    /// Sets the password sent with the next save.
    pub fn set_password(&self, password: &str) -> ClientResult<()> {
        if password.is_empty() {
            return Err(ClientError::validation("password must not be empty"));
        }
        self.entity.set(PASSWORD, password)
    }

    fn text(&self, key: &str) -> Option<String> {
        self.entity
            .get(key)
            .and_then(|v| v.as_text().map(str::to_string))
    }

    /// Saves the user.
    pub async fn save(&self) -> ClientResult<()> {
        if self.entity.is_new() {
            if self.username().is_none() {
                return Err(ClientError::validation("new users must have a username"));
            }
            if !self.entity.has(PASSWORD) {
                return Err(ClientError::validation("new users must have a password"));
            }
        }
        self.entity.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::{MockTransport, Response};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Client, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        let client = Client::with_transport(ClientConfig::new("app", "http://localhost"), mock.clone());
        (client, mock)
    }

    #[test]
    fn validates_fields() {
        let (client, _) = setup();
        assert!(User::new(&client, "", "pw").is_err());
        assert!(User::new(&client, "ann", "").is_err());
        let user = User::new(&client, "ann", "pw").unwrap();
        assert!(user.set_email("ann@example.com").is_ok());
        assert!(user.set_email("nope").is_err());
        assert!(user.set_email("@example.com").is_err());
        assert_eq!(user.email().as_deref(), Some("ann@example.com"));
        assert!(User::from_entity(client.object("Team").unwrap()).is_err());
    }

    #[tokio::test]
    async fn save_sends_credentials() {
        let (client, mock) = setup();
        mock.push_response(Response::created(json!({ "objectId": "u1" })));
        let user = User::new(&client, "ann", "secret").unwrap();
        user.save().await.unwrap();

        let request = &mock.requests()[0];
        assert_eq!(request.path, "/classes/_User");
        let body = request.json().unwrap();
        assert_eq!(body["username"], "ann");
        assert_eq!(body["password"], "secret");
        assert_eq!(user.username().as_deref(), Some("ann"));
    }

    #[tokio::test]
    async fn new_users_need_a_password() {
        let (client, mock) = setup();
        let user = User::from_entity(client.object(USER_CLASS).unwrap()).unwrap();
        user.set_username("ann").unwrap();
        assert!(user.save().await.unwrap_err().is_local());
        assert_eq!(mock.request_count(), 0);
    }
}
