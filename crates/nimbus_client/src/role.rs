//! Roles: named groups of users and other roles, used as ACL subjects.

use crate::client::Client;
use crate::entity::Entity;
use crate::error::{ClientError, ClientResult};
use crate::relation::Relation;
use nimbus_core::keys::ROLE_NAME;
use nimbus_core::Acl;

pub use nimbus_core::keys::{ROLE_CLASS, USER_CLASS};

/// A `_Role` entity.
///
/// The name cannot change once the role is saved, and a role cannot be
/// saved without an ACL.
#[derive(Debug, Clone)]
pub struct Role {
    entity: Entity,
}

impl Role {
    /// Creates an unsaved role.
    pub fn new(client: &Client, name: &str, acl: &Acl) -> ClientResult<Self> {
        let role = Self {
            entity: client.object(ROLE_CLASS)?,
        };
        role.set_name(name)?;
        role.entity.set_acl(acl)?;
        Ok(role)
    }

    /// Wraps an entity of class `_Role`.
    pub fn from_entity(entity: Entity) -> ClientResult<Self> {
        if entity.class_name() != ROLE_CLASS {
            return Err(ClientError::validation(format!(
                "{} is not a role class",
                entity.class_name()
            )));
        }
        Ok(Self { entity })
    }

    /// The underlying entity.
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Role name.
    pub fn name(&self) -> Option<String> {
        self.entity
            .get(ROLE_NAME)
            .and_then(|v| v.as_text().map(str::to_string))
    }

    /// Sets the name. Fails once the role has been saved.
    pub fn set_name(&self, name: &str) -> ClientResult<()> {
        self.entity.set(ROLE_NAME, name)
    }

    /// Replaces the ACL.
    pub fn set_acl(&self, acl: &Acl) -> ClientResult<()> {
        self.entity.set_acl(acl)
    }

    /// Users holding this role.
    pub fn users(&self) -> Relation {
        Relation::new(self.entity.clone(), "users", Some(USER_CLASS.to_string()))
    }

    /// Roles whose members inherit this role.
    pub fn roles(&self) -> Relation {
        Relation::new(self.entity.clone(), "roles", Some(ROLE_CLASS.to_string()))
    }

    /// Saves the role.
    pub async fn save(&self) -> ClientResult<()> {
        if self.entity.get_acl()?.is_none() {
            return Err(ClientError::validation("roles must have an ACL"));
        }
        if self.name().is_none() {
            return Err(ClientError::validation("roles must have a name"));
        }
        self.entity.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use nimbus_core::CoreError;
    use crate::transport::{MockTransport, Response};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Client, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        let client = Client::with_transport(ClientConfig::new("app", "http://localhost"), mock.clone());
        (client, mock)
    }

    fn public_read() -> Acl {
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        acl
    }

    #[test]
    fn validates_names() {
        let (client, _) = setup();
        assert!(Role::new(&client, "Moderators", &public_read()).is_ok());
        assert!(Role::new(&client, "team-a_1 b", &public_read()).is_ok());
        assert!(Role::new(&client, "bad/name", &public_read()).is_err());
        assert!(Role::new(&client, "", &public_read()).is_err());
    }

    #[tokio::test]
    async fn name_is_immutable_after_save() {
        let (client, mock) = setup();
        mock.push_response(Response::created(
            json!({ "objectId": "r1", "createdAt": "2024-01-01T00:00:00.000Z" }),
        ));
        let role = Role::new(&client, "Admins", &public_read()).unwrap();
        role.set_name("Owners").unwrap();
        role.save().await.unwrap();

        let body = mock.requests()[0].json().cloned().unwrap();
        assert_eq!(body["name"], "Owners");
        assert_eq!(body["ACL"], json!({ "*": { "read": true } }));
        assert_eq!(
            role.set_name("Other").unwrap_err(),
            ClientError::Local(CoreError::ImmutableField { field: "name".into() })
        );
    }

    #[tokio::test]
    async fn entity_setters_respect_the_name_rules() {
        let (client, mock) = setup();
        mock.push_response(Response::created(json!({ "objectId": "r1" })));
        let role = Role::new(&client, "Admins", &public_read()).unwrap();
        assert!(role.entity().set("name", "bad/name").unwrap_err().is_local());
        role.save().await.unwrap();

        let immutable = ClientError::Local(CoreError::ImmutableField { field: "name".into() });
        assert_eq!(role.entity().set("name", "Owners").unwrap_err(), immutable);
        assert_eq!(role.entity().unset("name").unwrap_err(), immutable);
        assert_eq!(role.name().as_deref(), Some("Admins"));

        // Other classes may use `name` freely
        let team = client.object("Team").unwrap();
        team.set("name", "bad/name").unwrap();
    }

    #[tokio::test]
    async fn save_requires_acl() {
        let (client, mock) = setup();
        let role = Role::from_entity(client.object(ROLE_CLASS).unwrap()).unwrap();
        role.set_name("Admins").unwrap();
        assert!(role.save().await.unwrap_err().is_local());
        assert_eq!(mock.request_count(), 0);
        assert!(Role::from_entity(client.object("Team").unwrap()).is_err());
    }

    #[test]
    fn relations_have_fixed_targets() {
        let (client, _) = setup();
        let role = Role::new(&client, "Admins", &public_read()).unwrap();
        assert_eq!(role.users().target_class(), Some(USER_CLASS));
        assert_eq!(role.roles().target_class(), Some(ROLE_CLASS));
        assert_eq!(role.users().key(), "users");
    }
}
