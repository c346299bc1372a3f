//! Many-to-many relations stored under an entity key.

use crate::entity::Entity;
use crate::error::{ClientError, ClientResult};
use crate::query::Query;
use nimbus_codec::encode_pointer;
use nimbus_core::{Operation, RelationChange};
use serde_json::json;

/// A relation held by `owner` under `key`.
///
/// Adding and removing targets records a pending relation operation on
/// the owner; nothing is sent until the owner is saved.
#[derive(Debug, Clone)]
pub struct Relation {
    owner: Entity,
    key: String,
    target_class: Option<String>,
}

impl Relation {
    pub(crate) fn new(owner: Entity, key: &str, target_class: Option<String>) -> Self {
        Self {
            owner,
            key: key.to_string(),
            target_class,
        }
    }

    /// Key the relation is stored under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Class of the related entities, once known.
    pub fn target_class(&self) -> Option<&str> {
        self.target_class.as_deref()
    }

    /// The entity holding the relation.
    pub fn owner(&self) -> &Entity {
        &self.owner
    }

    fn change<F>(&mut self, targets: &[&Entity], build: F) -> ClientResult<()>
    where
        F: FnOnce(String, Vec<String>) -> RelationChange,
    {
        let Some(first) = targets.first() else {
            return Ok(());
        };
        let class_name = self
            .target_class
            .clone()
            .unwrap_or_else(|| first.class_name().to_string());
        let mut ids = Vec::with_capacity(targets.len());
        for target in targets {
            if target.class_name() != class_name {
                return Err(ClientError::validation(format!(
                    "relation {} holds {class_name} objects, not {}",
                    self.key,
                    target.class_name()
                )));
            }
            let id = target.id().ok_or_else(|| {
                ClientError::validation(format!(
                    "cannot relate an unsaved {} object",
                    target.class_name()
                ))
            })?;
            ids.push(id);
        }
        let change = build(class_name.clone(), ids);
        self.owner.apply_op(&self.key, Operation::Relation(change))?;
        self.target_class = Some(class_name);
        Ok(())
    }

    /// Links saved entities.
    pub fn add(&mut self, targets: &[&Entity]) -> ClientResult<()> {
        self.change(targets, |class, ids| RelationChange::add(class, ids))
    }

    /// Unlinks saved entities.
    pub fn remove(&mut self, targets: &[&Entity]) -> ClientResult<()> {
        self.change(targets, |class, ids| RelationChange::remove(class, ids))
    }

    /// Query over the related entities.
    ///
    /// The owner must be saved. When the target class is not known yet
    /// the query asks the server to resolve it from the relation key.
    pub fn query(&self) -> ClientResult<Query> {
        let owner = self.owner.to_pointer()?;
        let related = json!({ "object": encode_pointer(&owner), "key": self.key });
        let client = self.owner.client_handle();
        Ok(match &self.target_class {
            Some(class_name) => client.query(class_name).related_to_json(related),
            None => client
                .query(owner.class_name.as_str())
                .related_to_json(related)
                .redirect_class_name_for_key(&self.key),
        })
    }
}
