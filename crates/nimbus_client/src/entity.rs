//! Entity controller.
//!
//! An [`Entity`] is a handle to one record: its attribute store, its
//! operation log and its lifecycle state. Handles are cheap to clone and
//! every clone sees the same entity.
//!
//! ## Lifecycle
//!
//! ```text
//! New ──save──► Saving ──► Saved ──save──► Saving ──► Saved
//!  │                         │
//!  └──────destroy────────────┴──► Destroying ──► Destroyed (terminal)
//! ```
//!
//! A failed save or destroy returns to the state it started from.
//!
//! ## Saves
//!
//! Each `save()` freezes the pending operations when it is called, then
//! waits for the entity's save lane. Saves therefore go out one at a
//! time and each carries only the operations recorded before it was
//! called. A failed save puts its operations back under anything
//! recorded since, so the next save sends both.

use crate::client::{invalid_response, Client};
use crate::error::{ClientError, ClientResult};
use crate::events::{EntityEvent, EntityEvents, EventSink};
use crate::relation::Relation;
use crate::transport::{Method, Request};
use chrono::{DateTime, Utc};
use nimbus_codec::{decode_date, from_wire, format_iso, to_wire, CodecResult, Json, Pointer, Value};
use nimbus_core::keys::{self, validate_class_name, validate_writable_key};
use nimbus_core::{
    compile_set, Acl, AttributeStore, CoreError, CoreResult, Operation, OperationLog, OperationSet,
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Map;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Never persisted.
    New,
    /// A save is in flight.
    Saving,
    /// Persisted, possibly with local changes.
    Saved,
    /// A destroy is in flight.
    Destroying,
    /// Destroyed; accepts no further changes.
    Destroyed,
}

struct Shared {
    client: Client,
    class_name: String,
    cid: String,
    state: Mutex<Inner>,
    save_lane: tokio::sync::Mutex<()>,
    events: EventSink,
}

struct Inner {
    id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    attributes: AttributeStore,
    log: OperationLog,
    state: EntityState,
    saves_in_flight: usize,
    existed: bool,
    has_data: bool,
}

impl Inner {
    fn ensure_alive(&self, class_name: &str) -> CoreResult<()> {
        if self.state == EntityState::Destroyed {
            return Err(CoreError::Destroyed {
                class_name: class_name.to_string(),
            });
        }
        Ok(())
    }

    /// Recomputes the resting state after a save or destroy settles.
    fn settle_state(&mut self) {
        if matches!(self.state, EntityState::Destroying | EntityState::Destroyed) {
            return;
        }
        self.state = if self.saves_in_flight > 0 {
            EntityState::Saving
        } else if self.id.is_some() {
            EntityState::Saved
        } else {
            EntityState::New
        };
    }

    /// Folds a server-confirmed value into the store. Keys with local
    /// changes keep them, recomputed over the confirmed value.
    fn merge_confirmed(&mut self, key: &str, confirmed: Option<Value>) {
        let in_flight = self.log.is_in_flight(key);
        match self.log.pending(key) {
            None if !in_flight => self.attributes.commit(key, confirmed),
            Some(op) if !in_flight => {
                let estimate = op
                    .apply(key, confirmed.as_ref())
                    .unwrap_or_else(|_| self.attributes.get(key).cloned());
                self.attributes.rebase(key, confirmed, estimate);
            }
            _ => {
                let current = self.attributes.get(key).cloned();
                self.attributes.rebase(key, confirmed, current);
            }
        }
    }

    fn restore_batch(&mut self, batch: OperationSet) {
        let keys: Vec<String> = batch.keys().cloned().collect();
        let Inner {
            log, attributes, ..
        } = self;
        log.restore(batch, |key| attributes.get(key).cloned());
        for key in keys {
            if self.log.pending(&key).is_some() {
                self.attributes.mark_dirty(&key);
            }
        }
        self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
        self.settle_state();
    }
}

/// A server record decoded in full before any state is touched.
#[derive(Debug, Default)]
pub(crate) struct Record {
    pub(crate) id: Option<String>,
    pub(crate) created_at: Option<DateTime<Utc>>,
    pub(crate) updated_at: Option<DateTime<Utc>>,
    pub(crate) attributes: BTreeMap<String, Value>,
}

impl Record {
    pub(crate) fn decode(json: &Json) -> CodecResult<Self> {
        let map = json
            .as_object()
            .ok_or_else(|| nimbus_codec::CodecError::invalid_structure("record must be an object"))?;
        Self::decode_map(map)
    }

    pub(crate) fn decode_map(map: &Map<String, Json>) -> CodecResult<Self> {
        let mut record = Record::default();
        for (key, value) in map {
            match key.as_str() {
                keys::OBJECT_ID => {
                    record.id = Some(
                        value
                            .as_str()
                            .ok_or_else(|| {
                                nimbus_codec::CodecError::invalid_structure("objectId must be text")
                            })?
                            .to_string(),
                    );
                }
                keys::CREATED_AT => record.created_at = Some(decode_date(value)?),
                keys::UPDATED_AT => record.updated_at = Some(decode_date(value)?),
                keys::CLASS_NAME | "__type" => {}
                _ => {
                    record.attributes.insert(key.clone(), from_wire(value)?);
                }
            }
        }
        Ok(record)
    }
}

/// Releases a frozen batch if the save future is dropped before it
/// settles.
struct InFlightSave<'a> {
    entity: &'a Entity,
    batch: Option<OperationSet>,
}

impl InFlightSave<'_> {
    fn batch(&self) -> Option<&OperationSet> {
        self.batch.as_ref()
    }

    fn take(&mut self) -> Option<OperationSet> {
        self.batch.take()
    }
}

impl Drop for InFlightSave<'_> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            debug!(class = %self.entity.shared.class_name, "save abandoned; restoring operations");
            self.entity.lock().restore_batch(batch);
        }
    }
}

/// Returns a destroy to its prior state if the future is dropped.
struct InFlightDestroy<'a> {
    entity: &'a Entity,
    done: bool,
}

impl Drop for InFlightDestroy<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut inner = self.entity.lock();
            if inner.state == EntityState::Destroying {
                inner.state = EntityState::Saved;
                inner.settle_state();
            }
        }
    }
}

/// A handle to one record.
#[derive(Clone)]
pub struct Entity {
    shared: Arc<Shared>,
}

impl Entity {
    fn build(client: &Client, class_name: &str, inner: Inner) -> ClientResult<Self> {
        validate_class_name(class_name)?;
        Ok(Self {
            shared: Arc::new(Shared {
                client: client.clone(),
                class_name: class_name.to_string(),
                cid: Uuid::new_v4().to_string(),
                state: Mutex::new(inner),
                save_lane: tokio::sync::Mutex::new(()),
                events: EventSink::new(),
            }),
        })
    }

    fn blank(id: Option<String>, attributes: AttributeStore, existed: bool) -> Inner {
        let has_data = existed || id.is_none();
        let state = if id.is_some() {
            EntityState::Saved
        } else {
            EntityState::New
        };
        Inner {
            id,
            created_at: None,
            updated_at: None,
            attributes,
            log: OperationLog::new(),
            state,
            saves_in_flight: 0,
            existed,
            has_data,
        }
    }

    pub(crate) fn create(client: &Client, class_name: &str) -> ClientResult<Self> {
        let entity = Self::build(client, class_name, Self::blank(None, AttributeStore::new(), false))?;
        if let Some(spec) = client.registry().get(class_name) {
            let mut inner = entity.lock();
            for (key, value) in spec.defaults() {
                inner.log.record(key, Operation::Set(value.clone()))?;
                inner.attributes.set(key, value.clone());
            }
        }
        Ok(entity)
    }

    pub(crate) fn with_id(client: &Client, class_name: &str, id: &str) -> ClientResult<Self> {
        if id.is_empty() {
            return Err(ClientError::validation("object id must not be empty"));
        }
        Self::build(
            client,
            class_name,
            Self::blank(Some(id.to_string()), AttributeStore::new(), false),
        )
    }

    pub(crate) fn materialize(client: &Client, class_name: &str, record: Record) -> ClientResult<Self> {
        let mut inner = Self::blank(record.id, AttributeStore::from_clean(record.attributes), true);
        inner.created_at = record.created_at;
        inner.updated_at = record.updated_at.or(record.created_at);
        Self::build(client, class_name, inner)
    }

    /// Materializes an entity from a plain JSON record, all attributes
    /// clean.
    pub fn from_json(client: &Client, class_name: &str, json: &Json) -> ClientResult<Self> {
        let record = Record::decode(json)?;
        Self::materialize(client, class_name, record)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.state.lock()
    }

    fn client(&self) -> &Client {
        &self.shared.client
    }

    pub(crate) fn client_handle(&self) -> Client {
        self.shared.client.clone()
    }

    fn path(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("/classes/{}/{}", self.shared.class_name, id),
            None => format!("/classes/{}", self.shared.class_name),
        }
    }

    fn edit<F>(&self, key: &str, f: F) -> ClientResult<()>
    where
        F: FnOnce(&mut Inner) -> CoreResult<()>,
    {
        {
            let mut inner = self.lock();
            inner.ensure_alive(&self.shared.class_name)?;
            f(&mut inner)?;
        }
        self.shared.events.emit(EntityEvent::Changed {
            key: key.to_string(),
        });
        Ok(())
    }

    fn check_value(&self, key: &str, value: &Value) -> CoreResult<()> {
        validate_writable_key(key)?;
        to_wire(value)?;
        self.client()
            .registry()
            .check(&self.shared.class_name, key, value)
    }

    /// Class-specific rules: a role's name must be valid and cannot
    /// change once the role is saved.
    fn check_class_rules(&self, inner: &Inner, key: &str, value: Option<&Value>) -> CoreResult<()> {
        if self.shared.class_name != keys::ROLE_CLASS || key != keys::ROLE_NAME {
            return Ok(());
        }
        if inner.id.is_some() {
            return Err(CoreError::ImmutableField {
                field: key.to_string(),
            });
        }
        match value.and_then(Value::as_text) {
            Some(name) => keys::validate_role_name(name),
            None => Err(CoreError::validation("role name must be text")),
        }
    }

    /// Records a non-Set operation and updates the local estimate.
    pub(crate) fn apply_op(&self, key: &str, op: Operation) -> ClientResult<()> {
        self.edit(key, |inner| {
            validate_writable_key(key)?;
            let estimate = op.apply(key, inner.attributes.get(key))?;
            if let Some(value) = &estimate {
                self.check_value(key, value)?;
            }
            self.check_class_rules(inner, key, estimate.as_ref())?;
            inner.log.record(key, op)?;
            if inner.log.pending(key).is_some() {
                inner.attributes.put(key, estimate);
                inner.attributes.mark_dirty(key);
            } else if inner.log.is_in_flight(key) {
                inner.attributes.put(key, estimate);
            } else {
                inner.attributes.revert(key);
            }
            Ok(())
        })
    }

    /// Sets an attribute.
    ///
    /// Reserved keys (`objectId`, `createdAt`, `updatedAt`, `ACL`) are
    /// rejected; use [`Entity::set_acl`] for the ACL.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> ClientResult<()> {
        let value = value.into();
        self.edit(key, |inner| {
            self.check_value(key, &value)?;
            self.check_class_rules(inner, key, Some(&value))?;
            inner.log.record(key, Operation::Set(value.clone()))?;
            if !inner.attributes.set(key, value) && !inner.log.is_in_flight(key) {
                inner.log.discard(key);
            }
            Ok(())
        })
    }

    /// Removes an attribute.
    pub fn unset(&self, key: &str) -> ClientResult<()> {
        self.edit(key, |inner| {
            validate_writable_key(key)?;
            self.check_class_rules(inner, key, None)?;
            inner.log.record(key, Operation::Unset)?;
            if !inner.attributes.unset(key) && !inner.log.is_in_flight(key) {
                inner.log.discard(key);
            }
            Ok(())
        })
    }

    /// Adds `amount` to a numeric attribute (an absent key counts as 0).
    pub fn increment(&self, key: &str, amount: impl Into<Value>) -> ClientResult<()> {
        self.apply_op(key, Operation::increment(amount)?)
    }

    /// Appends values to an array attribute.
    pub fn add<I, V>(&self, key: &str, values: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.apply_op(key, Operation::Add(values.into_iter().map(Into::into).collect()))
    }

    /// Appends values not already present in an array attribute.
    pub fn add_unique<I, V>(&self, key: &str, values: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.apply_op(
            key,
            Operation::AddUnique(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Removes every occurrence of the values from an array attribute.
    pub fn remove<I, V>(&self, key: &str, values: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.apply_op(key, Operation::Remove(values.into_iter().map(Into::into).collect()))
    }

    /// Replaces the ACL. The `ACL` key is marked dirty even when the
    /// new list equals the old one.
    pub fn set_acl(&self, acl: &Acl) -> ClientResult<()> {
        let value = acl.to_value();
        self.edit(keys::ACL, |inner| {
            inner.log.record(keys::ACL, Operation::Set(value.clone()))?;
            inner.attributes.set(keys::ACL, value);
            inner.attributes.mark_dirty(keys::ACL);
            Ok(())
        })
    }

    /// The current ACL, if one is set.
    pub fn get_acl(&self) -> ClientResult<Option<Acl>> {
        let value = self.lock().attributes.get(keys::ACL).cloned();
        match value {
            Some(value) if !value.is_null() => Ok(Some(Acl::from_value(&value)?)),
            _ => Ok(None),
        }
    }

    /// Current value of an attribute.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().attributes.get(key).cloned()
    }

    /// Returns true if the attribute holds a non-null value.
    pub fn has(&self, key: &str) -> bool {
        self.lock().attributes.has(key)
    }

    /// All current attributes.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.lock().attributes.attributes().clone()
    }

    /// Resolves a pointer or included record under `key` to an entity.
    ///
    /// Pointers yield an unfetched reference; records included by the
    /// query (`include`) yield a fully materialized entity.
    pub fn get_entity(&self, key: &str) -> ClientResult<Option<Entity>> {
        match self.get(key) {
            Some(Value::Pointer(pointer)) => Ok(Some(Entity::with_id(
                self.client(),
                &pointer.class_name,
                &pointer.object_id,
            )?)),
            Some(value @ Value::Object(_)) => {
                let Some(class_name) = value.get(keys::CLASS_NAME).and_then(Value::as_text) else {
                    return Ok(None);
                };
                let class_name = class_name.to_string();
                let record = Record::decode(&to_wire(&value)?)?;
                Ok(Some(Entity::materialize(self.client(), &class_name, record)?))
            }
            _ => Ok(None),
        }
    }

    /// Pending operation on a key.
    pub fn op(&self, key: &str) -> Option<Operation> {
        self.lock().log.pending(key).cloned()
    }

    /// Returns true if the key has changes the server has not confirmed.
    pub fn dirty(&self, key: &str) -> bool {
        self.lock().attributes.dirty(key)
    }

    /// Keys with unconfirmed changes.
    pub fn dirty_keys(&self) -> Vec<String> {
        self.lock().attributes.dirty_keys()
    }

    /// Returns true if anything awaits a save.
    pub fn is_dirty(&self) -> bool {
        let inner = self.lock();
        inner.attributes.is_dirty() || !inner.log.is_empty()
    }

    /// Returns true if the current value of `key` differs from its value
    /// as of the last save or fetch.
    pub fn has_changed(&self, key: &str) -> bool {
        let inner = self.lock();
        inner.attributes.get(key) != inner.attributes.previous(key)
    }

    /// Keys whose current value differs from the last save or fetch,
    /// with their current value (`None` once unset).
    pub fn changed_attributes(&self) -> BTreeMap<String, Option<Value>> {
        let inner = self.lock();
        let current = inner.attributes.attributes();
        let previous = inner.attributes.previous_attributes();
        current
            .keys()
            .chain(previous.keys())
            .filter(|key| current.get(*key) != previous.get(*key))
            .map(|key| (key.clone(), current.get(key).cloned()))
            .collect()
    }

    /// Unsets every attribute except the ACL.
    pub fn clear(&self) -> ClientResult<()> {
        let names: Vec<String> = self
            .lock()
            .attributes
            .attributes()
            .keys()
            .filter(|key| key.as_str() != keys::ACL)
            .cloned()
            .collect();
        for name in names {
            self.unset(&name)?;
        }
        Ok(())
    }

    /// Value of a key as of the last save or fetch.
    pub fn previous(&self, key: &str) -> Option<Value> {
        self.lock().attributes.previous(key).cloned()
    }

    /// All values as of the last save or fetch.
    pub fn previous_attributes(&self) -> BTreeMap<String, Value> {
        self.lock().attributes.previous_attributes().clone()
    }

    /// Discards every unsaved change.
    pub fn revert(&self) {
        {
            let mut inner = self.lock();
            inner.attributes.revert_all();
            inner.log.clear_all();
        }
        self.shared.events.emit(EntityEvent::Reverted);
    }

    /// Discards unsaved changes to one key.
    pub fn revert_key(&self, key: &str) {
        {
            let mut inner = self.lock();
            inner.attributes.revert(key);
            inner.log.discard(key);
        }
        self.shared.events.emit(EntityEvent::Reverted);
    }

    /// Server-assigned object id.
    pub fn id(&self) -> Option<String> {
        self.lock().id.clone()
    }

    /// Assigns the object id of an existing record. Once set, the id
    /// cannot change.
    pub fn set_id(&self, id: &str) -> ClientResult<()> {
        let mut inner = self.lock();
        inner.ensure_alive(&self.shared.class_name)?;
        match &inner.id {
            Some(existing) if existing == id => Ok(()),
            Some(_) => Err(CoreError::ImmutableField {
                field: keys::OBJECT_ID.to_string(),
            }
            .into()),
            None if id.is_empty() => Err(ClientError::validation("object id must not be empty")),
            None => {
                inner.id = Some(id.to_string());
                inner.settle_state();
                Ok(())
            }
        }
    }

    /// Local id, unique per process and present from creation.
    pub fn cid(&self) -> &str {
        &self.shared.cid
    }

    /// Class name.
    pub fn class_name(&self) -> &str {
        &self.shared.class_name
    }

    /// Server-assigned creation time.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.lock().created_at
    }

    /// Server-assigned update time.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.lock().updated_at
    }

    /// Returns true until the entity has an object id.
    pub fn is_new(&self) -> bool {
        self.lock().id.is_none()
    }

    /// Returns true if the record already existed on the server before
    /// the last save (i.e. it was fetched, queried or updated rather
    /// than created).
    pub fn existed(&self) -> bool {
        self.lock().existed
    }

    /// Returns true once the record's attributes are loaded: always for
    /// new and queried entities, after `fetch` for id-only references.
    pub fn is_data_available(&self) -> bool {
        self.lock().has_data
    }

    /// Lifecycle state.
    pub fn state(&self) -> EntityState {
        self.lock().state
    }

    /// Returns true if both handles refer to the same entity.
    pub fn same_as(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Pointer to this record.
    pub fn to_pointer(&self) -> ClientResult<Pointer> {
        let id = self.id().ok_or_else(|| {
            ClientError::validation(format!(
                "cannot reference an unsaved {} object",
                self.shared.class_name
            ))
        })?;
        Ok(Pointer::new(self.shared.class_name.clone(), id))
    }

    /// Plain JSON form: wire-encoded attributes plus identity and
    /// timestamps.
    pub fn to_json(&self) -> ClientResult<Json> {
        let inner = self.lock();
        let mut map = Map::new();
        for (key, value) in inner.attributes.attributes() {
            map.insert(key.clone(), to_wire(value)?);
        }
        map.insert(
            keys::CLASS_NAME.to_string(),
            Json::String(self.shared.class_name.clone()),
        );
        if let Some(id) = &inner.id {
            map.insert(keys::OBJECT_ID.to_string(), Json::String(id.clone()));
        }
        if let Some(created) = &inner.created_at {
            map.insert(keys::CREATED_AT.to_string(), Json::String(format_iso(created)));
        }
        if let Some(updated) = &inner.updated_at {
            map.insert(keys::UPDATED_AT.to_string(), Json::String(format_iso(updated)));
        }
        Ok(Json::Object(map))
    }

    /// Relation stored under `key`.
    pub fn relation(&self, key: &str) -> Relation {
        let target = {
            let inner = self.lock();
            match (inner.attributes.get(key), inner.log.pending(key)) {
                (_, Some(Operation::Relation(change))) => Some(change.target_class().to_string()),
                (Some(Value::Relation(class)), _) => Some(class.clone()),
                _ => None,
            }
        };
        Relation::new(self.clone(), key, target)
    }

    /// Subscribes to this entity's events.
    pub fn subscribe(&self) -> EntityEvents {
        self.shared.events.subscribe()
    }

    /// Sets every attribute, then saves.
    pub async fn save_with<I, K, V>(&self, attrs: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (key, value) in attrs {
            self.set(key.as_ref(), value)?;
        }
        self.save().await
    }

    /// Sends pending operations to the server.
    ///
    /// Resolves immediately, without a request, when a persisted entity
    /// has nothing pending.
    pub async fn save(&self) -> ClientResult<()> {
        let batch = {
            let mut inner = self.lock();
            inner.ensure_alive(&self.shared.class_name)?;
            if inner.id.is_some() && inner.log.is_empty() {
                return Ok(());
            }
            check_unsaved_files(&inner)?;
            let batch = inner.log.freeze();
            inner.saves_in_flight += 1;
            if inner.state != EntityState::Destroying {
                inner.state = EntityState::Saving;
            }
            batch
        };
        let mut pending = InFlightSave {
            entity: self,
            batch: Some(batch),
        };

        let _lane = self.shared.save_lane.lock().await;

        let request = {
            let inner = self.lock();
            inner.ensure_alive(&self.shared.class_name)?;
            let Some(batch) = pending.batch() else {
                return Ok(());
            };
            match &inner.id {
                Some(_) if batch.is_empty() => None,
                id => {
                    let method = if id.is_some() { Method::Put } else { Method::Post };
                    let body = compile_set(batch)?;
                    Some(Request::new(method, self.path(id.as_deref())).with_json(Json::Object(body)))
                }
            }
        };
        let Some(request) = request else {
            if let Some(batch) = pending.take() {
                let mut inner = self.lock();
                inner.log.settle(&batch);
                inner.saves_in_flight = inner.saves_in_flight.saturating_sub(1);
                inner.settle_state();
            }
            return Ok(());
        };

        let created = request.method == Method::Post;
        let outcome = match self.client().send(request).await {
            Ok(body) => Record::decode(&body).map_err(invalid_response),
            Err(err) => Err(err),
        };

        let Some(batch) = pending.take() else {
            return Ok(());
        };
        match outcome {
            Ok(record) => {
                self.apply_save(batch, record, created);
                info!(class = %self.shared.class_name, id = ?self.id(), created, "saved");
                self.shared.events.emit(EntityEvent::Saved);
                Ok(())
            }
            Err(err) => {
                self.lock().restore_batch(batch);
                debug!(class = %self.shared.class_name, error = %err, "save failed");
                self.shared.events.emit(EntityEvent::SaveFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn apply_save(&self, batch: OperationSet, record: Record, created: bool) {
        let mut inner = self.lock();
        if inner.id.is_none() {
            inner.id = record.id;
        }
        if created {
            inner.created_at = record.created_at.or(inner.created_at);
            inner.updated_at = record.updated_at.or(record.created_at).or(inner.updated_at);
        } else {
            inner.updated_at = record.updated_at.or(inner.updated_at);
        }
        inner.log.settle(&batch);

        let mut attributes = record.attributes;
        for (key, op) in &batch {
            let confirmed = match attributes.remove(key) {
                Some(value) => Some(value),
                None => op
                    .apply(key, inner.attributes.previous(key))
                    .unwrap_or_else(|_| inner.attributes.get(key).cloned()),
            };
            inner.merge_confirmed(key, confirmed);
        }
        for (key, value) in attributes {
            inner.merge_confirmed(&key, Some(value));
        }

        inner.existed = !created;
        inner.saves_in_flight = inner.saves_in_flight.saturating_sub(1);
        inner.settle_state();
    }

    /// Replaces local state with the server's copy. Keys with unsaved
    /// changes keep them, recomputed over the fetched values.
    pub async fn fetch(&self) -> ClientResult<()> {
        let id = {
            let inner = self.lock();
            inner.ensure_alive(&self.shared.class_name)?;
            inner.id.clone().ok_or_else(|| {
                ClientError::validation(format!(
                    "cannot fetch an unsaved {} object",
                    self.shared.class_name
                ))
            })?
        };
        let body = self
            .client()
            .send(Request::new(Method::Get, self.path(Some(&id))))
            .await
            .map_err(|e| e.not_found_as(&self.shared.class_name, &id))?;
        let record = Record::decode(&body).map_err(invalid_response)?;

        {
            let mut inner = self.lock();
            inner.ensure_alive(&self.shared.class_name)?;
            let keys: BTreeSet<String> = record
                .attributes
                .keys()
                .cloned()
                .chain(inner.attributes.clean_keys())
                .collect();
            let mut fetched = record.attributes;
            for key in keys {
                let confirmed = fetched.remove(&key);
                inner.merge_confirmed(&key, confirmed);
            }
            if record.created_at.is_some() {
                inner.created_at = record.created_at;
            }
            if record.updated_at.is_some() {
                inner.updated_at = record.updated_at;
            }
            inner.existed = true;
            inner.has_data = true;
        }
        debug!(class = %self.shared.class_name, id = %id, "fetched");
        self.shared.events.emit(EntityEvent::Fetched);
        Ok(())
    }

    /// Deletes the record. An unsaved entity is destroyed locally
    /// without a request.
    pub async fn destroy(&self) -> ClientResult<()> {
        {
            let mut inner = self.lock();
            inner.ensure_alive(&self.shared.class_name)?;
            inner.state = EntityState::Destroying;
        }
        let mut guard = InFlightDestroy {
            entity: self,
            done: false,
        };

        let _lane = self.shared.save_lane.lock().await;
        let id = {
            let inner = self.lock();
            if inner.state == EntityState::Destroyed {
                guard.done = true;
                return Err(CoreError::Destroyed {
                    class_name: self.shared.class_name.clone(),
                }
                .into());
            }
            inner.id.clone()
        };
        if let Some(id) = &id {
            if let Err(err) = self
                .client()
                .send(Request::new(Method::Delete, self.path(Some(id))))
                .await
            {
                guard.done = true;
                let mut inner = self.lock();
                if inner.state != EntityState::Destroyed {
                    inner.state = EntityState::Saved;
                    inner.settle_state();
                }
                return Err(err);
            }
        }

        guard.done = true;
        {
            let mut inner = self.lock();
            inner.state = EntityState::Destroyed;
            inner.log.clear_all();
        }
        info!(class = %self.shared.class_name, id = ?id, "destroyed");
        self.shared.events.emit(EntityEvent::Destroyed);
        Ok(())
    }
}

fn check_unsaved_files(inner: &Inner) -> ClientResult<()> {
    fn unsaved(value: &Value) -> bool {
        match value {
            Value::File(file) => file.url.is_none(),
            Value::Array(items) => items.iter().any(unsaved),
            Value::Object(map) => map.values().any(unsaved),
            _ => false,
        }
    }
    for key in inner.log.keys() {
        let has_unsaved = match inner.log.pending(&key) {
            Some(Operation::Set(value)) => unsaved(value),
            Some(
                Operation::Add(values) | Operation::AddUnique(values) | Operation::Remove(values),
            ) => values.iter().any(unsaved),
            _ => false,
        };
        if has_unsaved {
            return Err(ClientError::validation(format!(
                "cannot save a reference to an unsaved file under {key}"
            )));
        }
    }
    Ok(())
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Entity")
            .field("class_name", &self.shared.class_name)
            .field("cid", &self.shared.cid)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::{ErrorCode, TransportError};
    use crate::transport::{MockTransport, Response};
    use nimbus_core::{ClassSpec, ValueKind};
    use serde_json::json;

    fn setup() -> (Client, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        let client = Client::with_transport(ClientConfig::new("app", "http://localhost"), mock.clone());
        (client, mock)
    }

    fn saved(client: &Client, attrs: Json) -> Entity {
        let mut json = attrs;
        json["objectId"] = json!("obj1");
        json["createdAt"] = json!("2024-01-01T00:00:00.000Z");
        Entity::from_json(client, "GameScore", &json).unwrap()
    }

    #[test]
    fn new_entity_has_cid_but_no_id() {
        let (client, _) = setup();
        let a = client.object("GameScore").unwrap();
        let b = client.object("GameScore").unwrap();
        assert!(a.is_new());
        assert_ne!(a.cid(), b.cid());
        assert_eq!(a.state(), EntityState::New);
        assert!(a.to_pointer().is_err());
    }

    #[test]
    fn clones_share_one_entity() {
        let (client, _) = setup();
        let a = client.object("GameScore").unwrap();
        let alias = a.clone();
        alias.set("score", 3).unwrap();
        assert!(a.same_as(&alias));
        assert_eq!(a.get("score"), Some(Value::Integer(3)));
        assert!(!a.same_as(&client.object("GameScore").unwrap()));
    }

    #[test]
    fn changed_attributes_and_clear() {
        let (client, _) = setup();
        let entity = saved(&client, json!({ "score": 1, "name": "ann" }));
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        entity.set_acl(&acl).unwrap();
        entity.set("score", 2).unwrap();
        assert!(entity.has_changed("score"));
        assert!(!entity.has_changed("name"));

        entity.clear().unwrap();
        assert!(!entity.has("score") && !entity.has("name"));
        assert!(entity.get_acl().unwrap().is_some());
        let changed = entity.changed_attributes();
        assert_eq!(changed.get("name"), Some(&None));
        assert_eq!(changed.get("score"), Some(&None));
        assert_eq!(entity.op("name"), Some(Operation::Unset));
    }

    #[test]
    fn data_availability() {
        let (client, _) = setup();
        assert!(client.object("GameScore").unwrap().is_data_available());
        assert!(saved(&client, json!({})).is_data_available());
        assert!(!client
            .object_with_id("GameScore", "obj1")
            .unwrap()
            .is_data_available());
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let (client, _) = setup();
        let entity = client.object("GameScore").unwrap();
        for key in ["objectId", "createdAt", "updatedAt", "ACL"] {
            let err = entity.set(key, 1).unwrap_err();
            assert_eq!(err, ClientError::Local(CoreError::reserved_key(key)));
        }
        assert!(entity.op("objectId").is_none());
    }

    #[test]
    fn set_then_revert_restores_previous() {
        let (client, _) = setup();
        let entity = saved(&client, json!({ "score": 10 }));
        entity.set("score", 20).unwrap();
        assert!(entity.dirty("score"));
        assert_eq!(entity.previous("score"), Some(Value::Integer(10)));
        entity.revert();
        assert_eq!(entity.get("score"), Some(Value::Integer(10)));
        assert!(!entity.dirty("score"));
        assert!(entity.op("score").is_none());
    }

    #[test]
    fn setting_the_clean_value_drops_the_op() {
        let (client, _) = setup();
        let entity = saved(&client, json!({ "score": 10 }));
        entity.set("score", 11).unwrap();
        entity.set("score", 10).unwrap();
        assert!(entity.op("score").is_none());
        assert!(!entity.is_dirty());
    }

    #[test]
    fn increments_merge_and_estimate() {
        let (client, _) = setup();
        let entity = saved(&client, json!({ "score": 10 }));
        entity.increment("score", 2).unwrap();
        entity.increment("score", 3).unwrap();
        assert_eq!(entity.op("score"), Some(Operation::Increment(Value::Integer(5))));
        assert_eq!(entity.get("score"), Some(Value::Integer(15)));
    }

    #[test]
    fn increment_after_text_set_fails() {
        let (client, _) = setup();
        let entity = client.object("GameScore").unwrap();
        entity.set("score", "high").unwrap();
        let err = entity.increment("score", 1).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Local(CoreError::IncompatibleOperation { .. })
        ));
        assert_eq!(entity.get("score"), Some(Value::from("high")));
    }

    #[test]
    fn array_operations() {
        let (client, _) = setup();
        let entity = saved(&client, json!({ "tags": ["a"] }));
        entity.add_unique("tags", ["a", "b"]).unwrap();
        assert_eq!(
            entity.get("tags"),
            Some(Value::Array(vec![Value::from("a"), Value::from("b")]))
        );
        assert!(entity.remove("tags", ["a"]).is_err());
    }

    #[test]
    fn acl_marks_key_dirty() {
        let (client, _) = setup();
        let entity = client.object("GameScore").unwrap();
        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        entity.set_acl(&acl).unwrap();
        entity.set_acl(&acl).unwrap();
        assert_eq!(entity.dirty_keys(), vec!["ACL".to_string()]);
        assert_eq!(entity.get_acl().unwrap(), Some(acl));
    }

    #[test]
    fn id_is_immutable() {
        let (client, _) = setup();
        let entity = client.object("GameScore").unwrap();
        entity.set_id("a1").unwrap();
        entity.set_id("a1").unwrap();
        assert_eq!(entity.state(), EntityState::Saved);
        let err = entity.set_id("b2").unwrap_err();
        assert_eq!(
            err,
            ClientError::Local(CoreError::ImmutableField {
                field: "objectId".into()
            })
        );
    }

    #[test]
    fn registered_defaults_and_types() {
        let (client, _) = setup();
        client.register(
            ClassSpec::new("GameScore")
                .unwrap()
                .with_field("score", ValueKind::Number)
                .unwrap()
                .with_default("score", 0)
                .unwrap(),
        );
        let entity = client.object("GameScore").unwrap();
        assert_eq!(entity.get("score"), Some(Value::Integer(0)));
        assert_eq!(entity.op("score"), Some(Operation::Set(Value::Integer(0))));
        let err = entity.set("score", "lots").unwrap_err();
        assert!(matches!(err, ClientError::Local(CoreError::Validation { .. })));
    }

    #[test]
    fn json_round_trip() {
        let (client, _) = setup();
        let entity = saved(
            &client,
            json!({ "when": { "__type": "Date", "iso": "2024-05-01T10:00:00.000Z" }, "n": 1 }),
        );
        let json = entity.to_json().unwrap();
        assert_eq!(json["objectId"], "obj1");
        assert_eq!(json["className"], "GameScore");
        assert_eq!(json["when"]["__type"], "Date");
        let again = Entity::from_json(&client, "GameScore", &json).unwrap();
        assert_eq!(again.attributes(), entity.attributes());
        assert_eq!(again.created_at(), entity.created_at());
        assert!(!again.is_dirty());
    }

    #[test]
    fn included_records_materialize() {
        let (client, _) = setup();
        let entity = saved(
            &client,
            json!({
                "player": { "__type": "Object", "className": "Player", "objectId": "p1", "name": "ann" },
                "team": { "__type": "Pointer", "className": "Team", "objectId": "t1" },
            }),
        );
        let player = entity.get_entity("player").unwrap().unwrap();
        assert_eq!(player.class_name(), "Player");
        assert_eq!(player.id().as_deref(), Some("p1"));
        assert_eq!(player.get("name"), Some(Value::from("ann")));
        let team = entity.get_entity("team").unwrap().unwrap();
        assert_eq!(team.id().as_deref(), Some("t1"));
        assert!(team.attributes().is_empty());
    }

    #[tokio::test]
    async fn save_creates_then_updates() {
        let (client, mock) = setup();
        mock.push_response(Response::created(
            json!({ "objectId": "n1", "createdAt": "2024-01-01T00:00:00.000Z" }),
        ));
        mock.push_response(Response::ok(json!({ "updatedAt": "2024-01-02T00:00:00.000Z" })));

        let entity = client.object("GameScore").unwrap();
        entity.set("score", 1).unwrap();
        entity.save().await.unwrap();
        assert_eq!(entity.id().as_deref(), Some("n1"));
        assert!(entity.op("score").is_none());
        assert!(!entity.dirty("score"));
        assert!(!entity.existed());
        assert_eq!(entity.updated_at(), entity.created_at());

        entity.increment("score", 2).unwrap();
        entity.save().await.unwrap();
        assert_eq!(entity.previous("score"), Some(Value::Integer(3)));
        assert!(entity.existed());

        let requests = mock.requests();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].path, "/classes/GameScore");
        assert_eq!(requests[0].json(), Some(&json!({ "score": 1 })));
        assert_eq!(requests[1].method, Method::Put);
        assert_eq!(requests[1].path, "/classes/GameScore/n1");
        assert_eq!(
            requests[1].json(),
            Some(&json!({ "score": { "__op": "Increment", "amount": 2 } }))
        );
    }

    #[tokio::test]
    async fn save_without_changes_sends_nothing() {
        let (client, mock) = setup();
        let entity = saved(&client, json!({ "score": 1 }));
        entity.save().await.unwrap();
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn failed_save_keeps_operations() {
        let (client, mock) = setup();
        mock.push_response(Response::error(400, 142, "rejected"));
        let entity = saved(&client, json!({ "score": 1 }));
        entity.increment("score", 1).unwrap();
        let err = entity.save().await.unwrap_err();
        assert_eq!(err, ClientError::remote(ErrorCode::ValidationError, "rejected"));
        assert_eq!(entity.op("score"), Some(Operation::Increment(Value::Integer(1))));
        assert!(entity.dirty("score"));
        assert_eq!(entity.state(), EntityState::Saved);
    }

    #[tokio::test]
    async fn transport_failure_is_connection_failed() {
        let (client, mock) = setup();
        mock.push_error(TransportError::new("offline"));
        let entity = client.object("GameScore").unwrap();
        entity.set("a", 1).unwrap();
        let err = entity.save().await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionFailed));
        assert_eq!(entity.state(), EntityState::New);
        assert!(entity.op("a").is_some());
    }

    #[tokio::test]
    async fn unsaved_files_block_saves() {
        let (client, mock) = setup();
        let entity = client.object("GameScore").unwrap();
        entity
            .set(
                "photo",
                Value::File(nimbus_codec::FileDescriptor {
                    name: "a.png".into(),
                    url: None,
                }),
            )
            .unwrap();
        let err = entity.save().await.unwrap_err();
        assert!(err.is_local());
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn fetch_keeps_dirty_keys() {
        let (client, mock) = setup();
        mock.push_response(Response::ok(json!({
            "objectId": "obj1",
            "score": 50,
            "name": "remote",
            "updatedAt": "2024-02-01T00:00:00.000Z",
        })));
        let entity = saved(&client, json!({ "score": 10, "name": "local", "gone": true }));
        entity.increment("score", 1).unwrap();
        entity.fetch().await.unwrap();

        assert_eq!(entity.get("name"), Some(Value::from("remote")));
        assert!(!entity.has("gone"));
        assert_eq!(entity.previous("score"), Some(Value::Integer(50)));
        assert_eq!(entity.get("score"), Some(Value::Integer(51)));
        assert!(entity.dirty("score"));
        assert_eq!(mock.requests()[0].path, "/classes/GameScore/obj1");
    }

    #[tokio::test]
    async fn fetch_errors() {
        let (client, mock) = setup();
        let fresh = client.object("GameScore").unwrap();
        assert!(fresh.fetch().await.unwrap_err().is_local());
        assert_eq!(mock.request_count(), 0);

        mock.push_response(Response::error(404, 101, "Object not found."));
        let missing = client.object_with_id("GameScore", "zzz").unwrap();
        assert_eq!(
            missing.fetch().await.unwrap_err(),
            ClientError::NotFound {
                class_name: "GameScore".into(),
                id: "zzz".into()
            }
        );
    }

    #[tokio::test]
    async fn destroy_is_terminal() {
        let (client, mock) = setup();
        mock.push_response(Response::ok(json!({})));
        let entity = saved(&client, json!({ "score": 1 }));
        let mut events = entity.subscribe();
        entity.destroy().await.unwrap();
        assert_eq!(entity.state(), EntityState::Destroyed);
        assert_eq!(events.recv().await.unwrap(), EntityEvent::Destroyed);

        let err = entity.set("score", 2).unwrap_err();
        assert_eq!(
            err,
            ClientError::Local(CoreError::Destroyed {
                class_name: "GameScore".into()
            })
        );
        assert!(entity.save().await.is_err());
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.requests()[0].method, Method::Delete);
    }

    #[tokio::test]
    async fn destroying_a_new_entity_is_local() {
        let (client, mock) = setup();
        let entity = client.object("GameScore").unwrap();
        entity.destroy().await.unwrap();
        assert_eq!(entity.state(), EntityState::Destroyed);
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn failed_destroy_restores_state() {
        let (client, mock) = setup();
        mock.push_response(Response::error(403, 119, "forbidden"));
        let entity = saved(&client, json!({}));
        assert!(entity.destroy().await.is_err());
        assert_eq!(entity.state(), EntityState::Saved);
        entity.set("a", 1).unwrap();
    }

    #[tokio::test]
    async fn change_events() {
        let (client, _) = setup();
        let entity = client.object("GameScore").unwrap();
        let mut events = entity.subscribe();
        entity.set("a", 1).unwrap();
        entity.revert();
        assert_eq!(
            events.recv().await.unwrap(),
            EntityEvent::Changed { key: "a".into() }
        );
        assert_eq!(events.recv().await.unwrap(), EntityEvent::Reverted);
    }
}
