//! Access control lists.
//!
//! An [`Acl`] maps subjects to read/write permissions. Subjects are the
//! public wildcard `*`, a user id, or `role:<name>`. A subject without
//! an entry has no permission.

use crate::error::{CoreError, CoreResult};
use nimbus_codec::{from_wire, Json, Value};
use serde_json::Map;
use std::collections::{BTreeMap, BTreeSet};

/// Subject key granting access to everyone.
pub const PUBLIC: &str = "*";

const ROLE_PREFIX: &str = "role:";

/// Kind of access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read access.
    Read,
    /// Write access.
    Write,
}

/// Permissions held by one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    /// May read.
    pub read: bool,
    /// May write.
    pub write: bool,
}

impl Permissions {
    fn allows(self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
        }
    }

    fn set(&mut self, mode: AccessMode, allowed: bool) {
        match mode {
            AccessMode::Read => self.read = allowed,
            AccessMode::Write => self.write = allowed,
        }
    }

    fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    /// Names of the granted permissions, as written on the wire.
    fn granted(self) -> impl Iterator<Item = &'static str> {
        [("read", self.read), ("write", self.write)]
            .into_iter()
            .filter_map(|(name, granted)| granted.then_some(name))
    }
}

/// Who is asking: a user id (if signed in) and the roles they hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    user_id: Option<String>,
    roles: BTreeSet<String>,
}

impl Principal {
    /// An anonymous principal; only public entries apply.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A signed-in user.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            roles: BTreeSet::new(),
        }
    }

    /// Adds a role the principal holds.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// The user id, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Role names held.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}

/// An access control list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    entries: BTreeMap<String, Permissions>,
}

impl Acl {
    /// An empty ACL: nobody may read or write.
    pub fn new() -> Self {
        Self::default()
    }

    /// An ACL granting the user full access and nobody else anything.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let mut acl = Self::new();
        acl.set_read_access(&user_id, true);
        acl.set_write_access(&user_id, true);
        acl
    }

    /// Returns true if `principal` may perform `mode`.
    ///
    /// The public entry, the principal's own entry, or any of their
    /// roles grants access.
    pub fn can(&self, principal: &Principal, mode: AccessMode) -> bool {
        if self.allows(PUBLIC, mode) {
            return true;
        }
        if let Some(user) = principal.user_id() {
            if self.allows(user, mode) {
                return true;
            }
        }
        principal
            .roles()
            .any(|role| self.allows(&role_key(role), mode))
    }

    fn allows(&self, subject: &str, mode: AccessMode) -> bool {
        self.entries.get(subject).is_some_and(|p| p.allows(mode))
    }

    fn set(&mut self, subject: &str, mode: AccessMode, allowed: bool) {
        if allowed {
            self.entries
                .entry(subject.to_string())
                .or_default()
                .set(mode, true);
        } else if let Some(perms) = self.entries.get_mut(subject) {
            perms.set(mode, false);
            if perms.is_empty() {
                self.entries.remove(subject);
            }
        }
    }

    /// Grants or revokes public read access.
    pub fn set_public_read_access(&mut self, allowed: bool) {
        self.set(PUBLIC, AccessMode::Read, allowed);
    }

    /// Grants or revokes public write access.
    pub fn set_public_write_access(&mut self, allowed: bool) {
        self.set(PUBLIC, AccessMode::Write, allowed);
    }

    /// Public read access.
    pub fn public_read_access(&self) -> bool {
        self.allows(PUBLIC, AccessMode::Read)
    }

    /// Public write access.
    pub fn public_write_access(&self) -> bool {
        self.allows(PUBLIC, AccessMode::Write)
    }

    /// Grants or revokes read access for a user id.
    pub fn set_read_access(&mut self, user_id: &str, allowed: bool) {
        self.set(user_id, AccessMode::Read, allowed);
    }

    /// Grants or revokes write access for a user id.
    pub fn set_write_access(&mut self, user_id: &str, allowed: bool) {
        self.set(user_id, AccessMode::Write, allowed);
    }

    /// Explicit read access of a user id (ignores public and roles).
    pub fn read_access(&self, user_id: &str) -> bool {
        self.allows(user_id, AccessMode::Read)
    }

    /// Explicit write access of a user id (ignores public and roles).
    pub fn write_access(&self, user_id: &str) -> bool {
        self.allows(user_id, AccessMode::Write)
    }

    /// Grants or revokes read access for a role.
    pub fn set_role_read_access(&mut self, role: &str, allowed: bool) {
        self.set(&role_key(role), AccessMode::Read, allowed);
    }

    /// Grants or revokes write access for a role.
    pub fn set_role_write_access(&mut self, role: &str, allowed: bool) {
        self.set(&role_key(role), AccessMode::Write, allowed);
    }

    /// Read access granted to a role.
    pub fn role_read_access(&self, role: &str) -> bool {
        self.allows(&role_key(role), AccessMode::Read)
    }

    /// Write access granted to a role.
    pub fn role_write_access(&self, role: &str) -> bool {
        self.allows(&role_key(role), AccessMode::Write)
    }

    /// Permissions of a raw subject key.
    pub fn entry(&self, subject: &str) -> Option<Permissions> {
        self.entries.get(subject).copied()
    }

    /// Number of subjects with at least one permission.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nobody has any permission.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts to the attribute value stored under the `ACL` key.
    ///
    /// Only granted permissions are written, so `{"*": {"read": true}}`
    /// never carries a `write: false`.
    pub fn to_value(&self) -> Value {
        let map = self
            .entries
            .iter()
            .map(|(subject, perms)| {
                let grants = perms
                    .granted()
                    .map(|name| (name.to_string(), Value::Bool(true)))
                    .collect();
                (subject.clone(), Value::Object(grants))
            })
            .collect();
        Value::Object(map)
    }

    /// Parses the attribute value stored under the `ACL` key.
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| CoreError::validation("ACL must be an object"))?;
        let mut acl = Self::new();
        for (subject, grants) in map {
            let grants = grants.as_object().ok_or_else(|| {
                CoreError::validation(format!("ACL entry for {subject} must be an object"))
            })?;
            for (name, allowed) in grants {
                let mode = match name.as_str() {
                    "read" => AccessMode::Read,
                    "write" => AccessMode::Write,
                    other => {
                        return Err(CoreError::validation(format!(
                            "unknown ACL permission {other}"
                        )))
                    }
                };
                let allowed = allowed.as_bool().ok_or_else(|| {
                    CoreError::validation(format!("ACL permission {name} must be a boolean"))
                })?;
                acl.set(subject, mode, allowed);
            }
        }
        Ok(acl)
    }

    /// JSON form: `{"*": {"read": true}, "u1": {"write": true}}`.
    pub fn to_json(&self) -> Json {
        let map = self
            .entries
            .iter()
            .map(|(subject, perms)| {
                let grants: Map<String, Json> = perms
                    .granted()
                    .map(|name| (name.to_string(), Json::Bool(true)))
                    .collect();
                (subject.clone(), Json::Object(grants))
            })
            .collect();
        Json::Object(map)
    }

    /// Parses the JSON form produced by [`Acl::to_json`].
    pub fn from_json(json: &Json) -> CoreResult<Self> {
        Self::from_value(&from_wire(json)?)
    }
}

fn role_key(role: &str) -> String {
    format!("{ROLE_PREFIX}{role}")
}
