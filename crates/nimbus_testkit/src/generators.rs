//! Property-based test generators using proptest.

use nimbus_client::{ClientResult, Entity};
use nimbus_codec::Value;
use nimbus_core::{keys, Acl};
use proptest::prelude::*;

/// Strategy for generating writable attribute keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9_]{0,11}")
        .expect("Invalid regex")
        .prop_filter("Key must not be reserved", |k| !keys::is_reserved(k))
}

/// Strategy for generating valid class names.
pub fn class_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating scalar attribute values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-1_000i64..1_000).prop_map(Value::Integer),
        (-1.0e6f64..1.0e6).prop_map(Value::Float),
        "[a-z ]{0,12}".prop_map(Value::Text),
    ]
}

/// A single local edit of an entity.
#[derive(Debug, Clone)]
pub enum EntityEdit {
    /// `set(key, value)`.
    Set(String, Value),
    /// `unset(key)`.
    Unset(String),
    /// `increment(key, amount)`.
    Increment(String, i64),
}

impl EntityEdit {
    /// Applies the edit. Incompatible edits fail and leave the entity as
    /// it was.
    pub fn apply(&self, entity: &Entity) -> ClientResult<()> {
        match self {
            EntityEdit::Set(key, value) => entity.set(key, value.clone()),
            EntityEdit::Unset(key) => entity.unset(key),
            EntityEdit::Increment(key, amount) => entity.increment(key, *amount),
        }
    }
}

/// Strategy for edits over a small key pool, so that edits collide.
pub fn edit_strategy() -> impl Strategy<Value = EntityEdit> {
    let key = || prop::sample::select(vec!["alpha", "beta", "gamma", "delta"]).prop_map(String::from);
    prop_oneof![
        (key(), scalar_value_strategy()).prop_map(|(k, v)| EntityEdit::Set(k, v)),
        key().prop_map(EntityEdit::Unset),
        (key(), -100i64..100).prop_map(|(k, n)| EntityEdit::Increment(k, n)),
    ]
}

/// Strategy for generating ACLs over a few users.
pub fn acl_strategy() -> impl Strategy<Value = Acl> {
    (
        any::<bool>(),
        any::<bool>(),
        prop::collection::vec(("u[0-9]{1,3}", any::<bool>(), any::<bool>()), 0..4),
    )
        .prop_map(|(public_read, public_write, users)| {
            let mut acl = Acl::new();
            acl.set_public_read_access(public_read);
            acl.set_public_write_access(public_write);
            for (user, read, write) in users {
                acl.set_read_access(&user, read);
                acl.set_write_access(&user, write);
            }
            acl
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::keys::validate_class_name;

    proptest! {
        #[test]
        fn generated_keys_are_writable(key in key_strategy()) {
            prop_assert!(keys::validate_writable_key(&key).is_ok());
        }

        #[test]
        fn generated_class_names_are_valid(name in class_name_strategy()) {
            prop_assert!(validate_class_name(&name).is_ok());
        }

        #[test]
        fn generated_acls_survive_value_form(acl in acl_strategy()) {
            prop_assert_eq!(Acl::from_value(&acl.to_value()).unwrap(), acl);
        }
    }
}
