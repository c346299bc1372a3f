//! Well-known attribute keys and name validation.

use crate::error::{CoreError, CoreResult};

/// Server-assigned identity.
pub const OBJECT_ID: &str = "objectId";
/// Server-assigned creation timestamp.
pub const CREATED_AT: &str = "createdAt";
/// Server-assigned update timestamp.
pub const UPDATED_AT: &str = "updatedAt";
/// Access control list; written only through the ACL setter.
pub const ACL: &str = "ACL";
/// Class name carried by wire records.
pub const CLASS_NAME: &str = "className";

/// Class holding users.
pub const USER_CLASS: &str = "_User";
/// Class holding roles.
pub const ROLE_CLASS: &str = "_Role";
/// Name of a role, fixed once the role is saved.
pub const ROLE_NAME: &str = "name";

/// Keys the application may never set directly.
pub const RESERVED_KEYS: [&str; 4] = [OBJECT_ID, CREATED_AT, UPDATED_AT, ACL];

/// Returns true for keys owned by the server or a dedicated setter.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Checks that an attribute key is usable.
///
/// Keys must be non-empty, start with a letter and contain only
/// ASCII alphanumerics and underscores. Dotted paths are not keys.
pub fn validate_key(key: &str) -> CoreResult<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid key name: {key:?}")))
    }
}

/// Checks that a key may be written through the generic setters.
pub fn validate_writable_key(key: &str) -> CoreResult<()> {
    if is_reserved(key) {
        return Err(CoreError::reserved_key(key));
    }
    validate_key(key)
}

/// Checks a class name.
///
/// Application classes start with a letter; system classes such as
/// `_User` and `_Role` start with an underscore.
pub fn validate_class_name(name: &str) -> CoreResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name != "_"
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid class name: {name:?}")))
    }
}

/// Checks a role name: letters, digits, `_`, `-` and spaces.
pub fn validate_role_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "role names may contain only letters, digits, '_', '-' and spaces: {name:?}"
        )))
    }
}
