//! Logical key layout in the durable store

/// Checkout records, keyed by identity id
pub const CHECKOUT_PREFIX: &str = "checkout/";

/// Key-handle mappings, keyed by identity id
pub const KEY_HANDLE_PREFIX: &str = "key-handle/";

/// Library sets, keyed by set name
pub const LIBRARY_PREFIX: &str = "library/";

/// Static role credentials, keyed by role name
pub const STATIC_ROLE_PREFIX: &str = "static-role/";

/// The single admin credential record
pub const ADMIN_CREDENTIAL: &str = "config/admin";

pub fn checkout(identity_id: &str) -> String {
    format!("{CHECKOUT_PREFIX}{identity_id}")
}

pub fn key_handle(identity_id: &str) -> String {
    format!("{KEY_HANDLE_PREFIX}{identity_id}")
}

pub fn library(set_name: &str) -> String {
    format!("{LIBRARY_PREFIX}{set_name}")
}

pub fn static_role(role_name: &str) -> String {
    format!("{STATIC_ROLE_PREFIX}{role_name}")
}
