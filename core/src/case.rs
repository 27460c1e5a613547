//! Key-casing conversion between the wire (snake_case) and local (camelCase)
//! conventions.
//!
//! # Design
//! Both directions are a single exhaustive walk over [`Payload`]. Only record
//! keys are renamed. Dates and binary values are matched first and returned
//! untouched, arrays are mapped element by element, primitives pass through.
//!
//! The key rules are deliberately narrow so the two directions invert each
//! other: wire casing inserts `_` before every ASCII uppercase letter, local
//! casing folds `_` + ASCII lowercase letter into the uppercase letter.
//! Running either direction on already-converted input is a no-op.

use crate::payload::Payload;

/// `userName` -> `user_name`.
pub fn to_wire_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `user_name` -> `userName`.
pub fn to_local_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '_' {
            if let Some(next) = chars.next_if(char::is_ascii_lowercase) {
                out.push(next.to_ascii_uppercase());
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Rename every record key in `value` to wire casing.
pub fn to_wire_case(value: Payload) -> Payload {
    rename_keys(value, &to_wire_key)
}

/// Rename every record key in `value` to local casing.
pub fn to_local_case(value: Payload) -> Payload {
    rename_keys(value, &to_local_key)
}

fn rename_keys(value: Payload, rename: &dyn Fn(&str) -> String) -> Payload {
    match value {
        // Checked ahead of records: these are object-like but opaque.
        Payload::Date(_) | Payload::Binary(_) => value,
        Payload::Array(items) => {
            Payload::Array(items.into_iter().map(|item| rename_keys(item, rename)).collect())
        }
        Payload::Record(map) => Payload::Record(
            map.into_iter()
                .map(|(key, item)| (rename(&key), rename_keys(item, rename)))
                .collect(),
        ),
        Payload::Null | Payload::Bool(_) | Payload::Number(_) | Payload::String(_) => value,
    }
}
