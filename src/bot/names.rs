use crate::storage::{display_name, user_object_key, user_prefix};
use crate::utils::sanitize_filename;

/// Finds the object key a user meant by `requested`.
///
/// Tries the name as typed, then its sanitized form, then a case-insensitive
/// match on either.
#[must_use]
pub fn match_object_name(keys: &[String], user_id: i64, requested: &str) -> Option<String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return None;
    }

    let exact = format!("{}{requested}", user_prefix(user_id));
    if keys.contains(&exact) {
        return Some(exact);
    }

    let sanitized = user_object_key(user_id, requested);
    if keys.contains(&sanitized) {
        return Some(sanitized);
    }

    let wanted = requested.to_lowercase();
    let wanted_sanitized = sanitize_filename(requested).to_lowercase();
    keys.iter()
        .find(|key| {
            let name = display_name(key).to_lowercase();
            name == wanted || name == wanted_sanitized
        })
        .cloned()
}
