//! Prefix lookups over short identifiers.

use crate::error::LookupError;

/// Return the single candidate whose key starts with `prefix`.
///
/// Zero matches yields [`LookupError::NotFound`]; two or more yield
/// [`LookupError::Ambiguous`] naming the first two keys found.
pub fn find_by_prefix<T>(
    candidates: impl IntoIterator<Item = T>,
    key: impl Fn(&T) -> &str,
    prefix: &str,
) -> Result<T, LookupError> {
    let mut found: Option<T> = None;
    for candidate in candidates {
        if !key(&candidate).starts_with(prefix) {
            continue;
        }
        if let Some(first) = &found {
            return Err(LookupError::Ambiguous(
                key(first).to_string(),
                key(&candidate).to_string(),
            ));
        }
        found = Some(candidate);
    }
    found.ok_or_else(|| LookupError::NotFound(prefix.to_string()))
}
