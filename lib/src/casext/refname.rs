//! Reference-name validation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::Error;

// Note this is stricter than what the distribution spec allows for tags.
static REF_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._][A-Za-z0-9._-]*$").unwrap());

/// Whether `name` is a valid reference name.
pub fn is_valid(name: &str) -> bool {
    REF_NAME.is_match(name)
}

/// Validate a reference name, returning it on success.
pub fn validate(name: &str) -> Result<&str, Error> {
    if is_valid(name) {
        Ok(name)
    } else {
        Err(Error::invalid(format!("invalid reference name {name:?}")))
    }
}
