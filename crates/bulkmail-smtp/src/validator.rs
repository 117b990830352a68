//! Syntactic email-address validation.
//!
//! No DNS or mailbox lookups are performed; this only decides whether a
//! string looks like `local@domain.tld`.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,}$")
            .expect("email pattern is valid");
}

/// Whether `candidate` is a syntactically valid address.
///
/// The match is anchored at both ends, so surrounding whitespace or a second
/// `@` make the candidate invalid.
pub fn is_valid_email(candidate: &str) -> bool {
    !candidate.is_empty() && EMAIL_RE.is_match(candidate)
}
