//! Session label sanitizing.
//!
//! Session labels come from a human and end up as a path segment under the
//! work and output directories, so anything outside `[0-9a-zA-Z./]` is
//! replaced. Each maximal run of disallowed characters collapses into a
//! single underscore.

use regex::Regex;
use std::sync::LazyLock;

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9a-zA-Z./]+").expect("constant regex pattern is valid"));

/// Replace every run of characters outside `[0-9a-zA-Z./]` with one `_`.
pub fn sanitize_label(raw: &str) -> String {
    DISALLOWED.replace_all(raw, "_").into_owned()
}
