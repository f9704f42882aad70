//! Set spec hierarchy helpers.
//!
//! A set spec such as `physics:quantum:optics` names a set whose ancestors
//! are `physics` and `physics:quantum`. The separator is a literal `:` with
//! no escaping.

pub const SEPARATOR: char = ':';

fn is_spec_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_!'$()+-.*".contains(c)
}

/// Whether `spec` is a well-formed set spec: one or more non-empty segments
/// of unreserved characters joined by `:`.
pub fn is_valid(spec: &str) -> bool {
    !spec.is_empty()
        && spec
            .split(SEPARATOR)
            .all(|segment| !segment.is_empty() && segment.chars().all(is_spec_char))
}

pub fn has_parent(spec: &str) -> bool {
    spec.contains(SEPARATOR)
}

/// The immediate parent of `spec`, or `None` for a top-level set.
pub fn parent_of(spec: &str) -> Option<&str> {
    spec.rfind(SEPARATOR).map(|i| &spec[..i])
}

/// `spec` and all of its ancestors, shortest first.
pub fn all_sets_for(spec: &str) -> Vec<String> {
    let mut sets = Vec::new();
    for (i, c) in spec.char_indices() {
        if c == SEPARATOR {
            sets.push(spec[..i].to_string());
        }
    }
    sets.push(spec.to_string());
    sets
}

/// Descriptor XML used for ancestor sets the repository never described.
pub fn default_descriptor(spec: &str) -> String {
    format!(
        "<set>\n  <setSpec>{spec}</setSpec>\n  <setName>{spec}</setName>\n</set>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        assert!(is_valid("a"));
        assert!(is_valid("a:b:c"));
        assert!(is_valid("Physics_(2005)!"));
        assert!(!is_valid(""));
        assert!(!is_valid("a::b"));
        assert!(!is_valid(":a"));
        assert!(!is_valid("a:"));
        assert!(!is_valid("a b"));
    }

    #[test]
    fn test_parents() {
        assert!(!has_parent("a"));
        assert!(has_parent("a:b"));
        assert_eq!(parent_of("a:b:c"), Some("a:b"));
        assert_eq!(parent_of("a"), None);
    }

    #[test]
    fn test_all_sets_for() {
        assert_eq!(all_sets_for("a:b:c"), vec!["a", "a:b", "a:b:c"]);
        assert_eq!(all_sets_for("solo"), vec!["solo"]);
    }

    #[test]
    fn test_default_descriptor() {
        assert_eq!(
            default_descriptor("a:b"),
            "<set>\n  <setSpec>a:b</setSpec>\n  <setName>a:b</setName>\n</set>"
        );
    }
}
