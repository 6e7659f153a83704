//! Lineage edge sanitization.
//!
//! Collapses digit runs (with embedded dashes) into a single `*` so that
//! date- or index-parameterized resource names collapse into stable graph
//! nodes: `"a.2024-01-05.b"` sanitizes to `"a.*.b"`.

/// Replaces each maximal run of `[0-9][0-9-]*` with `*`.
pub fn sanitize(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '-') {
                i += 1;
            }
            out.push('*');
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// Returns true if every sanitized segment in `names` lives entirely under
/// the `test.*` namespace; such edges are suppressed from the lineage log.
pub fn all_under_test_namespace<'a>(names: impl IntoIterator<Item = &'a str>) -> bool {
    let mut any = false;
    for n in names {
        any = true;
        let sanitized = sanitize(n);
        if !sanitized.starts_with("test.") {
            return false;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_date_segment() {
        assert_eq!(sanitize("a.2024-01-05.b"), "a.*.b");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize("a.2024-01-05.b");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn sanitizes_plain_index() {
        assert_eq!(sanitize("events.42"), "events.*");
    }

    #[test]
    fn leaves_non_digit_names_alone() {
        assert_eq!(sanitize("reporting.events"), "reporting.events");
    }

    #[test]
    fn detects_test_namespace() {
        assert!(all_under_test_namespace(["test.foo", "test.bar.1"]));
        assert!(!all_under_test_namespace(["test.foo", "prod.bar"]));
        assert!(!all_under_test_namespace(std::iter::empty()));
    }

    #[test]
    fn bare_test_is_not_the_test_namespace() {
        // Only the "test." prefix is suppressed, not the literal name "test".
        assert!(!all_under_test_namespace(["test"]));
    }
}
