//! Failure fingerprints for loop detection.
//!
//! A signature is the first 16 hex characters of SHA-256 over the four
//! canonical fields of a [`FailureReport`], in fixed order, joined by the
//! ASCII unit separator. Empty fields are replaced by a sentinel so that
//! "no message" and "no test id" never collide.

use sha2::{Digest, Sha256};

use crate::model::FailureReport;

pub const SIGNATURE_LEN: usize = 16;

const EMPTY_FIELD: &str = "<none>";
const FIELD_SEPARATOR: char = '\u{1f}';

fn canonical(field: &str) -> &str {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        EMPTY_FIELD
    } else {
        trimmed
    }
}

pub fn canonical_input(report: &FailureReport) -> String {
    let fields = [
        report.root_cause.as_str(),
        canonical(&report.error_message),
        canonical(&report.failing_test),
        canonical(&report.artifact_path),
    ];
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        out.push_str(field);
    }
    out
}

pub fn compute_signature(report: &FailureReport) -> String {
    let digest = Sha256::digest(canonical_input(report).as_bytes());
    hex::encode(&digest[..SIGNATURE_LEN / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RootCause;

    fn report(msg: &str, test: &str, path: &str) -> FailureReport {
        FailureReport::new(RootCause::ImplementationBug, msg, test, path)
    }

    #[test]
    fn fixed_width_lowercase_hex() {
        let sig = compute_signature(&report("boom", "t1", "src/a.rs"));
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn deterministic_across_calls() {
        let r = report("assertion failed", "test_login", "src/auth.rs");
        assert_eq!(compute_signature(&r), compute_signature(&r.clone()));
    }

    #[test]
    fn known_vector_is_stable() {
        // Pinned so a change to field order or separator is caught.
        let r = report("boom", "t1", "src/a.rs");
        assert_eq!(canonical_input(&r), "implementation_bug\u{1f}boom\u{1f}t1\u{1f}src/a.rs");
        assert_eq!(compute_signature(&r), "d09c315cf704ad0e");
    }

    #[test]
    fn empty_fields_do_not_collide() {
        let no_message = report("", "x", "");
        let no_test = report("x", "", "");
        assert_ne!(compute_signature(&no_message), compute_signature(&no_test));
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(
            compute_signature(&report("boom ", " t1", "src/a.rs\n")),
            compute_signature(&report("boom", "t1", "src/a.rs"))
        );
        assert_eq!(
            compute_signature(&report("   ", "t1", "")),
            compute_signature(&report("", "t1", ""))
        );
    }

    #[test]
    fn root_cause_participates() {
        let a = FailureReport::new(RootCause::TestDefect, "boom", "t1", "a.rs");
        let b = FailureReport::new(RootCause::ImplementationBug, "boom", "t1", "a.rs");
        assert_ne!(compute_signature(&a), compute_signature(&b));
    }
}
