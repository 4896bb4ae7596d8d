// Branch name validation
//
// Runs before any git subprocess is spawned. Argument-vector invocation already
// keeps names away from a shell; the substring checks still hold if a future
// call site interpolates them.

use regex::Regex;
use std::sync::OnceLock;

use super::GitError;

static BRANCH_PATTERN: OnceLock<Regex> = OnceLock::new();

fn branch_pattern() -> &'static Regex {
    BRANCH_PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9/_.-]+$").unwrap())
}

/// Substrings rejected even when the character class matches
const FORBIDDEN_SUBSTRINGS: &[(&str, &str)] = &[
    ("..", "contains '..'"),
    (";", "contains ';'"),
    ("&", "contains '&'"),
];

/// Validate an untrusted branch or base name
pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
    for &(needle, reason) in FORBIDDEN_SUBSTRINGS {
        if name.contains(needle) {
            return Err(GitError::InvalidBranchName {
                name: name.to_string(),
                reason,
            });
        }
    }

    if !branch_pattern().is_match(name) {
        return Err(GitError::InvalidBranchName {
            name: name.to_string(),
            reason: "must match ^[A-Za-z0-9/_.-]+$",
        });
    }

    Ok(())
}
