//! Search-pattern validation applied before any fan-out.

use crate::error::{GlobalIndexError, Result};

const MAX_PATTERN_BYTES: usize = 512;
const MAX_WILDCARDS: usize = 16;
const MAX_ALTERNATIONS: usize = 8;

/// Reject patterns that are empty, oversized, or carry path-traversal or
/// pathological-regex fragments.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(GlobalIndexError::InvalidPattern("pattern is empty".into()));
    }
    if pattern.len() > MAX_PATTERN_BYTES {
        return Err(GlobalIndexError::InvalidPattern(format!(
            "pattern exceeds {MAX_PATTERN_BYTES} bytes"
        )));
    }
    if pattern.contains('\0') {
        return Err(GlobalIndexError::InvalidPattern(
            "pattern contains NUL byte".into(),
        ));
    }
    if pattern.contains("../") || pattern.contains("..\\") {
        return Err(GlobalIndexError::InvalidPattern(
            "pattern contains path traversal fragment".into(),
        ));
    }
    let wildcards = pattern.matches('*').count();
    if wildcards > MAX_WILDCARDS {
        return Err(GlobalIndexError::InvalidPattern(format!(
            "pattern has {wildcards} wildcards (max {MAX_WILDCARDS})"
        )));
    }
    let alternations = pattern.matches('|').count();
    if alternations > MAX_ALTERNATIONS {
        return Err(GlobalIndexError::InvalidPattern(format!(
            "pattern has {alternations} alternations (max {MAX_ALTERNATIONS})"
        )));
    }
    Ok(())
}
