//! Stable exit codes for weave CLI commands.

use crate::error::classify;

/// Command succeeded.
pub const OK: i32 = 0;
/// A checkpoint failed; remediation was printed to stderr.
pub const VALIDATION: i32 = 1;
/// Bad input, contention, corrupted state, or a failing external tool.
pub const OPERATIONAL: i32 = 2;

/// Exit code for an error that escaped a command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    match classify(err) {
        Some(weave_err) if weave_err.is_validation() => VALIDATION,
        _ => OPERATIONAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checklist::{CheckResult, Checkpoint, ValidationResult};
    use crate::error::WeaveError;

    #[test]
    fn validation_errors_map_to_one() {
        let result = ValidationResult::from_checks(
            Checkpoint::PreCompletion,
            vec![CheckResult::fail("coverage_threshold", "add tests")],
        );
        let err = anyhow::Error::new(WeaveError::Validation(result)).context("complete 42");
        assert_eq!(for_error(&err), VALIDATION);
    }

    #[test]
    fn everything_else_is_operational() {
        let busy = anyhow::Error::new(WeaveError::Busy { task: 7, attempts: 6 });
        assert_eq!(for_error(&busy), OPERATIONAL);
        assert_eq!(for_error(&anyhow::anyhow!("disk full")), OPERATIONAL);
    }
}
