//! Structural validation results for prepared workflow definitions
//!
//! Validation runs once, when a definition is prepared. Errors block execution
//! (and scheduling of the offending activity); warnings are reported only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Blocks execution
    Error,
    /// Reported to the caller, does not block execution
    Warning,
}

/// A single validation finding attached to an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted path of the activity that produced the finding
    pub activity_path: String,
    /// Display name of the activity
    pub activity_name: String,
    /// Human-readable message
    pub message: String,
    /// Error or warning
    pub severity: Severity,
}

impl ValidationError {
    /// Create an error-level finding
    pub fn error(
        activity_path: impl Into<String>,
        activity_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            activity_path: activity_path.into(),
            activity_name: activity_name.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    /// Create a warning-level finding
    pub fn warning(
        activity_path: impl Into<String>,
        activity_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(activity_path, activity_name, message)
        }
    }

    /// True when this finding blocks execution
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(
            f,
            "{} in '{}' ({}): {}",
            level, self.activity_name, self.activity_path, self.message
        )
    }
}

/// Collected findings for a whole definition tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    findings: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Create an empty result set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finding
    pub fn push(&mut self, finding: ValidationError) {
        self.findings.push(finding);
    }

    /// Append all findings from another set
    pub fn extend(&mut self, other: ValidationErrors) {
        self.findings.extend(other.findings);
    }

    /// All findings, in discovery order
    pub fn findings(&self) -> &[ValidationError] {
        &self.findings
    }

    /// Error-level findings only
    pub fn errors(&self) -> impl Iterator<Item = &ValidationError> {
        self.findings.iter().filter(|f| f.is_error())
    }

    /// Warning-level findings only
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationError> {
        self.findings.iter().filter(|f| !f.is_error())
    }

    /// True when at least one error-level finding exists
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(ValidationError::is_error)
    }

    /// True when no findings were recorded
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of findings
    pub fn len(&self) -> usize {
        self.findings.len()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.findings.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_and_warnings_are_separated() {
        let mut results = ValidationErrors::new();
        results.push(ValidationError::warning("1", "Root", "unused variable 'x'"));
        assert!(!results.has_errors());

        results.push(ValidationError::error("1.1", "Child", "missing argument 'y'"));
        assert!(results.has_errors());
        assert_eq!(results.errors().count(), 1);
        assert_eq!(results.warnings().count(), 1);
    }

    #[test]
    fn test_display_includes_path_and_name() {
        let finding = ValidationError::error("1.2", "Wait", "duplicate bookmark 'go'");
        assert_eq!(
            finding.to_string(),
            "error in 'Wait' (1.2): duplicate bookmark 'go'"
        );
    }
}
