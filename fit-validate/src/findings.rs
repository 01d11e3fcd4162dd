use std::fmt;

use crate::ValidationError;

/// A single validation failure, located at a node path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub location: String,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Failures collected during one validation run.
#[derive(Debug, Default)]
pub struct Findings {
    errors: Vec<Finding>,
    raise_on_error: bool,
}

impl Findings {
    pub fn new(raise_on_error: bool) -> Self {
        Self {
            errors: Vec::new(),
            raise_on_error,
        }
    }

    /// Record a failure.
    ///
    /// When raising on error, the failure is still recorded and then returned as
    /// [`ValidationError::Aborted`] so that `?` unwinds the whole run.
    pub fn fail(
        &mut self,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let finding = Finding {
            location: location.into(),
            message: message.into(),
        };
        tracing::trace!(%finding, "validation failure");
        self.errors.push(finding.clone());

        if self.raise_on_error {
            Err(ValidationError::Aborted(finding))
        } else {
            Ok(())
        }
    }

    pub fn errors(&self) -> &[Finding] {
        &self.errors
    }

    pub(crate) fn clear(&mut self) {
        self.errors.clear();
    }
}
