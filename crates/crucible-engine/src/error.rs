//! Engine error taxonomy.

use crucible_providers::ProviderError;
use crucible_store::StoreError;

/// Errors the engine distinguishes when executing a run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The step references a catalogued model whose availability flag is
    /// false. No outbound call is made.
    #[error("model_unavailable: {0} is catalogued but currently unavailable")]
    ModelUnavailable(String),

    /// An explicit deny grant matched, or an owned model had no matching
    /// rule at all.
    #[error("model_grant_denied: {model} for {step_kind} steps")]
    GrantDenied { model: String, step_kind: String },

    /// A `sql` step rendered to something other than a SELECT.
    #[error("sql_forbidden: only SELECT queries are allowed, got: {0}")]
    SqlForbidden(String),

    /// One attempt exceeded the step's timeout.
    #[error("step attempt exceeded {0} ms")]
    StepTimeout(i64),

    /// All retry attempts failed; carries the last cause.
    #[error("step failed after {attempts} attempts: {last}")]
    StepExhausted { attempts: u32, last: String },

    /// The caller's cancellation signal fired.
    #[error("cancelled")]
    RunCancelled,

    /// A `check` step references a missing criteria list.
    #[error("criteria list not found: {0}")]
    CriteriaList(String),

    /// An `http` step got a response status of 400 or above. Carries the
    /// first 500 bytes of the body.
    #[error("http step failed with status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Transport failure inside an `http` step.
    #[error("http step transport error: {0}")]
    HttpTransport(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Errors that retrying cannot fix; the retry loop stops on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ModelUnavailable(_)
                | EngineError::GrantDenied { .. }
                | EngineError::SqlForbidden(_)
                | EngineError::CriteriaList(_)
                | EngineError::RunCancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::SqlForbidden("DELETE".into()).is_fatal());
        assert!(EngineError::ModelUnavailable("vendor/m1".into()).is_fatal());
        assert!(!EngineError::StepTimeout(500).is_fatal());
        assert!(!EngineError::HttpStatus {
            status: 502,
            body: "bad gateway".into()
        }
        .is_fatal());
    }
}
