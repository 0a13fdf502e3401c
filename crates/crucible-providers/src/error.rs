//! Error taxonomy of the dispatcher.

/// Errors a provider call can surface. The engine distinguishes these
/// kinds when deciding retry behavior.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429 from the backend; the caller may retry.
    #[error("provider {provider} rate limited model {model}")]
    RateLimited { provider: String, model: String },

    /// Non-200 status, transport failure, or response decode failure.
    /// `detail` carries at most the first 200 bytes of the body.
    #[error("provider {provider} wire error for model {model}: {detail}")]
    Wire {
        provider: String,
        model: String,
        detail: String,
    },

    /// An explicit per-provider call named a provider that is not
    /// configured.
    #[error("no provider named '{0}' is configured")]
    NotFound(String),

    /// Building the underlying HTTP client failed.
    #[error("failed to build http client: {0}")]
    Client(String),
}

impl ProviderError {
    /// Whether the caller may sensibly retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Wire { .. }
        )
    }
}

/// Truncate an error body to its first 200 bytes, respecting UTF-8
/// boundaries.
pub fn truncate_body(body: &str) -> String {
    truncate_at(body, 200)
}

/// Truncate `text` to at most `limit` bytes without splitting a
/// multi-byte character.
pub fn truncate_at(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_body_unchanged() {
        assert_eq!(truncate_body("tiny"), "tiny");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(150); // 300 bytes
        let truncated = truncate_body(&body);
        assert!(truncated.len() <= 200);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::RateLimited {
            provider: "p".into(),
            model: "m".into()
        }
        .is_retryable());
        assert!(!ProviderError::NotFound("p".into()).is_retryable());
    }
}
