//! Error & Response Envelope - Closed Taxonomy
//!
//! Every stage failure is tagged with one of the codes below. The taxonomy is
//! closed: no request path may produce anything outside this set, and no
//! request path may produce an HTTP 5xx (see `pipeline::process`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error codes the pipeline may ever report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TemplateDownloadFailed,
    TemplateChecksumMismatch,
    TemplateExtractError,
    TemplateInvalid,
    ManifestLoadError,
    ManifestInvalid,
    AssetNotFound,
    RenderFailed,
    StoreFailed,
    InternalError,
}

impl ErrorCode {
    /// Whether reissuing the identical request may plausibly succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::TemplateDownloadFailed | ErrorCode::StoreFailed
        )
    }
}

/// Structured detail payload attached to a failure. Kept as free-form JSON so
/// each stage can carry whatever shape (`{expected, actual}`, an absolute
/// path, a field name) is natural for its own violation without a combinatorial
/// struct explosion here.
pub type ErrorDetail = serde_json::Value;

/// A single stage error, produced by any of C1-C4 and mapped by the
/// orchestrator into the response envelope.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<ErrorDetail>,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Fallback mapping for any error the stages did not anticipate. Per
    /// the never-500 contract, nothing may propagate past the orchestrator
    /// unmapped - this is the backstop, not a design home for new failures.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Public, serializable error shape embedded in a `Failure` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

impl From<&StageError> for ErrorBody {
    fn from(err: &StageError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            retryable: err.code.retryable(),
            detail: err.detail.clone(),
        }
    }
}

/// An append-only, informational observation. Notes never affect `ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

impl Note {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_and_store_are_retryable() {
        assert!(ErrorCode::TemplateDownloadFailed.retryable());
        assert!(ErrorCode::StoreFailed.retryable());
    }

    #[test]
    fn structural_failures_are_not_retryable() {
        assert!(!ErrorCode::TemplateChecksumMismatch.retryable());
        assert!(!ErrorCode::TemplateExtractError.retryable());
        assert!(!ErrorCode::TemplateInvalid.retryable());
        assert!(!ErrorCode::ManifestLoadError.retryable());
        assert!(!ErrorCode::ManifestInvalid.retryable());
        assert!(!ErrorCode::AssetNotFound.retryable());
        assert!(!ErrorCode::RenderFailed.retryable());
        assert!(!ErrorCode::InternalError.retryable());
    }

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::TemplateChecksumMismatch).unwrap();
        assert_eq!(json, "\"TEMPLATE_CHECKSUM_MISMATCH\"");
    }
}
