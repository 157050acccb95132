use std::time::Duration;

use cdnrelay_cloud::CloudError;
use thiserror::Error;

/// Why a single upload did not produce a linked file.
#[derive(Debug, Error)]
pub enum UploadFailure {
    #[error("file is empty")]
    EmptyPayload,
    #[error("file exceeds {0} bytes")]
    TooLarge(u64),
    #[error("upload timeout after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("link generation failed: {0}")]
    LinkGeneration(String),
    #[error("{0}")]
    Capability(String),
    #[error("could not read upload: {0}")]
    Source(String),
}

impl UploadFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            UploadFailure::EmptyPayload => "empty_payload",
            UploadFailure::TooLarge(_) => "file_too_large",
            UploadFailure::Timeout(_) => "upload_timeout",
            UploadFailure::LinkGeneration(_) => "link_generation_failed",
            UploadFailure::Capability(_) => "upload_failed",
            UploadFailure::Source(_) => "source_read_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("login failed for {email}: {reason}")]
    AccountSetup { email: String, reason: String },
    #[error("no usable storage accounts")]
    NoUsableAccounts,
    #[error("no account for {0}")]
    AccountNotFound(String),
    #[error("Upload failed: {0}")]
    UploadFailed(#[from] UploadFailure),
    #[error("could not find file {0} in any account")]
    FileNotFoundOnSweep(String),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable machine-readable code for transport responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::AccountSetup { .. } => "account_setup_failed",
            RelayError::NoUsableAccounts => "no_usable_accounts",
            RelayError::AccountNotFound(_) => "account_not_found",
            RelayError::UploadFailed(failure) => failure.kind(),
            RelayError::FileNotFoundOnSweep(_) => "file_not_found",
            RelayError::Cloud(CloudError::NotFound(_)) => "file_not_found",
            RelayError::Cloud(CloudError::InvalidLink(_)) => "invalid_link",
            RelayError::Cloud(_) => "storage_error",
            RelayError::Persistence(_) => "persistence_error",
        }
    }

    /// True when the caller supplied something the relay cannot act on.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::AccountNotFound(_)
                | RelayError::UploadFailed(UploadFailure::EmptyPayload)
                | RelayError::UploadFailed(UploadFailure::TooLarge(_))
                | RelayError::UploadFailed(UploadFailure::Source(_))
                | RelayError::Cloud(CloudError::InvalidLink(_))
                | RelayError::Cloud(CloudError::NotFound(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_failures_share_one_prefix_but_keep_their_kind() {
        let err = RelayError::from(UploadFailure::Timeout(Duration::from_secs(300)));
        assert_eq!(err.to_string(), "Upload failed: upload timeout after 300s");
        assert_eq!(err.kind(), "upload_timeout");
        assert!(!err.is_client_error());

        let err = RelayError::from(UploadFailure::EmptyPayload);
        assert_eq!(err.to_string(), "Upload failed: file is empty");
        assert!(err.is_client_error());
    }

    #[test]
    fn oversized_upload_is_a_client_error() {
        let err = RelayError::from(UploadFailure::TooLarge(1024));
        assert_eq!(err.to_string(), "Upload failed: file exceeds 1024 bytes");
        assert_eq!(err.kind(), "file_too_large");
        assert!(err.is_client_error());
    }

    #[test]
    fn missing_account_is_a_client_error() {
        let err = RelayError::AccountNotFound("x@example.com".to_string());
        assert_eq!(err.kind(), "account_not_found");
        assert!(err.is_client_error());
    }
}
