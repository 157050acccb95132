pub mod media_type;
pub mod payload;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use media_type::{
    extension_for, extension_of, is_signatureless, mime_for_name, sniff, SNIFF_LEN,
};
pub use payload::{ByteSourceAdapter, Payload, PayloadStream, TransferError};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Any account, picked by rotation.
    #[default]
    Single,
    /// A specific account, named by [`UploadTarget::email`].
    Dual,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::Single => "single",
            UploadMode::Dual => "dual",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown upload mode `{0}`")]
pub struct UnknownUploadMode(pub String);

impl FromStr for UploadMode {
    type Err = UnknownUploadMode;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "single" => Ok(UploadMode::Single),
            "dual" => Ok(UploadMode::Dual),
            other => Err(UnknownUploadMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTarget {
    pub email: Option<String>,
}

impl UploadTarget {
    pub fn account(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResult {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub remote_url: String,
}

/// Pending scheduled deletion, keyed by the stored file name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionRecord {
    pub file_name: String,
    pub delete_at_ms: i64,
}

impl DeletionRecord {
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.delete_at_ms <= now_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomFileRecord {
    pub custom_file_name: String,
    pub original_remote_url: String,
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum QuotaReport {
    Usage {
        email: String,
        used: u64,
        total: u64,
        available: u64,
    },
    Unavailable {
        email: String,
        error: String,
    },
}

impl QuotaReport {
    pub fn usage(email: impl Into<String>, used: u64, total: u64) -> Self {
        QuotaReport::Usage {
            email: email.into(),
            used,
            total,
            available: total.saturating_sub(used),
        }
    }

    pub fn email(&self) -> &str {
        match self {
            QuotaReport::Usage { email, .. } | QuotaReport::Unavailable { email, .. } => email,
        }
    }
}
