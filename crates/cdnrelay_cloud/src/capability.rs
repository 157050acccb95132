use async_trait::async_trait;
use cdnrelay_transfer::PayloadStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("login rejected for {0}")]
    LoginRejected(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("link issuance failed: {0}")]
    Link(String),
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("invalid public link: {0}")]
    InvalidLink(String),
    #[error("quota unavailable: {0}")]
    Quota(String),
    #[error("credential store failure: {0}")]
    Credential(String),
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Completion signal of a finished transfer; feed it to [`CloudSession::link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub handle: String,
    pub name: String,
    pub size: u64,
}

/// One entry of an account's file listing. `handle` is what `delete` acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub used: u64,
    pub total: u64,
}

/// Attributes of a file reachable through a public link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// An authenticated handle bound to one account. Not safe for concurrent
/// use: callers serialize every operation on a session.
#[async_trait]
pub trait CloudSession: Send + Sync {
    async fn upload(
        &self,
        name: &str,
        size: u64,
        body: PayloadStream,
    ) -> Result<CompletedUpload, CloudError>;

    async fn link(&self, upload: &CompletedUpload) -> Result<String, CloudError>;

    async fn list_files(&self) -> Result<Vec<RemoteFile>, CloudError>;

    async fn delete(&self, file: &RemoteFile) -> Result<(), CloudError>;

    async fn quota(&self) -> Result<Quota, CloudError>;
}

#[async_trait]
pub trait CloudStorage: Send + Sync {
    async fn login(
        &self,
        email: &str,
        credential: &str,
    ) -> Result<Box<dyn CloudSession>, CloudError>;

    /// Resolves a public link without an account session.
    async fn describe(&self, remote_url: &str) -> Result<LinkedFile, CloudError>;

    async fn download(&self, remote_url: &str) -> Result<(LinkedFile, PayloadStream), CloudError>;

    /// Every public link issued by this provider starts with this prefix.
    fn link_prefix(&self) -> &str;

    fn media_token(&self, remote_url: &str) -> Result<String, CloudError> {
        PublicLink::parse(self.link_prefix(), remote_url).map(|link| link.media_token())
    }

    fn url_from_media_token(&self, token: &str) -> Result<String, CloudError> {
        PublicLink::from_media_token(token).map(|link| link.to_url(self.link_prefix()))
    }
}

/// `<prefix><handle>#<key>`; exposed over HTTP as `<handle>@<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicLink {
    pub handle: String,
    pub key: String,
}

impl PublicLink {
    pub fn parse(prefix: &str, url: &str) -> Result<Self, CloudError> {
        let rest = url
            .strip_prefix(prefix)
            .ok_or_else(|| CloudError::InvalidLink(url.to_string()))?;
        Self::split(rest, '#').ok_or_else(|| CloudError::InvalidLink(url.to_string()))
    }

    pub fn from_media_token(token: &str) -> Result<Self, CloudError> {
        Self::split(token, '@').ok_or_else(|| CloudError::InvalidLink(token.to_string()))
    }

    pub fn media_token(&self) -> String {
        format!("{}@{}", self.handle, self.key)
    }

    pub fn to_url(&self, prefix: &str) -> String {
        format!("{prefix}{}#{}", self.handle, self.key)
    }

    fn split(raw: &str, separator: char) -> Option<Self> {
        let (handle, key) = raw.split_once(separator)?;
        let valid = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric());
        if valid(handle) && valid(key) {
            Some(Self {
                handle: handle.to_string(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "memory://file/";

    #[test]
    fn media_token_maps_back_to_the_same_url() {
        let url = "memory://file/ab12#k9";
        let link = PublicLink::parse(PREFIX, url).expect("parse");
        assert_eq!(link.media_token(), "ab12@k9");

        let back = PublicLink::from_media_token("ab12@k9").expect("token");
        assert_eq!(back.to_url(PREFIX), url);
    }

    #[test]
    fn foreign_or_malformed_links_are_rejected() {
        assert!(PublicLink::parse(PREFIX, "https://elsewhere/ab#cd").is_err());
        assert!(PublicLink::parse(PREFIX, "memory://file/abcd").is_err());
        assert!(PublicLink::from_media_token("../etc@passwd").is_err());
        assert!(PublicLink::from_media_token("@key").is_err());
    }
}
