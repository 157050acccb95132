use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use cdnrelay_cloud::{CloudError, CloudSession, CloudStorage};
use cdnrelay_transfer::{UploadMode, UploadTarget};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::RelayError;

/// One `email:password` entry of the configured credential list.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountCredential {
    pub email: String,
    pub secret: String,
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("email", &self.email)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Splits `a@x:pw;b@y:pw` into credentials. The password is everything after
/// the first `:`. Entries missing either half are dropped with a warning.
pub fn parse_credentials(raw: &str) -> Vec<AccountCredential> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(':') {
            Some((email, secret)) if !email.trim().is_empty() && !secret.trim().is_empty() => {
                Some(AccountCredential {
                    email: email.trim().to_string(),
                    secret: secret.trim().to_string(),
                })
            }
            _ => {
                let email = entry.split(':').next().unwrap_or_default();
                warn!(account = %email, "ignoring malformed credential entry");
                None
            }
        })
        .collect()
}

/// An authenticated storage identity. All session calls go through
/// [`Account::lock`], so at most one operation runs against it at a time.
pub struct Account {
    email: String,
    session: Mutex<Box<dyn CloudSession>>,
}

impl Account {
    pub fn new(email: impl Into<String>, session: Box<dyn CloudSession>) -> Self {
        Self {
            email: email.into(),
            session: Mutex::new(session),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn CloudSession>> {
        self.session.lock().await
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Fixed set of logged-in accounts. Membership never changes after
/// [`AccountPool::initialize`].
#[derive(Debug)]
pub struct AccountPool {
    accounts: Vec<Account>,
    cursor: AtomicUsize,
}

impl AccountPool {
    pub async fn initialize(cloud: &dyn CloudStorage, credentials: &str) -> Result<Self, RelayError> {
        let mut seen = HashSet::new();
        let mut accounts = Vec::new();

        for credential in parse_credentials(credentials) {
            if !seen.insert(credential.email.clone()) {
                warn!(account = %credential.email, "duplicate account entry skipped");
                continue;
            }

            match cloud.login(&credential.email, &credential.secret).await {
                Ok(session) => {
                    info!(account = %credential.email, "logged into storage account");
                    accounts.push(Account::new(credential.email, session));
                }
                Err(err) => {
                    let failure = RelayError::AccountSetup {
                        email: credential.email,
                        reason: err.to_string(),
                    };
                    warn!(error = %failure, "storage account skipped");
                }
            }
        }

        Self::from_accounts(accounts)
    }

    pub fn from_accounts(accounts: Vec<Account>) -> Result<Self, RelayError> {
        if accounts.is_empty() {
            return Err(RelayError::NoUsableAccounts);
        }
        Ok(Self {
            accounts,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn select_round_robin(&self) -> &Account {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.accounts.len();
        &self.accounts[index]
    }

    pub fn select_by_identity(&self, email: &str) -> Result<&Account, RelayError> {
        self.accounts
            .iter()
            .find(|account| account.email == email)
            .ok_or_else(|| RelayError::AccountNotFound(email.to_string()))
    }

    /// `dual` pins to the hinted account; without a hint it rotates like `single`.
    pub fn select(&self, mode: UploadMode, target: &UploadTarget) -> Result<&Account, RelayError> {
        match (mode, target.email.as_deref()) {
            (UploadMode::Dual, Some(email)) => self.select_by_identity(email),
            _ => Ok(self.select_round_robin()),
        }
    }

    /// Accounts in pool order. Each call starts a fresh pass.
    pub fn all(&self) -> std::slice::Iter<'_, Account> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn emails(&self) -> Vec<String> {
        self.all().map(|account| account.email.clone()).collect()
    }

    /// Walks the pool in order and deletes the first file named `name`.
    /// Returns the account it was removed from. Stops at the first match even
    /// when that delete fails, so a file is never deleted twice.
    pub async fn delete_by_name(&self, name: &str) -> Result<Option<String>, CloudError> {
        for account in self.all() {
            let session = account.lock().await;
            let files = match session.list_files().await {
                Ok(files) => files,
                Err(err) => {
                    warn!(account = %account.email, error = %err, "could not list account files");
                    continue;
                }
            };

            if let Some(file) = files.iter().find(|file| file.name == name) {
                session.delete(file).await?;
                return Ok(Some(account.email.clone()));
            }
        }
        Ok(None)
    }
}
