//! Consent store collaborator.
//!
//! The decision core only reads consent through [`ConsentStore`]; updates
//! go through the same trait so the service layer can expose them. Two
//! implementations are provided:
//!
//! - **`InMemoryConsentStore`**: process-local map, used by tests and as
//!   a scratch store.
//! - **`FileConsentStore`**: JSON document on disk, rewritten atomically
//!   on every update.
//!
//! ## File Layout
//!
//! ```text
//! {
//!   "users": {
//!     "1": { "flags": { "analytics": true, "marketing": false } }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::category::ConsentRecord;
use crate::category::CookieCategory;

/// Errors from a consent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid user id {user_id:?}")]
    InvalidUserId { user_id: String },

    #[error("consent store unavailable: {reason}")]
    Unavailable { reason: String },
}

#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Full record for a user, or `None` if the user does not exist.
    async fn get_record(&self, user_id: &str) -> Result<Option<ConsentRecord>, StoreError>;

    /// Merge `updates` into the user's record, creating the user if needed.
    /// Returns the record as stored afterwards.
    async fn update_consent(
        &self,
        user_id: &str,
        updates: &BTreeMap<CookieCategory, bool>,
    ) -> Result<ConsentRecord, StoreError>;

    /// Stored consent for one category, or `None` if the user does not exist.
    async fn get_consent(
        &self,
        user_id: &str,
        category: CookieCategory,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self
            .get_record(user_id)
            .await?
            .map(|record| record.get(category)))
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.get_record(user_id).await?.is_some())
    }
}

fn validate_user_id(user_id: &str) -> Result<(), StoreError> {
    if user_id.trim().is_empty() {
        return Err(StoreError::InvalidUserId {
            user_id: user_id.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryConsentStore {
    users: RwLock<BTreeMap<String, ConsentRecord>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `users`.
    pub fn with_users<I>(users: I) -> Self
    where
        I: IntoIterator<Item = (String, ConsentRecord)>,
    {
        Self {
            users: RwLock::new(users.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn get_record(&self, user_id: &str) -> Result<Option<ConsentRecord>, StoreError> {
        validate_user_id(user_id)?;
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn update_consent(
        &self,
        user_id: &str,
        updates: &BTreeMap<CookieCategory, bool>,
    ) -> Result<ConsentRecord, StoreError> {
        validate_user_id(user_id)?;
        let mut users = self.users.write().await;
        let record = users.entry(user_id.to_string()).or_default();
        record.apply(updates);
        Ok(record.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConsentDocument {
    #[serde(default)]
    users: BTreeMap<String, ConsentRecord>,
}

/// Borrowed form of [`ConsentDocument`] for writing.
#[derive(Serialize)]
struct ConsentDocumentRef<'a> {
    users: &'a BTreeMap<String, ConsentRecord>,
}

/// JSON-file backed store.
///
/// The document is loaded once at open; reads are served from memory and
/// each update rewrites the file through a `.tmp` sibling.
pub struct FileConsentStore {
    path: PathBuf,
    users: RwLock<BTreeMap<String, ConsentRecord>>,
    write_lock: Mutex<()>,
}

impl FileConsentStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => ConsentDocument::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConsentDocument::default(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(
            "Consent store at {} ({} users)",
            path.display(),
            document.users.len()
        );
        Ok(Self {
            path,
            users: RwLock::new(document.users),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create users that do not exist yet with an empty record.
    pub async fn seed_users(&self, user_ids: &[String]) -> Result<(), StoreError> {
        for user_id in user_ids {
            validate_user_id(user_id)?;
        }
        let _guard = self.write_lock.lock().await;
        let mut next = self.users.read().await.clone();
        let mut changed = false;
        for user_id in user_ids {
            if !next.contains_key(user_id) {
                next.insert(user_id.clone(), ConsentRecord::new());
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        self.commit(next).await
    }

    /// Persist `next`, then publish it. Memory is untouched when the write
    /// fails. Callers hold `write_lock`.
    async fn commit(&self, next: BTreeMap<String, ConsentRecord>) -> Result<(), StoreError> {
        self.persist(&next).await?;
        *self.users.write().await = next;
        Ok(())
    }

    async fn persist(&self, users: &BTreeMap<String, ConsentRecord>) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(&ConsentDocumentRef { users })?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConsentStore for FileConsentStore {
    async fn get_record(&self, user_id: &str) -> Result<Option<ConsentRecord>, StoreError> {
        validate_user_id(user_id)?;
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn update_consent(
        &self,
        user_id: &str,
        updates: &BTreeMap<CookieCategory, bool>,
    ) -> Result<ConsentRecord, StoreError> {
        validate_user_id(user_id)?;
        let _guard = self.write_lock.lock().await;
        let mut next = self.users.read().await.clone();
        let record = next.entry(user_id.to_string()).or_default();
        record.apply(updates);
        let record = record.clone();
        self.commit(next).await?;
        Ok(record)
    }
}
