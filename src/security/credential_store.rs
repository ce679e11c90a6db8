use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tempfile::NamedTempFile;
use tracing::debug;

/// Fixed keys of the persisted session, named as the dashboard stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AccessToken,
    RefreshToken,
    UserType,
    Username,
}

impl StorageKey {
    pub const ALL: [StorageKey; 4] = [
        StorageKey::AccessToken,
        StorageKey::RefreshToken,
        StorageKey::UserType,
        StorageKey::Username,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::AccessToken => "access_token",
            StorageKey::RefreshToken => "refresh_token",
            StorageKey::UserType => "userType",
            StorageKey::Username => "username",
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide session key/value store.
///
/// Writes are synchronous: once `set` returns, every later `get` observes the
/// new value. `clear` drops every [`StorageKey`] together.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    fn get(&self, key: StorageKey) -> Option<String>;
    fn set(&self, key: StorageKey, value: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;

    fn access_token(&self) -> Option<String> {
        self.get(StorageKey::AccessToken).filter(|t| !t.is_empty())
    }

    fn refresh_token(&self) -> Option<String> {
        self.get(StorageKey::RefreshToken).filter(|t| !t.is_empty())
    }
}

/// JSON file backed store, the on-disk counterpart of browser local storage.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // token values stay out of logs
        f.debug_struct("FileStore").field("path", &self.path).finish()
    }
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty session.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading session file {}", path.display()))?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw).context("parsing session file")?
            }
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), keys = entries.len(), "session store opened");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `entries` to a sibling temp file and rename it over the session file.
    fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent).context("creating session directory")?;
                parent
            }
            None => Path::new("."),
        };
        let body = serde_json::to_vec_pretty(entries).context("serializing session")?;

        let mut tmp = NamedTempFile::new_in(dir).context("creating temporary session file")?;
        tmp.write_all(&body).context("writing temporary session file")?;
        tmp.as_file().sync_all().context("syncing temporary session file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
                .context("restricting session file permissions")?;
        }
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("replacing session file {}", self.path.display()))?;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: StorageKey) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key.as_str()).cloned()
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        // Memory only changes once the file holds the new session.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        next.insert(key.as_str().to_string(), value.to_string());
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        for key in StorageKey::ALL {
            next.remove(key.as_str());
        }
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}
