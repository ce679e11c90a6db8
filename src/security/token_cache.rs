use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use tracing::debug;

use crate::security::credential_store::{CredentialStore, StorageKey};

/// In-memory credential store.
///
/// Clones share the same entries, so one cache can back every gateway in the process.
#[derive(Debug, Clone, Default)]
pub struct TokenCache {
    entries: Arc<RwLock<HashMap<StorageKey, String>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache seeded with a session pair, as left behind by a successful login.
    pub fn with_tokens(access_token: &str, refresh_token: &str) -> Self {
        let cache = Self::new();
        {
            let mut entries = cache.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.insert(StorageKey::AccessToken, access_token.to_string());
            entries.insert(StorageKey::RefreshToken, refresh_token.to_string());
        }
        cache
    }
}

impl CredentialStore for TokenCache {
    fn get(&self, key: StorageKey) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<()> {
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.to_string());
        if key == StorageKey::AccessToken && previous.as_deref() != Some(value) {
            debug!("access token rotated");
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_cache_get_set() {
        let cache = TokenCache::with_tokens("initial_token", "refresh");
        assert_eq!(cache.access_token().as_deref(), Some("initial_token"));

        cache.set(StorageKey::AccessToken, "new_token").unwrap();
        assert_eq!(cache.access_token().as_deref(), Some("new_token"));
        assert_eq!(cache.refresh_token().as_deref(), Some("refresh"));
    }

    #[test]
    fn test_token_cache_clear() {
        let cache = TokenCache::with_tokens("a", "r");
        cache.set(StorageKey::UserType, "candidate").unwrap();
        cache.set(StorageKey::Username, "asha").unwrap();

        cache.clear().unwrap();
        for key in StorageKey::ALL {
            assert!(cache.get(key).is_none());
        }
    }

    #[test]
    fn test_empty_access_token_reads_as_absent() {
        let cache = TokenCache::with_tokens("", "refresh");
        assert!(cache.access_token().is_none());
        assert_eq!(cache.refresh_token().as_deref(), Some("refresh"));
    }

    #[test]
    fn test_token_cache_clone() {
        let cache = TokenCache::with_tokens("token", "refresh");
        let cloned = cache.clone();

        cloned.set(StorageKey::AccessToken, "new_token").unwrap();
        assert_eq!(cache.access_token().as_deref(), Some("new_token"));
    }
}
