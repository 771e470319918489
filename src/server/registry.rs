//! Token registry: which files are currently streamable, and under what URL.
//!
//! A path is mapped to one random token for as long as it is open. URLs
//! carry only the token, never the path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::ServeError;
use crate::crypto::utils::generate_token;

#[derive(Default)]
struct Entries {
    /// path -> (token, url)
    by_path: HashMap<PathBuf, (String, String)>,
    /// token -> path
    by_token: HashMap<String, PathBuf>,
}

/// Path/token mappings under one lock. Lookups share the lock; issuing and
/// revoking take it exclusively, including whatever server start/stop they
/// trigger, so they are linearizable.
#[derive(Default)]
pub struct TokenRegistry {
    entries: RwLock<Entries>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the stream URL for `path`, creating a token on first use.
    ///
    /// `ensure_server` runs only for new paths and returns the base URL
    /// (`http://{ip}:{port}/`) the token is appended to.
    pub fn issue<F>(&self, path: &Path, ensure_server: F) -> Result<String, ServeError>
    where
        F: FnOnce() -> Result<String, ServeError>,
    {
        let mut entries = self.write();
        if let Some((_, url)) = entries.by_path.get(path) {
            return Ok(url.clone());
        }

        let base = ensure_server()?;
        let mut token = generate_token();
        while entries.by_token.contains_key(&token) {
            token = generate_token();
        }
        let url = format!("{}v={}", base, token);

        entries.by_token.insert(token.clone(), path.to_path_buf());
        entries
            .by_path
            .insert(path.to_path_buf(), (token, url.clone()));
        log::info!("Streaming {} at {}", path.display(), url);
        Ok(url)
    }

    /// Forget `path`. If it was the last open path, `on_empty` runs before
    /// the lock is released. Returns false if `path` was not open.
    pub fn revoke<F: FnOnce()>(&self, path: &Path, on_empty: F) -> bool {
        let mut entries = self.write();
        let Some((token, _)) = entries.by_path.remove(path) else {
            return false;
        };
        entries.by_token.remove(&token);
        log::info!("Stopped streaming {}", path.display());

        if entries.by_path.is_empty() {
            on_empty();
        }
        true
    }

    pub fn resolve(&self, token: &str) -> Option<PathBuf> {
        self.read().by_token.get(token).cloned()
    }

    pub fn url_for(&self, path: &Path) -> Option<String> {
        self.read().by_path.get(path).map(|(_, url)| url.clone())
    }

    pub fn len(&self) -> usize {
        self.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const BASE: &str = "http://localhost:1234/";

    fn base() -> Result<String, ServeError> {
        Ok(BASE.to_string())
    }

    fn token_of(url: &str) -> &str {
        url.rsplit_once("v=").unwrap().1
    }

    #[test]
    fn test_issue_is_idempotent() {
        let registry = TokenRegistry::new();
        let calls = Cell::new(0);
        let ensure = || {
            calls.set(calls.get() + 1);
            base()
        };

        let first = registry.issue(Path::new("/m/a.mp4"), ensure).unwrap();
        let second = registry
            .issue(Path::new("/m/a.mp4"), || {
                calls.set(calls.get() + 1);
                base()
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert!(first.starts_with("http://localhost:1234/v="));
        assert_eq!(token_of(&first).len(), 32);
    }

    #[test]
    fn test_distinct_paths_get_distinct_tokens() {
        let registry = TokenRegistry::new();
        let a = registry.issue(Path::new("/m/a.mp4"), base).unwrap();
        let b = registry.issue(Path::new("/m/b.mp4"), base).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resolve_and_revoke() {
        let registry = TokenRegistry::new();
        let url = registry.issue(Path::new("/m/a.mp4"), base).unwrap();
        let token = token_of(&url).to_string();
        assert_eq!(registry.resolve(&token), Some(PathBuf::from("/m/a.mp4")));

        assert!(registry.revoke(Path::new("/m/a.mp4"), || {}));
        assert_eq!(registry.resolve(&token), None);
        assert_eq!(registry.url_for(Path::new("/m/a.mp4")), None);
    }

    #[test]
    fn test_revoke_unknown_path_is_noop() {
        let registry = TokenRegistry::new();
        let emptied = Cell::new(false);
        assert!(!registry.revoke(Path::new("/nope"), || emptied.set(true)));
        assert!(!emptied.get());
    }

    #[test]
    fn test_on_empty_runs_only_for_last_path() {
        let registry = TokenRegistry::new();
        registry.issue(Path::new("/m/a.mp4"), base).unwrap();
        registry.issue(Path::new("/m/b.mp4"), base).unwrap();

        let emptied = Cell::new(0);
        registry.revoke(Path::new("/m/a.mp4"), || emptied.set(emptied.get() + 1));
        assert_eq!(emptied.get(), 0);
        registry.revoke(Path::new("/m/b.mp4"), || emptied.set(emptied.get() + 1));
        assert_eq!(emptied.get(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reopen_after_close_gets_new_token() {
        let registry = TokenRegistry::new();
        let first = registry.issue(Path::new("/m/a.mp4"), base).unwrap();
        registry.revoke(Path::new("/m/a.mp4"), || {});
        let second = registry.issue(Path::new("/m/a.mp4"), base).unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.resolve(token_of(&first)), None);
    }

    #[test]
    fn test_failed_server_start_issues_nothing() {
        let registry = TokenRegistry::new();
        let err = registry
            .issue(Path::new("/m/a.mp4"), || {
                Err(ServeError::Internal("bind failed".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, ServeError::Internal(_)));
        assert!(registry.is_empty());
    }
}
